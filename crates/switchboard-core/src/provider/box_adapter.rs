//! BoxProviderAdapter -- object-safe dynamic dispatch wrapper for ProviderAdapter.
//!
//! 1. `ProviderAdapterDyn` is an object-safe mirror with boxed futures
//! 2. Blanket impl of `ProviderAdapterDyn` for every `T: ProviderAdapter`
//! 3. `BoxProviderAdapter` wraps `Box<dyn ProviderAdapterDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use switchboard_types::error::ProviderError;
use switchboard_types::llm::{CompletionRequest, CompletionResponse, HealthReport};

use super::adapter::{ChunkStream, ProviderAdapter};

/// Object-safe version of [`ProviderAdapter`].
pub trait ProviderAdapterDyn: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn is_available(&self) -> bool;

    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'a>>;

    fn complete_stream_boxed(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream;

    fn health_check_boxed(&self) -> Pin<Box<dyn Future<Output = HealthReport> + Send + '_>>;
}

impl<T: ProviderAdapter> ProviderAdapterDyn for T {
    fn name(&self) -> &str {
        ProviderAdapter::name(self)
    }

    fn model(&self) -> &str {
        ProviderAdapter::model(self)
    }

    fn is_available(&self) -> bool {
        ProviderAdapter::is_available(self)
    }

    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'a>> {
        Box::pin(self.complete(request, cancel))
    }

    fn complete_stream_boxed(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream {
        self.complete_stream(request, cancel)
    }

    fn health_check_boxed(&self) -> Pin<Box<dyn Future<Output = HealthReport> + Send + '_>> {
        Box::pin(self.health_check())
    }
}

/// Type-erased adapter so a chain can hold heterogeneous providers.
pub struct BoxProviderAdapter {
    inner: Box<dyn ProviderAdapterDyn>,
}

impl BoxProviderAdapter {
    pub fn new<T: ProviderAdapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn model(&self) -> &str {
        self.inner.model()
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        self.inner.complete_boxed(request, cancel).await
    }

    pub fn complete_stream(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream {
        self.inner.complete_stream_boxed(request, cancel)
    }

    pub async fn health_check(&self) -> HealthReport {
        self.inner.health_check_boxed().await
    }
}

impl std::fmt::Debug for BoxProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxProviderAdapter")
            .field("name", &self.name())
            .field("model", &self.model())
            .finish()
    }
}
