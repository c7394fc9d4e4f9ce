//! ProviderAdapter trait definition.
//!
//! The uniform capability contract every inference provider implements. The
//! dispatcher never sees vendor request shapes, only this trait.

use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use switchboard_types::error::ProviderError;
use switchboard_types::llm::{CompletionRequest, CompletionResponse, HealthReport, StreamChunk};

/// Incremental output of one adapter call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send + 'static>>;

/// A provider backend (OpenAI, Anthropic, a simulator, ...).
///
/// Uses RPITIT for `complete` and `health_check`, and a boxed stream for
/// `complete_stream` so `BoxProviderAdapter` stays object-safe.
///
/// Implementations must observe `cancel`: once it fires they should return
/// `ProviderError::Cancelled` (or end the stream) promptly.
pub trait ProviderAdapter: Send + Sync {
    /// Stable name used for breaker and admission keys.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Whether credentials are configured. Unavailable adapters are skipped.
    fn is_available(&self) -> bool;

    /// Buffered completion.
    fn complete(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send;

    /// Incremental completion. The stream should end with a `Final` chunk.
    fn complete_stream(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream;

    fn health_check(&self) -> impl Future<Output = HealthReport> + Send;
}
