//! Span and operation names shared by the dispatcher and its callers.
//!
//! Every dispatch runs in a span named [`SPAN_DISPATCH`] carrying
//! `operation`, `mode` and `dispatch_id` fields. Provider-level events carry
//! `provider`, plus `attempt`/`delay_ms` on retries and `error` on failures.

/// Span wrapping one dispatch call.
pub const SPAN_DISPATCH: &str = "dispatch";

/// Span wrapping a whole `swb simulate` run.
pub const SPAN_SIMULATE: &str = "simulate";

// --- Operation name values ---

/// Operation label used when the caller does not supply one.
pub const OP_COMPLETION: &str = "completion";

/// Requests issued by the simulation workload.
pub const OP_SIMULATE: &str = "simulate";

// --- Mode values ---

pub const MODE_BUFFERED: &str = "buffered";
pub const MODE_STREAM: &str = "stream";
