use thiserror::Error;

/// Classified failures, so the job runner can pick a retry policy from the
/// error kind instead of guessing from incidental error types.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level trouble: timeouts, connection resets, rate limits,
    /// upstream 5xx. Worth retrying.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// The remote platform rejected the request (4xx). Retrying the same
    /// call will not help.
    #[error("permanent API error (status {status}): {message}")]
    Permanent { status: u16, message: String },

    /// A data invariant failed: duplicate dedupe key, missing account id,
    /// malformed rule configuration. Treated as a no-op by callers, never
    /// retried.
    #[error("invariant: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::Invariant(msg.into())
    }
}

/// Decide retry behavior for an arbitrary job error: retry only when the
/// underlying cause is classified transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<EngineError>())
        .any(EngineError::is_retryable)
}
