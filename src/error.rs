use thiserror::Error;

/// Persistence contract failures. Reads are retried once by callers; a failed
/// append is surfaced as a hard error because a lost append breaks transcript
/// ordering.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("append failed: {0}")]
    Append(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session is closed: {0}")]
    SessionClosed(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response had no content")]
    EmptyCompletion,
    #[error("provider timed out after {0}ms")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}
