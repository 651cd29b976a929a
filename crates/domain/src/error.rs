/// Shared error type used across all worldline runtime crates.
///
/// Cross-component failures are always a typed variant here or a reified
/// tool-result payload; exceptions-as-control-flow never cross a crate
/// boundary.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Caller error: empty message, non-read-only SQL, unknown tool,
    /// malformed subagent task. Surfaced before side effects.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure in the event store: the worldline
    /// head moved between read and append.
    #[error("head conflict: {0}")]
    HeadConflict(String),

    /// A capacity pool's queue is full; the caller never entered the pool.
    #[error("capacity limit: {0}")]
    CapacityLimit(String),

    /// The sandbox pool's creation queue is full. Treated as a transient
    /// tool error by the dispatcher.
    #[error("sandbox capacity: {0}")]
    SandboxCapacity(String),

    #[error("sandbox: {0}")]
    Sandbox(String),

    #[error("llm: {0}")]
    Llm(String),

    #[error("shutting down: {0}")]
    Shutdown(String),
}

impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn head_conflict(msg: impl Into<String>) -> Self {
        Self::HeadConflict(msg.into())
    }

    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }

    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    pub fn sandbox(msg: impl Into<String>) -> Self {
        Self::Sandbox(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
