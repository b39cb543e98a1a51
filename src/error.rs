use thiserror::Error;

/// Everything that can go wrong while driving a generation run.
///
/// `Aborted` is a termination class, not a failure: callers that receive it
/// should end the run quietly and keep whatever content was already buffered.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The run's cancellation token fired before the stream finished.
    #[error("generation aborted")]
    Aborted,

    /// The backend answered with a non-success HTTP status.
    #[error("backend returned HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// Connection-level failure (DNS, refused, reset mid-stream).
    #[error("network error: {0}")]
    Connect(#[from] reqwest::Error),

    /// A stream frame that could not be decoded. Recovered per-frame by the
    /// SSE parser; only surfaces when a caller decodes payloads directly.
    #[error("malformed stream frame: {0}")]
    Parse(#[from] serde_json::Error),

    /// Snapshot save/load failure. Never fatal to a run — load falls back to
    /// the empty set, save failures are logged and skipped.
    #[error("snapshot persistence failed: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl GenerationError {
    /// True for the quiet-termination class that callers must not surface
    /// as a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, GenerationError::Aborted)
    }
}
