use thiserror::Error;

/// Failure conditions surfaced by the phone core.
///
/// Recoverable conditions (ownership mismatch on load, extraction failure
/// during initial generation) are absorbed inside [`crate::session`] and never
/// reach callers as errors; everything here is distinguishable by match.
#[derive(Debug, Error)]
pub enum PhoneError {
    #[error("no existing phone data; run initial generation first")]
    NoSnapshot,

    #[error("update batch carries no updates")]
    EmptyBatch,

    #[error("malformed update batch: {reason}")]
    MalformedBatch { reason: String },

    #[error("version index {index} out of range (history has {len} entries)")]
    OutOfRange { index: usize, len: usize },

    #[error("another generation or update is already in flight")]
    OperationInFlight,

    #[error("fact extraction failed: {0}")]
    Extraction(String),

    #[error("snapshot store failure: {0}")]
    Store(String),
}
