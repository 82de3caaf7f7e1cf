//! Error taxonomy for the moderation core.
//!
//! Expected contention and missing records are ordinary return values
//! on the operations that produce them, never errors. Generator and
//! notifier failures travel as `anyhow::Error` at the trait seams.
//! Only persistence and corruption failures propagate as hard errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// I/O failure while saving or loading the moderation state.
    /// Transient: the caller may retry.
    #[error("failed to persist moderation state: {0}")]
    Persistence(#[from] std::io::Error),

    /// The persisted snapshot could not be parsed and the backup
    /// recovery chain is exhausted. Operator attention required.
    #[error("persisted moderation state is corrupt: {0}")]
    CorruptState(String),
}
