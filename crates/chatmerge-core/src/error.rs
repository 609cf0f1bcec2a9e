//! Error types for chatmerge-core.

use std::fmt;

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Two entities violate a storage invariant, e.g. messages that are
    /// indistinguishable under the ordering relation yet not equal.
    #[error("Data integrity error in {context}: {details}")]
    DataIntegrity { context: String, details: String },

    /// The two snapshots disagree by a constant clock offset. Fatal for the
    /// affected chat; the caller is expected to shift one dataset and retry.
    #[error("{0}")]
    TimeShift(TimeShiftError),

    /// Cooperative cancellation. A distinct terminal state, not a failure.
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result type alias using Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Details of a detected cross-dataset time shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeShiftError {
    /// Qualified name of the chat the shift was detected in.
    pub chat: String,
    /// Positive when the slave clock is ahead of the master clock.
    pub shift_secs: i64,
}

impl fmt::Display for TimeShiftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ahead, behind, secs) = if self.shift_secs >= 0 {
            ("slave", "master", self.shift_secs)
        } else {
            ("master", "slave", -self.shift_secs)
        };
        write!(
            f,
            "chat {}: {ahead} is ahead of {behind} by {secs} sec ({})",
            self.chat,
            hours_text(secs)
        )
    }
}

fn hours_text(secs: i64) -> String {
    if secs % 3600 == 0 {
        let hours = secs / 3600;
        format!("{hours} hr{}", if hours == 1 { "" } else { "s" })
    } else {
        format!("{:.1} hrs", secs as f64 / 3600.0)
    }
}
