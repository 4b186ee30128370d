use thiserror::Error;

/// Per-entry configuration errors.
///
/// These reject a single entry from scheduling; they never abort a sync or a
/// tick for the other entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("unknown frequency: {0}")]
    UnknownFrequency(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid send time: {0}")]
    InvalidSendTime(String),
}
