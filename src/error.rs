use thiserror::Error;

/// Reasons a student's billing status cannot be computed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    /// Required student or group fields are missing.
    #[error("status unknown: {0}")]
    Unknown(String),

    /// The group's schedule does not resolve to any lesson day.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl StatusError {
    /// Neutral badge for rows whose status cannot be computed yet.
    pub fn badge_text(&self) -> &'static str {
        match self {
            StatusError::Unknown(_) => "Unknown",
            StatusError::Configuration(_) => "Schedule error",
        }
    }
}

/// Operator input that cannot be dispatched or recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no group selected")]
    GroupNotSelected,

    #[error("no student selected")]
    StudentNotSelected,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("student {student} has no messaging handle")]
    MissingHandle { student: String },

    #[error("payment amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("payment date is required")]
    MissingDate,

    #[error("debt cycle {0} not found")]
    UnknownDebtCycle(u32),
}

/// The outbound sink did not accept a batch. No key of the batch is marked sent.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notification sink unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification sink rejected batch with status {status}")]
    Rejected { status: u16 },

    #[error("notification batch could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}
