use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CohostError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("operation already pending for {0}")]
    AlreadyPending(String),
    #[error("co-host seats are full")]
    SeatsFull,
    #[error("a battle round is already active: {0}")]
    RoundAlreadyActive(String),
    #[error("network failure ({code}): {message}")]
    NetworkFailure { code: i32, message: String },
    #[error("session closed: {0}")]
    SessionClosed(String),
}

/// Failure reported by the vendor signaling layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signaling error {code}: {message}")]
pub struct SignalingError {
    pub code: i32,
    pub message: String,
}

impl From<SignalingError> for CohostError {
    fn from(e: SignalingError) -> Self {
        Self::NetworkFailure {
            code: e.code,
            message: e.message,
        }
    }
}
