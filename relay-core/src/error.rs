use thiserror::Error;

/// Errors surfaced by the transfer engine.
///
/// Every pipeline failure is folded into one of these kinds before it is
/// reported on the event stream; nothing panics across the API boundary.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("invalid transfer code: {0}")]
    InvalidCode(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("peer rejected the transfer")]
    PeerRejected,
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Transfer(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
