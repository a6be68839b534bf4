use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("resolution {0}")]
    Resolution(String),
    #[error("send {0}")]
    Send(String),
    #[error("service {0}")]
    Service(String),
    #[error("timeout")]
    Timeout,
    #[error("no reply")]
    NoReply,
    #[error("closed")]
    Closed,
}

impl CoreError {
    /// The no-reply/timeout class is the only one that is retried
    /// automatically.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout | CoreError::NoReply)
    }
}
