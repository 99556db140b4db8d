use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("ping failed: {0}")]
    PingFailed(String),
}
