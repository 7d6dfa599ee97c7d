use realtime_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid subscription request: {0}")]
    InvalidRequest(String),
    #[error("realtime hub requires a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type HubResult<T> = Result<T, HubError>;
