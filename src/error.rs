use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single forwarded request that did not produce a response.
///
/// Each variant resolves exactly one waiting caller; none of them is fatal to
/// the channel the request travelled over.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no tunnel registered for identifier {0:?}")]
    TunnelNotFound(String),

    #[error("tunnel {0:?} is not accepting requests")]
    TunnelUnavailable(String),

    #[error("no response from tunnel within {0:?}")]
    RequestTimeout(Duration),

    #[error("local service request failed: {0}")]
    LocalForward(String),

    #[error("tunnel disconnected before responding")]
    TunnelDisconnected,

    /// A correlation id was registered twice. Correlation can no longer be
    /// trusted for that request.
    #[error("request id {0:?} is already pending")]
    DuplicateRequest(String),
}

impl RelayError {
    /// HTTP status surfaced to the public caller.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            Self::TunnelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::LocalForward(_) | Self::TunnelDisconnected => StatusCode::BAD_GATEWAY,
            Self::DuplicateRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
