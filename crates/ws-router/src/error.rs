use http::StatusCode;
use thiserror::Error;

/// Contract violations by route or middleware code.
///
/// These are returned to the caller that broke the contract. When the
/// violation happens during an upgrade attempt, the attempt is also resolved
/// in-band, so a buggy handler never leaves a client hanging.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// The decision callback was given something that is neither a
    /// connection handler nor a rejection.
    #[error("websocket accept requires a connection handler, got {0}")]
    NotAHandler(String),

    /// A decision was attempted after the upgrade was already resolved.
    #[error("websocket upgrade has already been handled")]
    AlreadyHandled,

    /// An HTTP response was written twice.
    #[error("response has already been sent")]
    ResponseAlreadySent,
}

/// Error raised by a middleware, route or error handler.
///
/// Returning `Err` from a handler switches dispatch into error mode, where
/// only error middleware runs.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RouteError {
    /// Build an error that resolves to `status` when nothing handles it.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// The status code reported when this error reaches the final handler.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } => *status,
            Self::Usage(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the usage error this wraps, if any.
    pub fn as_usage(&self) -> Option<&UsageError> {
        match self {
            Self::Usage(err) => Some(err),
            _ => None,
        }
    }
}

/// Invalid [`WsOptions`](crate::WsOptions) values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("websocket method name must not be empty")]
    EmptyMethod,

    #[error("websocket method name '{0}' is not a valid HTTP method token")]
    InvalidMethod(String),

    #[error("websocket method name '{0}' collides with a standard HTTP method")]
    ReservedMethod(String),
}
