use std::sync::Arc;

/// Error type returned by this crate.
///
/// Errors are cheap to clone so that a single close reason can be delivered
/// to every operation that was pending on a stream or connection.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HranaError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(Arc<reqwest::Error>),
    /// WebSocket connection failure or unexpected close.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// Non-success HTTP status code returned by the server.
    #[error("http server error {status}: {message}")]
    HttpServer { status: u16, message: String },
    /// The server rejected a well-formed request.
    #[error("{message}")]
    Response {
        /// Error message text from the server.
        message: String,
        /// Optional machine-readable error code.
        code: Option<String>,
    },
    /// Malformed or unexpected data on the wire.
    #[error("protocol error: {0}")]
    Proto(String),
    /// Operation attempted on a closed stream, client, cursor or SQL handle.
    #[error("{message}")]
    Closed {
        message: String,
        /// Error that caused the close, if it was not requested by the caller.
        cause: Option<Arc<HranaError>>,
    },
    /// A feature above the negotiated protocol version was used.
    #[error("{feature} requires protocol version {min_version}, but the server uses version {actual_version}")]
    ProtocolVersion {
        feature: &'static str,
        min_version: u32,
        actual_version: u32,
    },
    /// Local contract violation by the caller.
    #[error("misuse: {0}")]
    Misuse(String),
    /// Local invariant violation inside the client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HranaError {
    pub(crate) fn closed(message: impl Into<String>, cause: Option<HranaError>) -> Self {
        HranaError::Closed {
            message: message.into(),
            cause: cause.map(Arc::new),
        }
    }

    pub(crate) fn proto(message: impl Into<String>) -> Self {
        HranaError::Proto(message.into())
    }

    pub(crate) fn response(error: crate::wire::Error) -> Self {
        HranaError::Response {
            message: error.message,
            code: error.code,
        }
    }

    /// Returns the server error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            HranaError::Response { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Returns the error that caused a [`HranaError::Closed`].
    pub fn cause(&self) -> Option<&HranaError> {
        match self {
            HranaError::Closed { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HranaError {
    fn from(err: reqwest::Error) -> Self {
        HranaError::Transport(Arc::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HranaError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        HranaError::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::HranaError;
    use crate::wire;

    #[test]
    fn closed_error_carries_cause() {
        let cause = HranaError::WebSocket("connection reset".to_owned());
        let err = HranaError::closed("stream is closed", Some(cause));
        match err.cause() {
            Some(HranaError::WebSocket(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[test]
    fn response_error_exposes_code() {
        let err = HranaError::response(wire::Error {
            message: "no such table: t".to_owned(),
            code: Some("SQLITE_ERROR".to_owned()),
        });
        assert_eq!(err.code(), Some("SQLITE_ERROR"));
        assert_eq!(err.to_string(), "no such table: t");
    }
}
