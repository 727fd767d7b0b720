use thiserror::Error;

/// Unified error type for hlsgate.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Access Denied: {0}")]
    Denied(String),

    #[error("Invalid or missing API key")]
    ApiKeyInvalid,

    #[error("File Not Found")]
    NotFound,

    #[error("Range Not Satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("Client Closed Request")]
    ClientClosed,

    #[error("Bad Gateway: {0}")]
    Upstream(String),

    #[error("Gateway Timeout")]
    UpstreamTimeout,

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl GateError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GateError::BadRequest(_) => 400,
            GateError::Denied(_) => 403,
            GateError::ApiKeyInvalid => 403,
            GateError::NotFound => 404,
            GateError::RangeNotSatisfiable { .. } => 416,
            GateError::ClientClosed => 499,
            GateError::Upstream(_) => 502,
            GateError::UpstreamTimeout => 504,
            GateError::Io(e) if is_disconnect_io(e) => 499,
            _ => 500,
        }
    }
}

/// Classify an IO error as a client-disconnect.
///
/// Disconnects terminate the stream silently and must never be logged
/// as server errors.
pub fn is_disconnect_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

/// Classify an arbitrary error message as a client-disconnect.
pub fn is_disconnect_message(msg: &str) -> bool {
    const DISCONNECT_MARKERS: &[&str] = &[
        "connection reset by peer",
        "broken pipe",
        "transport is closing",
        "connection lost",
        "remote end closed connection",
        "cannot write to closing transport",
    ];
    let lower = msg.to_lowercase();
    DISCONNECT_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_status_codes() {
        assert_eq!(GateError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(GateError::Denied("x".into()).status_code(), 403);
        assert_eq!(GateError::ApiKeyInvalid.status_code(), 403);
        assert_eq!(GateError::NotFound.status_code(), 404);
        assert_eq!(GateError::RangeNotSatisfiable { size: 10 }.status_code(), 416);
        assert_eq!(GateError::ClientClosed.status_code(), 499);
        assert_eq!(GateError::Upstream("x".into()).status_code(), 502);
        assert_eq!(GateError::UpstreamTimeout.status_code(), 504);
        assert_eq!(GateError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_disconnect_io_maps_to_499() {
        let err = GateError::Io(IoError::new(ErrorKind::BrokenPipe, "broken pipe"));
        assert_eq!(err.status_code(), 499);
        let err = GateError::Io(IoError::new(ErrorKind::PermissionDenied, "denied"));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_disconnect_classification_by_kind() {
        assert!(is_disconnect_io(&IoError::new(ErrorKind::ConnectionReset, "")));
        assert!(is_disconnect_io(&IoError::new(ErrorKind::BrokenPipe, "")));
        assert!(!is_disconnect_io(&IoError::new(ErrorKind::TimedOut, "")));
    }

    #[test]
    fn test_disconnect_classification_by_message() {
        assert!(is_disconnect_message("error: Connection reset by peer"));
        assert!(is_disconnect_message("Cannot write to closing transport"));
        assert!(!is_disconnect_message("upstream timed out"));
    }

    #[test]
    fn test_denied_display_is_single_line_reason() {
        let err = GateError::Denied("Path not allowed".into());
        assert_eq!(err.to_string(), "Access Denied: Path not allowed");
    }
}
