//! Error types for the relay peer transport

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in transport and session operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling RPC error (transient relay/network failure)
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Operation timed out
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Operation was cancelled by an abort token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The owning transport is closed
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Component is in the wrong state for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient relay/network faults; the retry layer
    /// keeps polling through them. Everything else is treated as fatal by
    /// the caller that observes it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Signaling(_) | Error::Timeout(_) | Error::Io(_)
        )
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtc(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::Signaling("test".to_string()).is_retryable());
        assert!(Error::Timeout("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
        assert!(!Error::Cancelled("test".to_string()).is_retryable());
        assert!(!Error::TransportClosed("test".to_string()).is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::from(io_err);
        assert!(err.is_retryable());
    }
}
