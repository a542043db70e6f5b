//! Error types for ductx.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer,
//! configuration and resource errors are all captured here.

/// The error type for all ductx operations.
///
/// Variants follow the failure taxonomy of the transmit engine: a missing
/// control connection, malformed or missing radio responses, a frame
/// configuration that cannot be honoured, and sockets that could not be
/// created.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (TCP control socket, UDP data socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error: a response line with the wrong number of
    /// fields, an unparseable value, or an `ERROR` reply from the radio.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a response from the radio, or for buffer
    /// space to become available.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid parameter was passed (unknown rate index, channel out of
    /// range, duplicate stream id).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No control connection to the radio has been established.
    #[error("not connected")]
    NotConnected,

    /// The control connection to the radio was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The sample stream was stopped while an operation was waiting on it.
    #[error("stream closed")]
    StreamClosed,

    /// A channel's frame configuration cannot be honoured, e.g. a sample
    /// block whose length does not match the fixed frame payload.
    ///
    /// This is fatal to the caller; blocks are never silently truncated.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A socket or other OS resource could not be created.
    #[error("failed to create {resource}: {source}")]
    Resource {
        /// Human-readable name of the resource (e.g. `"data socket on eth1"`).
        resource: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the control link itself is gone, as opposed
    /// to a single exchange having failed.
    pub fn is_link_down(&self) -> bool {
        matches!(self, Error::NotConnected | Error::ConnectionLost)
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("connection refused".into());
        assert_eq!(e.to_string(), "transport error: connection refused");
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("DUCSTAT has 6 fields, expected 8".into());
        assert_eq!(e.to_string(), "protocol error: DUCSTAT has 6 fields, expected 8");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_configuration() {
        let e = Error::Configuration("block of 512 samples, frame holds 1024".into());
        assert_eq!(
            e.to_string(),
            "configuration error: block of 512 samples, frame holds 1024"
        );
    }

    #[test]
    fn error_display_resource() {
        let e = Error::Resource {
            resource: "data socket on eth1".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(e.to_string(), "failed to create data socket on eth1: denied");
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn error_display_not_connected() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_display_stream_closed() {
        assert_eq!(Error::StreamClosed.to_string(), "stream closed");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn link_down_classification() {
        assert!(Error::NotConnected.is_link_down());
        assert!(Error::ConnectionLost.is_link_down());
        assert!(!Error::Timeout.is_link_down());
        assert!(!Error::Protocol("x".into()).is_link_down());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
