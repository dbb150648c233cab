//! Error types shared by the codec, the transports and the RPC cores
// (c) 2025 Ross Younger

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in this crate.
///
/// Errors received from the remote peer are carried as [`Error::Remote`] with
/// an opaque message string; the other variants originate locally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The reader ran out of bytes mid-decode. Fatal for the frame; the
    /// connection it arrived on is considered broken.
    #[error("reader does not contain enough data to fill the argument")]
    InsufficientData,

    /// An inbound 16-byte frame prefix matched no known message kind.
    #[error("invalid frame prefix")]
    InvalidPrefix,

    /// A field decoded to a value that is out of contract.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// A response arrived for a request ID with no pending entry.
    /// (This happens legitimately after a deadline expiry; the response is
    /// dropped and the connection kept alive.)
    #[error("no pending request with id {0}")]
    UnknownRequestId(u64),

    /// The server received a service ID it has no handler for.
    /// The display text is the on-wire error body, so keep it stable.
    #[error("Service not found")]
    ServiceNotFound,

    /// A service ID was registered twice.
    #[error("service with id {0} already registered")]
    DuplicateService(u64),

    /// An error reported by the remote peer in an ERROR response body.
    #[error("{0}")]
    Remote(String),

    /// The transport failed underneath us.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection was closed in an orderly fashion.
    #[error("Connection closed")]
    ConnectionClosed,

    /// There is no usable connection to send on.
    #[error("Connection not available")]
    NotConnected,

    /// The context deadline passed while waiting for a response.
    #[error("Request timed out")]
    DeadlineExceeded,

    /// The stream was closed while a request on it was outstanding.
    #[error("Stream closed")]
    StreamClosed,

    /// A [`Context`](crate::protocol::Context) lookup missed.
    #[error("Key `{0}` not found")]
    KeyNotFound(String),

    /// An I/O error from a concrete transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// The wire contract for error values: equality compares message text only.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Error {}

#[cfg(test)]
mod test {
    use super::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn equality_is_by_message_text() {
        assert_eq!(
            Error::Remote("Service not found".into()),
            Error::ServiceNotFound
        );
        assert_ne!(Error::ConnectionClosed, Error::DeadlineExceeded);
    }

    #[test]
    fn io_errors_render_their_source() {
        let e = Error::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe burst",
        ));
        assert_eq!(e.to_string(), "pipe burst");
    }
}
