//! Error types for the discovery server.

use thiserror::Error;
use tonic::{Code, Status};

/// Error type for discovery server operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The server has not finished loading its caches and cannot serve
    /// discovery information yet.
    #[error("server is not ready to serve discovery information")]
    NotReady,

    /// The first request on a stream did not carry a node id.
    #[error("missing node ID")]
    MissingNodeId,

    /// The node id or node metadata could not be parsed.
    #[error("invalid node: {0}")]
    MalformedNode(String),

    /// None of the connection's identities matched the proxy's expected
    /// namespace / service account.
    #[error("authorization failed: {0}")]
    Unauthorized(String),

    /// An identity string was not a valid SPIFFE URI.
    #[error("invalid spiffe identity: {0}")]
    InvalidIdentity(String),

    /// A response could not be written within the send timeout. This
    /// usually means the client stopped reading.
    #[error("timeout sending")]
    SendTimeout,

    /// The outbound side of the stream is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Error on the ADS stream.
    #[error("stream error: {0}")]
    Stream(#[from] Status),

    /// A resource generator failed to produce a payload.
    #[error("generate failed: {0}")]
    Generate(String),
}

/// Result type alias for discovery server operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotReady => Status::unavailable(err.to_string()),
            Error::MissingNodeId | Error::MalformedNode(_) | Error::InvalidIdentity(_) => {
                Status::invalid_argument(err.to_string())
            }
            Error::Unauthorized(_) => Status::permission_denied(err.to_string()),
            Error::SendTimeout => Status::deadline_exceeded(err.to_string()),
            Error::Stream(status) => status,
            Error::ConnectionClosed | Error::Generate(_) => Status::internal(err.to_string()),
        }
    }
}

/// Whether a stream error is expected when things are operating normally.
/// This is basically capturing when the client disconnects.
pub fn is_expected_stream_error(status: &Status) -> bool {
    match status.code() {
        Code::Cancelled | Code::DeadlineExceeded => true,
        Code::Unavailable => status.message() == "client disconnected",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_stream_errors() {
        assert!(is_expected_stream_error(&Status::cancelled("any")));
        assert!(is_expected_stream_error(&Status::deadline_exceeded("any")));
        assert!(is_expected_stream_error(&Status::unavailable(
            "client disconnected"
        )));
        assert!(!is_expected_stream_error(&Status::unavailable(
            "connection refused"
        )));
        assert!(!is_expected_stream_error(&Status::internal("boom")));
    }

    #[test]
    fn status_conversion_codes() {
        assert_eq!(Status::from(Error::NotReady).code(), Code::Unavailable);
        assert_eq!(
            Status::from(Error::MissingNodeId).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            Status::from(Error::Unauthorized("no match".into())).code(),
            Code::PermissionDenied
        );
        assert_eq!(
            Status::from(Error::SendTimeout).code(),
            Code::DeadlineExceeded
        );
    }
}
