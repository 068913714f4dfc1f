//! Peer identity extraction.

use std::net::SocketAddr;

use tonic::metadata::MetadataMap;
use tonic::Status;

/// What the authenticator gets to look at when a stream opens.
#[derive(Debug)]
pub struct AuthContext<'a> {
    /// Transport-level peer address, when the transport knows it.
    pub peer_addr: Option<SocketAddr>,
    /// Request metadata (headers).
    pub metadata: &'a MetadataMap,
}

/// Extracts peer identities from a new stream.
///
/// Returning an error rejects the stream before any request is read.
/// Returning an empty list accepts the stream unauthenticated; the
/// identity check at handshake only applies when identities exist.
pub trait Authenticator: Send + Sync + 'static {
    /// Extract the peer's identities.
    fn authenticate(&self, ctx: &AuthContext<'_>) -> Result<Vec<String>, Status>;
}

/// Accepts every stream with no identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthenticator;

impl Authenticator for NoopAuthenticator {
    fn authenticate(&self, _ctx: &AuthContext<'_>) -> Result<Vec<String>, Status> {
        Ok(Vec::new())
    }
}
