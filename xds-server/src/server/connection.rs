//! Per-stream connection state.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tonic::Status;
use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics;
use crate::model::context::PushRequest;
use crate::model::{Proxy, WatchedResource};
use crate::resource::{ENDPOINT_TYPE, ROUTE_TYPE};

/// A config change that reached this connection's session loop.
///
/// `done` must fire exactly once per event; the push queue worker that
/// delivered the event is parked on it, and the connection's next push
/// stays blocked behind that worker. Sending consumes the channel, and
/// dropping it (session death) resolves the waiter too, so the
/// obligation holds on every exit path.
pub(crate) struct Event {
    /// The change to push.
    pub(crate) request: PushRequest,
    /// Completion signal back to the delivering worker.
    pub(crate) done: oneshot::Sender<()>,
}

/// Holds information about a connected client.
///
/// Owned by its session task; the registry and the push workers hold
/// shared references for fan-out and inspection only.
pub struct Connection {
    peer_addr: String,
    identities: Vec<String>,
    connect_time: Instant,
    id: String,
    proxy: Arc<Proxy>,
    push_tx: mpsc::Sender<Event>,
    out_tx: mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>,
    send_timeout: Duration,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        peer_addr: String,
        identities: Vec<String>,
        connect_time: Instant,
        proxy: Arc<Proxy>,
        push_tx: mpsc::Sender<Event>,
        out_tx: mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>,
        send_timeout: Duration,
    ) -> Connection {
        Connection {
            peer_addr,
            identities,
            connect_time,
            id,
            proxy,
            push_tx,
            out_tx,
            send_timeout,
        }
    }

    /// The connection identifier, unique within the process.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address of the client, from the network layer.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Identities the authenticator associated with the stream.
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    /// When the stream opened.
    pub fn connect_time(&self) -> Instant {
        self.connect_time
    }

    /// The proxy snapshot this connection serves.
    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub(crate) fn push_sender(&self) -> mpsc::Sender<Event> {
        self.push_tx.clone()
    }

    /// Cluster names the connection subscribed endpoints for.
    pub fn clusters(&self) -> Vec<String> {
        self.proxy.watched_names(ENDPOINT_TYPE)
    }

    /// Route names the connection subscribed to.
    pub fn routes(&self) -> Vec<String> {
        self.proxy.watched_names(ROUTE_TYPE)
    }

    /// Whether the connection watches this type URL.
    pub fn watching(&self, type_url: &str) -> bool {
        self.proxy.watching(type_url)
    }

    /// Snapshot of the subscription for a type URL.
    pub fn watched(&self, type_url: &str) -> Option<WatchedResource> {
        self.proxy.watched(type_url)
    }

    /// Nonce of the last response sent for a type URL.
    pub fn nonce_sent(&self, type_url: &str) -> String {
        self.proxy
            .watched(type_url)
            .map(|w| w.nonce_sent)
            .unwrap_or_default()
    }

    /// Nonce of the last response the client acknowledged for a type URL.
    pub fn nonce_acked(&self, type_url: &str) -> String {
        self.proxy
            .watched(type_url)
            .map(|w| w.nonce_acked)
            .unwrap_or_default()
    }

    /// Write a response to the stream, bounded by the send timeout.
    ///
    /// The write runs on a helper task so the timer can abandon it; an
    /// abandoned write may still land on the wire later, but its result
    /// is discarded and no bookkeeping is updated for it. On success the
    /// watched-resource record takes the response's nonce, version, and
    /// payload size.
    pub(crate) async fn send(&self, res: DiscoveryResponse) -> Result<()> {
        let type_url = res.type_url.clone();
        let nonce = res.nonce.clone();
        let version = res.version_info.clone();
        let size: usize = res.resources.iter().map(|r| r.value.len()).sum();

        let (result_tx, result_rx) = oneshot::channel();
        let out = self.out_tx.clone();
        tokio::spawn(async move {
            let _ = result_tx.send(out.send(Ok(res)).await);
        });

        match timeout(self.send_timeout, result_rx).await {
            Err(_elapsed) => {
                metrics::inc_write_timeouts();
                warn!(con = %self.id, type_url = %type_url, "timeout writing response");
                Err(Error::SendTimeout)
            }
            Ok(Err(_)) | Ok(Ok(Err(_))) => Err(Error::ConnectionClosed),
            Ok(Ok(Ok(()))) => {
                if !nonce.is_empty() {
                    self.proxy.with_watched_entry(&type_url, |w| {
                        w.nonce_sent = nonce;
                        w.version_sent = version;
                        w.last_sent = Some(Instant::now());
                        w.last_size = size;
                    });
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("node_id", &self.proxy.node_id)
            .finish()
    }
}
