//! Payload generation and push policy contracts.
//!
//! The server owns the protocol; everything that knows what bytes a
//! proxy should receive lives behind these traits.

use std::collections::HashSet;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;
use envoy_types::pb::google::protobuf::Any;

use crate::error::Result;
use crate::model::context::{ConfigKey, PushContext, PushRequest};
use crate::model::{Proxy, WatchedResource};
use crate::server::Connection;

/// Produces payloads for the four built-in resource types.
pub trait ConfigGenerator: Send + Sync + 'static {
    /// Clusters for the proxy.
    fn clusters(&self, proxy: &Proxy, push: &PushContext) -> Vec<Any>;

    /// Listeners for the proxy.
    fn listeners(&self, proxy: &Proxy, push: &PushContext) -> Vec<Any>;

    /// Route configurations for the requested route names.
    fn routes(&self, proxy: &Proxy, push: &PushContext, names: &[String]) -> Vec<Any>;

    /// Load assignments for the watched clusters. When
    /// `updated_services` is set (incremental push), only clusters
    /// belonging to those services are owed.
    fn endpoints(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        clusters: &[String],
        updated_services: Option<&HashSet<String>>,
    ) -> Vec<Any>;
}

/// Produces payloads for one watched type of one proxy.
///
/// Selected per connection via the `GENERATOR` metadata key, or per
/// request for type URLs outside the built-in four.
pub trait XdsResourceGenerator: Send + Sync + 'static {
    /// Compute the payload, or `None` when the change needs no push
    /// for this watch.
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        updates: &HashSet<ConfigKey>,
    ) -> Result<Option<Vec<Any>>>;
}

/// Internal observer of connection lifecycle and NACKs, used for debug
/// surfaces and for serving discovery data over discovery itself.
pub trait InternalWatcher: Send + Sync + 'static {
    /// A connection finished its handshake.
    fn on_connect(&self, con: &Arc<Connection>);

    /// A connection's stream terminated.
    fn on_disconnect(&self, con: &Arc<Connection>);

    /// A client rejected a pushed config.
    fn on_nack(&self, proxy: &Proxy, request: &DiscoveryRequest);
}

/// Which of the built-in types a full push owes a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushTypes {
    /// Clusters owed.
    pub cds: bool,
    /// Endpoints owed.
    pub eds: bool,
    /// Listeners owed.
    pub lds: bool,
    /// Routes owed.
    pub rds: bool,
}

impl PushTypes {
    /// Everything owed.
    pub const ALL: PushTypes = PushTypes {
        cds: true,
        eds: true,
        lds: true,
        rds: true,
    };
}

/// Decides whether and what a change batch means for a proxy.
pub trait PushPolicy: Send + Sync + 'static {
    /// Whether the change is relevant to the proxy at all.
    fn proxy_needs_push(&self, proxy: &Proxy, request: &PushRequest) -> bool;

    /// Which per-type pushes are owed on a full push.
    fn push_type_for(&self, proxy: &Proxy, request: &PushRequest) -> PushTypes;
}

/// Pushes everything to everyone. The safe default when no scoping
/// information is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPush;

impl PushPolicy for AlwaysPush {
    fn proxy_needs_push(&self, _proxy: &Proxy, _request: &PushRequest) -> bool {
        true
    }

    fn push_type_for(&self, _proxy: &Proxy, _request: &PushRequest) -> PushTypes {
        PushTypes::ALL
    }
}
