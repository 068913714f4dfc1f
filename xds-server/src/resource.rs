//! Recognized v3 resource type URLs.
//!
//! Requests for any other type URL are routed to the generator
//! indirection instead of the built-in per-type handlers.

use uuid::Uuid;

/// Type URL for envoy v3 Cluster resources (CDS).
pub const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
/// Type URL for envoy v3 Listener resources (LDS).
pub const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
/// Type URL for envoy v3 RouteConfiguration resources (RDS).
pub const ROUTE_TYPE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
/// Type URL for envoy v3 ClusterLoadAssignment resources (EDS).
pub const ENDPOINT_TYPE: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// Every built-in type, in the order a full push considers them.
/// Used for distribution status accounting on skip and disconnect.
pub const ALL_EVENT_TYPES: [&str; 4] = [CLUSTER_TYPE, ENDPOINT_TYPE, LISTENER_TYPE, ROUTE_TYPE];

/// Short, log-friendly name for a type URL.
pub fn short_type(type_url: &str) -> &str {
    match type_url {
        CLUSTER_TYPE => "CDS",
        LISTENER_TYPE => "LDS",
        ROUTE_TYPE => "RDS",
        ENDPOINT_TYPE => "EDS",
        other => other.rsplit('/').next().unwrap_or(other),
    }
}

/// Create a response nonce, prefixed with the push context version so a
/// stale nonce also identifies the config generation it was minted for.
pub(crate) fn nonce(version_prefix: &str) -> String {
    format!("{version_prefix}{}", Uuid::new_v4())
}
