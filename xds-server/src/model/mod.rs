//! Data model for connected proxies and their subscriptions.
//!
//! A [`Proxy`] is the server-side snapshot of one connected client:
//! identity parsed from the first discovery request's node, plus state
//! re-derived from the push context on every full push. Its watched
//! resource table carries the ACK/NACK bookkeeping the request
//! reconciler and the send path maintain.

pub mod context;
pub mod spiffe;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use envoy_types::pb::envoy::config::core::v3::{Locality, Node};
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;
use envoy_types::pb::google::protobuf::value::Kind;
use envoy_types::pb::google::protobuf::Struct;

use crate::error::Error;
use crate::generator::XdsResourceGenerator;
use context::{MergedGateways, SidecarScope};

/// Workload labels.
pub type Labels = HashMap<String, String>;

/// A service known to the configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Fully qualified hostname of the service.
    pub hostname: String,
    /// Namespace the service lives in.
    pub namespace: String,
}

/// One workload endpoint backing a service.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    /// Network address of the endpoint.
    pub address: String,
    /// Locality label in `region/zone/subzone` form, possibly empty.
    pub locality: String,
    /// Endpoint labels.
    pub labels: Labels,
}

/// A service instance associated with a proxy.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    /// Hostname of the service this instance belongs to.
    pub hostname: String,
    /// The backing endpoint.
    pub endpoint: Endpoint,
}

/// Subscription state for one (connection, type URL) pair.
#[derive(Debug, Clone, Default)]
pub struct WatchedResource {
    /// Type URL of the watched resources.
    pub type_url: String,
    /// Resource names the client last subscribed to. Empty means
    /// wildcard for types with resource-scoped subscriptions.
    pub resource_names: Vec<String>,
    /// Version of the last response the client acknowledged.
    pub version_acked: String,
    /// Nonce of the last response the client acknowledged.
    pub nonce_acked: String,
    /// Version of the last response written to the stream.
    pub version_sent: String,
    /// Nonce of the last response written to the stream. An inbound
    /// request echoing any other nonce is stale.
    pub nonce_sent: String,
    /// When the last response was written.
    pub last_sent: Option<Instant>,
    /// Total payload bytes of the last response.
    pub last_size: usize,
    /// The most recent request for this type, kept for debugging and
    /// reconnect reasoning.
    pub last_request: Option<DiscoveryRequest>,
}

impl WatchedResource {
    /// Create the subscription record for a new or re-established watch.
    pub fn new(type_url: impl Into<String>, request: &DiscoveryRequest) -> Self {
        WatchedResource {
            type_url: type_url.into(),
            resource_names: request.resource_names.clone(),
            last_request: Some(request.clone()),
            ..Default::default()
        }
    }
}

/// The role a proxy declared in its node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// A sidecar attached to a workload.
    Sidecar,
    /// A standalone gateway.
    Router,
}

impl ProxyType {
    fn parse(s: &str) -> Option<ProxyType> {
        match s {
            "sidecar" => Some(ProxyType::Sidecar),
            "router" => Some(ProxyType::Router),
            _ => None,
        }
    }

    /// The node-id segment spelling of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Sidecar => "sidecar",
            ProxyType::Router => "router",
        }
    }
}

/// Node metadata the server understands, parsed from the string fields
/// of the node's metadata struct. Unknown keys are ignored.
#[derive(Debug, Clone, Default)]
pub struct ProxyMetadata {
    /// Selects a registered resource generator for the whole connection.
    pub generator: String,
    /// Service account the workload runs as.
    pub service_account: String,
    /// Cluster (in the multi-cluster sense) the proxy belongs to.
    pub cluster_id: String,
    /// Overrides the config namespace derived from the node id.
    pub namespace: String,
    /// Version of the proxy binary, used to label the client gauge.
    pub proxy_version: String,
    /// Overrides the instance IPs from the node id.
    pub instance_ips: Vec<String>,
    /// Workload labels carried in metadata.
    pub labels: Labels,
}

impl ProxyMetadata {
    /// Extract the recognized keys from a node metadata struct.
    pub fn parse(metadata: Option<&Struct>) -> ProxyMetadata {
        let Some(meta) = metadata else {
            return ProxyMetadata::default();
        };
        ProxyMetadata {
            generator: string_field(meta, "GENERATOR").unwrap_or_default(),
            service_account: string_field(meta, "SERVICE_ACCOUNT").unwrap_or_default(),
            cluster_id: string_field(meta, "CLUSTER_ID").unwrap_or_default(),
            namespace: string_field(meta, "NAMESPACE").unwrap_or_default(),
            proxy_version: string_field(meta, "PROXY_VERSION").unwrap_or_default(),
            instance_ips: string_field(meta, "INSTANCE_IPS")
                .map(|ips| ips.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            labels: labels_field(meta, "LABELS"),
        }
    }
}

fn string_field(meta: &Struct, key: &str) -> Option<String> {
    match meta.fields.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn labels_field(meta: &Struct, key: &str) -> Labels {
    let Some(Kind::StructValue(labels)) = meta.fields.get(key).and_then(|v| v.kind.as_ref())
    else {
        return Labels::default();
    };
    labels
        .fields
        .iter()
        .filter_map(|(k, v)| match v.kind.as_ref() {
            Some(Kind::StringValue(s)) => Some((k.clone(), s.clone())),
            _ => None,
        })
        .collect()
}

/// State re-derived from the push context, guarded so that inspectors
/// can read while the session task updates it.
#[derive(Debug, Default)]
struct ProxyState {
    workload_labels: Labels,
    service_instances: Vec<ServiceInstance>,
    locality: Locality,
    sidecar_scope: Option<SidecarScope>,
    gateways: Option<MergedGateways>,
}

/// Server-side snapshot of one connected client.
///
/// Never shared across connections. The watched-resource table is the
/// shared-read surface; all writes to it come from the connection's
/// session task.
pub struct Proxy {
    /// Raw node id from the first request.
    pub node_id: String,
    /// Role declared in the node id.
    pub proxy_type: ProxyType,
    /// Instance IPs, in declaration order. The first one is the
    /// primary address used for targeted pushes.
    pub ip_addresses: Vec<String>,
    /// DNS domain suffix for short hostnames.
    pub dns_domain: String,
    /// Parsed node metadata.
    pub metadata: ProxyMetadata,
    /// Namespace this proxy's config is scoped to.
    pub config_namespace: String,
    supports_ipv4: bool,
    supports_ipv6: bool,
    pub(crate) generator: Option<Arc<dyn XdsResourceGenerator>>,
    state: RwLock<ProxyState>,
    watched: RwLock<HashMap<String, WatchedResource>>,
}

impl Proxy {
    /// Whether the proxy advertised this IP version.
    pub fn supports_ipv4(&self) -> bool {
        self.supports_ipv4
    }

    /// Whether the proxy advertised this IP version.
    pub fn supports_ipv6(&self) -> bool {
        self.supports_ipv6
    }

    /// The resource generator selected by metadata, if any.
    pub fn generator(&self) -> Option<Arc<dyn XdsResourceGenerator>> {
        self.generator.clone()
    }

    /// The proxy's locality.
    pub fn locality(&self) -> Locality {
        self.state.read().expect("proxy state lock").locality.clone()
    }

    pub(crate) fn set_locality(&self, locality: Locality) {
        self.state.write().expect("proxy state lock").locality = locality;
    }

    /// Labels of the workload this proxy fronts.
    pub fn workload_labels(&self) -> Labels {
        self.state
            .read()
            .expect("proxy state lock")
            .workload_labels
            .clone()
    }

    pub(crate) fn set_workload_labels(&self, labels: Labels) {
        self.state.write().expect("proxy state lock").workload_labels = labels;
    }

    /// Service instances associated with this proxy's addresses.
    pub fn service_instances(&self) -> Vec<ServiceInstance> {
        self.state
            .read()
            .expect("proxy state lock")
            .service_instances
            .clone()
    }

    pub(crate) fn set_service_instances(&self, instances: Vec<ServiceInstance>) {
        self.state
            .write()
            .expect("proxy state lock")
            .service_instances = instances;
    }

    /// The precomputed sidecar scope, if derived yet.
    pub fn sidecar_scope(&self) -> Option<SidecarScope> {
        self.state
            .read()
            .expect("proxy state lock")
            .sidecar_scope
            .clone()
    }

    pub(crate) fn set_sidecar_scope(&self, scope: SidecarScope) {
        self.state.write().expect("proxy state lock").sidecar_scope = Some(scope);
    }

    /// The precomputed gateway set, if derived yet.
    pub fn merged_gateways(&self) -> Option<MergedGateways> {
        self.state.read().expect("proxy state lock").gateways.clone()
    }

    pub(crate) fn set_merged_gateways(&self, gateways: MergedGateways) {
        self.state.write().expect("proxy state lock").gateways = Some(gateways);
    }

    /// Whether the connection has a subscription for this type URL.
    pub fn watching(&self, type_url: &str) -> bool {
        self.watched
            .read()
            .expect("watched lock")
            .contains_key(type_url)
    }

    /// Snapshot of the subscription for this type URL.
    pub fn watched(&self, type_url: &str) -> Option<WatchedResource> {
        self.watched.read().expect("watched lock").get(type_url).cloned()
    }

    /// Snapshot of every current subscription.
    pub fn watched_snapshot(&self) -> Vec<WatchedResource> {
        self.watched.read().expect("watched lock").values().cloned().collect()
    }

    /// Resource names of the watched subscription, empty if absent.
    pub fn watched_names(&self, type_url: &str) -> Vec<String> {
        self.watched
            .read()
            .expect("watched lock")
            .get(type_url)
            .map(|w| w.resource_names.clone())
            .unwrap_or_default()
    }

    pub(crate) fn insert_watched(&self, watched: WatchedResource) {
        self.watched
            .write()
            .expect("watched lock")
            .insert(watched.type_url.clone(), watched);
    }

    /// Mutate the subscription for a type URL, creating an empty record
    /// first if none exists (responses can precede the reconciler for
    /// the unconditional CDS/LDS first subscription).
    pub(crate) fn with_watched_entry(
        &self,
        type_url: &str,
        f: impl FnOnce(&mut WatchedResource),
    ) {
        let mut watched = self.watched.write().expect("watched lock");
        let entry = watched
            .entry(type_url.to_string())
            .or_insert_with(|| WatchedResource {
                type_url: type_url.to_string(),
                ..Default::default()
            });
        f(entry);
    }
}

/// Parse the identity half of a proxy from a discovery node.
///
/// The node id has the form `<type>~<ip[,ip...]>~<name.namespace>~<domain>`.
/// Instance IPs from metadata take precedence over the id segment, and
/// the config namespace can be overridden by metadata as well.
pub fn parse_service_node(node: &Node) -> Result<Proxy, Error> {
    let metadata = ProxyMetadata::parse(node.metadata.as_ref());

    let parts: Vec<&str> = node.id.split('~').collect();
    let [role, ip_part, name_part, dns_domain] = parts.as_slice() else {
        return Err(Error::MalformedNode(format!(
            "expected 4 '~' separated segments in node id {:?}",
            node.id
        )));
    };

    let proxy_type = ProxyType::parse(role).ok_or_else(|| {
        Error::MalformedNode(format!("unsupported node type {role:?} in {:?}", node.id))
    })?;

    let ip_addresses: Vec<String> = if metadata.instance_ips.is_empty() {
        ip_part.split(',').map(str::to_string).collect()
    } else {
        metadata.instance_ips.clone()
    };
    if ip_addresses.is_empty() || ip_addresses.iter().any(|ip| ip.is_empty()) {
        return Err(Error::MalformedNode(format!(
            "no instance address in {:?}",
            node.id
        )));
    }

    let mut supports_ipv4 = false;
    let mut supports_ipv6 = false;
    for ip in &ip_addresses {
        match ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => supports_ipv4 = true,
            Ok(IpAddr::V6(_)) => supports_ipv6 = true,
            Err(_) => {
                return Err(Error::MalformedNode(format!("invalid IP address {ip:?}")));
            }
        }
    }

    let config_namespace = if metadata.namespace.is_empty() {
        namespace_from_name(name_part)
    } else {
        metadata.namespace.clone()
    };

    Ok(Proxy {
        node_id: node.id.clone(),
        proxy_type,
        ip_addresses,
        dns_domain: dns_domain.to_string(),
        metadata,
        config_namespace,
        supports_ipv4,
        supports_ipv6,
        generator: None,
        state: RwLock::new(ProxyState::default()),
        watched: RwLock::new(HashMap::new()),
    })
}

/// The namespace is the last dot segment of the `name.namespace` id part.
fn namespace_from_name(name_part: &str) -> String {
    match name_part.rsplit_once('.') {
        Some((_, ns)) => ns.to_string(),
        None => String::new(),
    }
}

/// Convert a `region/zone/subzone` label into a locality.
pub fn convert_locality(label: &str) -> Locality {
    let mut parts = label.splitn(3, '/');
    Locality {
        region: parts.next().unwrap_or_default().to_string(),
        zone: parts.next().unwrap_or_default().to_string(),
        sub_zone: parts.next().unwrap_or_default().to_string(),
    }
}

/// Whether a locality carries no information.
pub fn is_locality_empty(locality: &Locality) -> bool {
    locality.region.is_empty() && locality.zone.is_empty() && locality.sub_zone.is_empty()
}

/// Whether two resource-name lists contain the same elements, ignoring
/// order. Names are assumed unique; a length check plus membership test
/// keeps duplicate-bearing inputs from comparing equal to shorter ones.
pub fn list_equal_unordered(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let first: std::collections::HashSet<&str> = a.iter().map(String::as_str).collect();
    b.iter().all(|name| first.contains(name.as_str()))
}
