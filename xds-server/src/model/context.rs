//! The global configuration snapshot and push triggers.
//!
//! A [`PushContext`] is an immutable view of the configuration graph a
//! push is computed against. The [`Environment`] holds the current one;
//! the owner of the configuration store swaps in a fresh snapshot and
//! then schedules a push referencing it, so in-flight pushes keep
//! reading the snapshot they started with.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use super::{Labels, Proxy, Service, ServiceInstance};

/// Source of services, instances, and workload facts.
///
/// Implemented by the configuration store; the server only reads.
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// All services currently known.
    fn services(&self) -> Vec<Service>;

    /// Service instances sharing the proxy's addresses.
    fn proxy_service_instances(&self, proxy: &Proxy) -> Vec<ServiceInstance>;

    /// Labels of the workload behind the proxy.
    fn proxy_workload_labels(&self, proxy: &Proxy) -> Labels;

    /// Names of gateways whose selectors match the proxy's workload.
    fn proxy_gateway_names(&self, proxy: &Proxy) -> Vec<String> {
        let _ = proxy;
        Vec::new()
    }
}

/// Services visible to a proxy's config namespace, precomputed at
/// handshake and on every full push so response generation does not
/// recompute it per type.
#[derive(Debug, Clone)]
pub struct SidecarScope {
    /// Namespace the scope was computed for.
    pub namespace: String,
    /// Services visible inside that namespace.
    pub services: Vec<Service>,
}

/// Gateways selecting a proxy's workload, precomputed like the sidecar
/// scope.
#[derive(Debug, Clone)]
pub struct MergedGateways {
    /// Names of the selecting gateways.
    pub gateway_names: Vec<String>,
}

/// An immutable snapshot of the configuration graph.
pub struct PushContext {
    /// Version tag of this snapshot. Also used as the nonce prefix and
    /// as the version reported to the distribution status reporter.
    pub version: String,
    discovery: Arc<dyn ServiceDiscovery>,
    services: OnceLock<Vec<Service>>,
}

impl PushContext {
    /// Create a snapshot at the given version. It serves no services
    /// until [`init_context`](Self::init_context) has run.
    pub fn new(version: impl Into<String>, discovery: Arc<dyn ServiceDiscovery>) -> PushContext {
        PushContext {
            version: version.into(),
            discovery,
            services: OnceLock::new(),
        }
    }

    /// Load the service set from the store. Idempotent: later calls
    /// return immediately without re-reading.
    pub fn init_context(&self) {
        self.services.get_or_init(|| self.discovery.services());
    }

    /// Whether [`init_context`](Self::init_context) has run.
    pub fn initialized(&self) -> bool {
        self.services.get().is_some()
    }

    /// Services in this snapshot; empty before initialization.
    pub fn services(&self) -> &[Service] {
        self.services.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// The backing store.
    pub fn discovery(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.discovery
    }

    /// Compute the sidecar scope for a proxy against this snapshot.
    pub fn sidecar_scope_for(&self, proxy: &Proxy) -> SidecarScope {
        // No visibility rules yet: every service is in scope.
        SidecarScope {
            namespace: proxy.config_namespace.clone(),
            services: self.services().to_vec(),
        }
    }

    /// Compute the gateway set for a proxy against this snapshot.
    pub fn gateways_for(&self, proxy: &Proxy) -> MergedGateways {
        MergedGateways {
            gateway_names: self.discovery.proxy_gateway_names(proxy),
        }
    }
}

impl fmt::Debug for PushContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushContext")
            .field("version", &self.version)
            .field("services", &self.services().len())
            .finish()
    }
}

/// Holds the store handle and the current push context.
pub struct Environment {
    discovery: Arc<dyn ServiceDiscovery>,
    push_context: RwLock<Arc<PushContext>>,
}

impl Environment {
    /// Create an environment around a store, starting from an empty
    /// version-"0" snapshot.
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Environment {
        let initial = Arc::new(PushContext::new("0", discovery.clone()));
        Environment {
            discovery,
            push_context: RwLock::new(initial),
        }
    }

    /// The backing store.
    pub fn discovery(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.discovery
    }

    /// The current global push context.
    pub fn push_context(&self) -> Arc<PushContext> {
        self.push_context.read().expect("push context lock").clone()
    }

    /// Swap in a fresh snapshot. In-flight pushes keep the one they
    /// were scheduled with.
    pub fn set_push_context(&self, push: Arc<PushContext>) {
        *self.push_context.write().expect("push context lock") = push;
    }
}

/// What caused a push to be scheduled. Carried for logging and debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// A configuration object changed.
    ConfigUpdate,
    /// A service was added or removed.
    ServiceUpdate,
    /// Only endpoints changed.
    EndpointUpdate,
    /// A single proxy was targeted.
    ProxyUpdate,
    /// Full resync requested.
    GlobalUpdate,
    /// Manually triggered from a debug surface.
    DebugTrigger,
}

/// Kinds of configuration objects a change batch can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    /// Service and endpoint definitions.
    ServiceEntry,
    /// Traffic routing rules.
    VirtualService,
    /// Per-destination policies.
    DestinationRule,
    /// Gateway definitions.
    Gateway,
    /// Per-namespace scope restrictions.
    Sidecar,
}

/// Identity of one changed configuration object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    /// The object's kind.
    pub kind: ConfigKind,
    /// Object name.
    pub name: String,
    /// Object namespace.
    pub namespace: String,
}

/// Names of the updated configs of one kind.
pub fn config_names_of_kind(configs: &HashSet<ConfigKey>, kind: ConfigKind) -> HashSet<String> {
    configs
        .iter()
        .filter(|key| key.kind == kind)
        .map(|key| key.name.clone())
        .collect()
}

/// A scheduled push: which snapshot to push from and what changed.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Full pushes consider every subscribed type; otherwise only an
    /// endpoint push for the updated services is owed.
    pub full: bool,
    /// The snapshot to compute responses against.
    pub push: Arc<PushContext>,
    /// The configs that changed. Empty on a full push means "rebuild
    /// everything; cached responses cannot be reused".
    pub configs_updated: HashSet<ConfigKey>,
    /// Stamped when fan-out begins; convergence latency is measured
    /// from here.
    pub start: Instant,
    /// What triggered the push.
    pub reason: Vec<TriggerReason>,
}

impl PushRequest {
    /// A full push of the given snapshot.
    pub fn full(push: Arc<PushContext>, reason: TriggerReason) -> PushRequest {
        PushRequest {
            full: true,
            push,
            configs_updated: HashSet::new(),
            start: Instant::now(),
            reason: vec![reason],
        }
    }

    /// Fold a newer request into this one. Used by the push queue when
    /// a connection already has an outstanding push.
    pub fn merge(&self, other: &PushRequest) -> PushRequest {
        PushRequest {
            full: self.full || other.full,
            // The later snapshot wins; it is a superset of the older one.
            push: other.push.clone(),
            configs_updated: self
                .configs_updated
                .union(&other.configs_updated)
                .cloned()
                .collect(),
            start: self.start.min(other.start),
            reason: self.reason.iter().chain(&other.reason).copied().collect(),
        }
    }
}
