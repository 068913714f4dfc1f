//! The discovery server: session loop, request reconciliation, and
//! connection registry.
//!
//! Each stream runs two cooperative tasks. A receive task drains the
//! inbound side into a bounded queue, because reading suspends and must
//! not keep the session from observing push events. The session task is
//! the sole writer of the stream and of the watched-resource "sent"
//! fields; the reconciler runs on the same task, so sent-versus-acked
//! bookkeeping needs no ordering lock. The locks that do exist are for
//! concurrent readers (metrics, debug) only.

mod connection;
mod push;
mod queue;

pub use connection::Connection;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthContext, Authenticator, NoopAuthenticator};
use crate::cache::{DisabledCache, XdsCache};
use crate::error::{is_expected_stream_error, Error, Result};
use crate::generator::{
    AlwaysPush, ConfigGenerator, InternalWatcher, PushPolicy, XdsResourceGenerator,
};
use crate::metrics;
use crate::model::context::Environment;
use crate::model::spiffe::SpiffeIdentity;
use crate::model::{
    convert_locality, is_locality_empty, list_equal_unordered, parse_service_node, Proxy,
    WatchedResource,
};
use crate::resource::{
    short_type, ALL_EVENT_TYPES, CLUSTER_TYPE, ENDPOINT_TYPE, LISTENER_TYPE, ROUTE_TYPE,
};
use crate::status::StatusReporter;
use connection::Event;
use queue::PushQueue;

/// Tunables for the discovery server.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Max time to wait for a response write to complete. Detects
    /// clients in a bad state (not reading).
    pub send_timeout: Duration,
    /// Bound on per-connection pushes in flight at once.
    pub concurrent_push_limit: usize,
    /// Match connection identities against the proxy's namespace and
    /// service account. Streams whose authenticator produced no
    /// identities are accepted either way.
    pub enable_identity_check: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            send_timeout: Duration::from_secs(5),
            concurrent_push_limit: 100,
            enable_identity_check: true,
        }
    }
}

/// Builder for a [`DiscoveryServer`].
pub struct DiscoveryServerBuilder {
    env: Arc<Environment>,
    config: DiscoveryConfig,
    config_gen: Arc<dyn ConfigGenerator>,
    generators: HashMap<String, Arc<dyn XdsResourceGenerator>>,
    push_policy: Arc<dyn PushPolicy>,
    authenticator: Arc<dyn Authenticator>,
    cache: Arc<dyn XdsCache>,
    status_reporter: Option<Arc<dyn StatusReporter>>,
    internal_watcher: Option<Arc<dyn InternalWatcher>>,
}

impl DiscoveryServerBuilder {
    /// Start a builder from the environment and the payload generator.
    pub fn new(env: Arc<Environment>, config_gen: Arc<dyn ConfigGenerator>) -> Self {
        DiscoveryServerBuilder {
            env,
            config: DiscoveryConfig::default(),
            config_gen,
            generators: HashMap::new(),
            push_policy: Arc::new(AlwaysPush),
            authenticator: Arc::new(NoopAuthenticator),
            cache: Arc::new(DisabledCache),
            status_reporter: None,
            internal_watcher: None,
        }
    }

    /// Override the default tunables.
    pub fn config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a named resource generator, selectable via the
    /// `GENERATOR` node metadata key or by type URL.
    pub fn generator(
        mut self,
        name: impl Into<String>,
        generator: Arc<dyn XdsResourceGenerator>,
    ) -> Self {
        self.generators.insert(name.into(), generator);
        self
    }

    /// Set the push relevance policy.
    pub fn push_policy(mut self, policy: Arc<dyn PushPolicy>) -> Self {
        self.push_policy = policy;
        self
    }

    /// Set the peer authenticator.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Set the response cache to invalidate on change batches.
    pub fn cache(mut self, cache: Arc<dyn XdsCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Set the distribution status reporter.
    pub fn status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.status_reporter = Some(reporter);
        self
    }

    /// Set the internal connection/NACK observer.
    pub fn internal_watcher(mut self, watcher: Arc<dyn InternalWatcher>) -> Self {
        self.internal_watcher = Some(watcher);
        self
    }

    /// Build the server. Call [`DiscoveryServer::start`] afterwards to
    /// run the push fan-out worker.
    pub fn build(self) -> Arc<DiscoveryServer> {
        Arc::new(DiscoveryServer {
            env: self.env,
            config: self.config,
            config_gen: self.config_gen,
            generators: self.generators,
            push_policy: self.push_policy,
            authenticator: self.authenticator,
            cache: self.cache,
            status_reporter: self.status_reporter,
            internal_watcher: self.internal_watcher,
            clients: RwLock::new(HashMap::new()),
            queue: Arc::new(PushQueue::new()),
            connection_counter: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }
}

/// The ADS server: accepts streams, reconciles subscriptions, and fans
/// configuration changes out to connected proxies.
pub struct DiscoveryServer {
    env: Arc<Environment>,
    config: DiscoveryConfig,
    config_gen: Arc<dyn ConfigGenerator>,
    generators: HashMap<String, Arc<dyn XdsResourceGenerator>>,
    push_policy: Arc<dyn PushPolicy>,
    authenticator: Arc<dyn Authenticator>,
    cache: Arc<dyn XdsCache>,
    status_reporter: Option<Arc<dyn StatusReporter>>,
    internal_watcher: Option<Arc<dyn InternalWatcher>>,
    clients: RwLock<HashMap<String, Arc<Connection>>>,
    queue: Arc<PushQueue>,
    connection_counter: AtomicU64,
    ready: AtomicBool,
    started: AtomicBool,
}

impl DiscoveryServer {
    /// Start a builder.
    pub fn builder(
        env: Arc<Environment>,
        config_gen: Arc<dyn ConfigGenerator>,
    ) -> DiscoveryServerBuilder {
        DiscoveryServerBuilder::new(env, config_gen)
    }

    /// The environment this server reads from.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Whether the server accepts new streams.
    pub fn is_server_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flip the readiness gate. New streams are rejected until the
    /// caches behind the environment have been loaded; without this,
    /// reconnecting clients would be handed empty configuration.
    pub fn set_server_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// The version string stamped on responses: the current global push
    /// context's version.
    pub fn version_info(&self) -> String {
        self.env.push_context().version.clone()
    }

    /// Number of live connections.
    pub fn client_count(&self) -> usize {
        self.clients.read().expect("registry lock").len()
    }

    /// Look up a live connection by id.
    pub fn connection(&self, con_id: &str) -> Option<Arc<Connection>> {
        self.clients.read().expect("registry lock").get(con_id).cloned()
    }

    /// Wrap the server in the generated gRPC service.
    pub fn grpc_service(self: &Arc<Self>) -> AggregatedDiscoveryServiceServer<AdsService> {
        AggregatedDiscoveryServiceServer::new(AdsService {
            server: Arc::clone(self),
        })
    }

    /// Snapshot the registry. Fan-out iterates the snapshot so that
    /// enqueueing never holds the registry lock across a channel send.
    pub(crate) fn connection_snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients
            .read()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }

    fn next_connection_id(&self, node_id: &str) -> String {
        let seq = self.connection_counter.fetch_add(1, Ordering::AcqRel) + 1;
        format!("{node_id}-{seq}")
    }

    /// Run one ADS stream to completion.
    ///
    /// The inbound queue has capacity one: the receive task stays at
    /// most one request ahead of the session. Receive errors arrive
    /// in-band; queue closure is a clean client EOF.
    async fn handle_stream<S: RequestStream>(
        self: Arc<Self>,
        stream: S,
        out_tx: mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>,
        peer_addr: String,
        identities: Vec<String>,
    ) {
        let (req_tx, mut req_rx) = mpsc::channel(1);
        tokio::spawn(receive(stream, req_tx, peer_addr.clone()));

        // The first request initializes the connection; nothing can be
        // pushed before it arrives.
        let first = match req_rx.recv().await {
            Some(Ok(request)) => request,
            Some(Err(status)) => {
                let _ = out_tx.send(Err(status)).await;
                return;
            }
            None => return,
        };

        // The node id may be unset, for example for malicious clients.
        let Some(node) = first.node.clone().filter(|n| !n.id.is_empty()) else {
            let _ = out_tx.send(Err(Error::MissingNodeId.into())).await;
            return;
        };

        let (push_tx, mut push_rx) = mpsc::channel(1);
        let con = match self.init_connection(&node, peer_addr.clone(), identities, push_tx, out_tx.clone())
        {
            Ok(con) => con,
            Err(err) => {
                warn!(peer = %peer_addr, error = %err, "rejecting ads stream");
                let _ = out_tx.send(Err(err.into())).await;
                return;
            }
        };
        debug!(con = %con.id(), peer = %peer_addr, "ads stream established");

        let result = self
            .serve_connection(&con, &mut req_rx, &mut push_rx, first)
            .await;

        self.remove_connection(&con);
        if let Some(watcher) = &self.internal_watcher {
            watcher.on_disconnect(&con);
        }

        if let Err(err) = result {
            info!(con = %con.id(), error = %err, "ads stream terminated with error");
            let _ = out_tx.send(Err(err.into())).await;
        }
    }

    /// The single-writer loop: multiplex inbound requests and push
    /// events until the stream ends.
    async fn serve_connection(
        &self,
        con: &Arc<Connection>,
        req_rx: &mut mpsc::Receiver<std::result::Result<DiscoveryRequest, Status>>,
        push_rx: &mut mpsc::Receiver<Event>,
        first: DiscoveryRequest,
    ) -> Result<()> {
        self.process_request(con, first).await?;

        loop {
            tokio::select! {
                inbound = req_rx.recv() => match inbound {
                    Some(Ok(request)) => self.process_request(con, request).await?,
                    Some(Err(status)) => return Err(Error::Stream(status)),
                    None => return Ok(()),
                },
                event = push_rx.recv() => {
                    let Some(Event { request, done }) = event else {
                        return Ok(());
                    };
                    let pushed = self.push_connection(con, &request).await;
                    let _ = done.send(());
                    if let Err(err) = pushed {
                        // The stream is already compromised; terminate it
                        // cleanly and let the peer reconnect. Config
                        // delivery to other connections is unaffected.
                        metrics::inc_push_errors();
                        warn!(con = %con.id(), error = %err, "push failed, closing stream");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatch one request to its type handler.
    async fn process_request(
        &self,
        con: &Arc<Connection>,
        request: DiscoveryRequest,
    ) -> Result<()> {
        if let Some(reporter) = &self.status_reporter {
            reporter.register_event(con.id(), &request.type_url, &request.response_nonce);
        }
        match request.type_url.as_str() {
            CLUSTER_TYPE => self.handle_cds(con, request).await,
            LISTENER_TYPE => self.handle_lds(con, request).await,
            ROUTE_TYPE => self.handle_rds(con, request).await,
            ENDPOINT_TYPE => self.handle_eds(con, request).await,
            // Custom resource types work without `GENERATOR` metadata.
            _ => self.handle_custom_generator(con, request).await,
        }
    }

    async fn handle_cds(&self, con: &Arc<Connection>, request: DiscoveryRequest) -> Result<()> {
        // The first subscription is unconditional: clusters are pushed
        // on every ads stream.
        if con.watching(CLUSTER_TYPE) && !self.should_respond(con, &request) {
            return Ok(());
        }
        info!(con = %con.id(), version = %request.version_info, "cds request");
        self.push_cds(con, &self.env.push_context(), &self.version_info())
            .await
    }

    async fn handle_lds(&self, con: &Arc<Connection>, request: DiscoveryRequest) -> Result<()> {
        if con.watching(LISTENER_TYPE) && !self.should_respond(con, &request) {
            return Ok(());
        }
        debug!(con = %con.id(), "lds request");
        self.push_lds(con, &self.env.push_context(), &self.version_info())
            .await
    }

    async fn handle_eds(&self, con: &Arc<Connection>, request: DiscoveryRequest) -> Result<()> {
        if !self.should_respond(con, &request) {
            return Ok(());
        }
        debug!(con = %con.id(), clusters = con.clusters().len(), "eds request");
        self.push_eds(&self.env.push_context(), con, &self.version_info(), None)
            .await
    }

    async fn handle_rds(&self, con: &Arc<Connection>, request: DiscoveryRequest) -> Result<()> {
        if !self.should_respond(con, &request) {
            return Ok(());
        }
        debug!(con = %con.id(), routes = con.routes().len(), "rds request");
        self.push_rds(con, &self.env.push_context(), &self.version_info())
            .await
    }

    /// Serve a type URL outside the built-in four through the generator
    /// indirection.
    async fn handle_custom_generator(
        &self,
        con: &Arc<Connection>,
        request: DiscoveryRequest,
    ) -> Result<()> {
        if !self.should_respond(con, &request) {
            return Ok(());
        }
        let Some(generator) = self.find_generator(&request.type_url, con) else {
            warn!(con = %con.id(), type_url = %request.type_url, "no generator for resource type");
            return Ok(());
        };
        let push = self.env.push_context();
        let watched = con
            .watched(&request.type_url)
            .unwrap_or_else(|| WatchedResource::new(request.type_url.clone(), &request));
        let Some(resources) =
            generator.generate(con.proxy(), &push, &watched, &HashSet::new())?
        else {
            return Ok(());
        };
        let version = self.version_info();
        self.send_response(con, &request.type_url, &push, &version, resources)
            .await
    }

    fn find_generator(
        &self,
        type_url: &str,
        con: &Arc<Connection>,
    ) -> Option<Arc<dyn XdsResourceGenerator>> {
        con.proxy()
            .generator()
            .or_else(|| self.generators.get(type_url).cloned())
    }

    /// Apply the ack/nack rules: decide whether this request is owed a
    /// response, updating subscription state along the way.
    fn should_respond(&self, con: &Arc<Connection>, request: &DiscoveryRequest) -> bool {
        let stype = short_type(&request.type_url);

        // An error detail means the previous response was rejected.
        // Nothing is owed; relying on the version mismatch instead
        // would be fragile.
        if let Some(error_detail) = &request.error_detail {
            let code = Code::from(error_detail.code);
            warn!(
                r#type = stype,
                con = %con.id(),
                code = ?code,
                message = %error_detail.message,
                "client rejected config",
            );
            metrics::inc_rejects(&request.type_url, code);
            if let Some(watcher) = &self.internal_watcher {
                watcher.on_nack(con.proxy(), request);
            }
            return false;
        }

        // First request for this type: initialize the watch.
        if request.response_nonce.is_empty() {
            con.proxy()
                .insert_watched(WatchedResource::new(request.type_url.clone(), request));
            return true;
        }

        let Some(previous) = con.proxy().watched(&request.type_url) else {
            // The client echoes a nonce this server never sent: it
            // reconnected after a restart of either side. Respond with
            // the current state.
            debug!(
                r#type = stype,
                con = %con.id(),
                version = %request.version_info,
                nonce = %request.response_nonce,
                "reconnect",
            );
            con.proxy()
                .insert_watched(WatchedResource::new(request.type_url.clone(), request));
            return true;
        };

        // A nonce becomes stale as soon as a newer one is sent.
        if request.response_nonce != previous.nonce_sent {
            debug!(
                r#type = stype,
                con = %con.id(),
                received = %request.response_nonce,
                sent = %previous.nonce_sent,
                "expired nonce received",
            );
            metrics::inc_expired_nonce();
            return false;
        }

        // Nonce match: an ack. Record it, then respond only if the
        // requested resources changed. Clients send a second request
        // with the same version and nonce when they need a new
        // resource.
        let previous_resources = previous.resource_names;
        con.proxy().with_watched_entry(&request.type_url, |w| {
            w.version_acked = request.version_info.clone();
            w.nonce_acked = request.response_nonce.clone();
            w.resource_names = request.resource_names.clone();
            w.last_request = Some(request.clone());
        });

        if list_equal_unordered(&previous_resources, &request.resource_names) {
            debug!(
                r#type = stype,
                con = %con.id(),
                version = %request.version_info,
                nonce = %request.response_nonce,
                "ack",
            );
            return false;
        }
        debug!(
            r#type = stype,
            con = %con.id(),
            previous = ?previous_resources,
            new = ?request.resource_names,
            "resource change",
        );
        true
    }

    /// First-request handshake: parse the node into a proxy, check
    /// identities, assign a connection id, and register.
    fn init_connection(
        &self,
        node: &Node,
        peer_addr: String,
        identities: Vec<String>,
        push_tx: mpsc::Sender<Event>,
        out_tx: mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>,
    ) -> Result<Arc<Connection>> {
        let mut proxy = self.init_proxy(node)?;

        if !proxy.metadata.generator.is_empty() {
            proxy.generator = self.generators.get(&proxy.metadata.generator).cloned();
        }

        if self.config.enable_identity_check && !identities.is_empty() {
            if let Err(reason) = check_connection_identity(&proxy, &identities) {
                warn!(peer = %peer_addr, identities = ?identities, %reason, "unauthorized ads stream");
                return Err(Error::Unauthorized(reason));
            }
        }

        let con = Arc::new(Connection::new(
            self.next_connection_id(&node.id),
            peer_addr,
            identities,
            Instant::now(),
            Arc::new(proxy),
            push_tx,
            out_tx,
            self.config.send_timeout,
        ));

        self.add_connection(&con);
        if let Some(watcher) = &self.internal_watcher {
            watcher.on_connect(&con);
        }
        Ok(con)
    }

    /// Build the proxy snapshot for a node against the current push
    /// context.
    fn init_proxy(&self, node: &Node) -> Result<Proxy> {
        let proxy = parse_service_node(node)?;
        let push = self.env.push_context();
        self.set_proxy_state(&proxy, &push);

        // All instances share the proxy's address, so the first one's
        // locality stands for all of them.
        if let Some(instance) = proxy.service_instances().first() {
            proxy.set_locality(convert_locality(&instance.endpoint.locality));
        }

        // Nothing in the registry: fall back to the locality the node
        // claimed. Less precise, but still usable for locality-aware
        // balancing.
        if is_locality_empty(&proxy.locality()) {
            if let Some(locality) = &node.locality {
                proxy.set_locality(locality.clone());
            }
        }

        Ok(proxy)
    }

    /// Re-derive the proxy's store-dependent state. A config change can
    /// make a different sidecar scope applicable, so this runs on every
    /// full push even when it is often redundant.
    pub(crate) fn set_proxy_state(&self, proxy: &Proxy, push: &Arc<crate::model::context::PushContext>) {
        proxy.set_workload_labels(self.env.discovery().proxy_workload_labels(proxy));
        proxy.set_service_instances(push.discovery().proxy_service_instances(proxy));
        proxy.set_sidecar_scope(push.sidecar_scope_for(proxy));
        proxy.set_merged_gateways(push.gateways_for(proxy));
    }

    pub(crate) fn update_proxy(
        &self,
        proxy: &Proxy,
        push: &Arc<crate::model::context::PushContext>,
    ) {
        self.set_proxy_state(proxy, push);
        if is_locality_empty(&proxy.locality()) {
            if let Some(instance) = proxy.service_instances().first() {
                proxy.set_locality(convert_locality(&instance.endpoint.locality));
            }
        }
    }

    fn add_connection(&self, con: &Arc<Connection>) {
        self.clients
            .write()
            .expect("registry lock")
            .insert(con.id().to_string(), Arc::clone(con));
        metrics::record_clients(&con.proxy().metadata.proxy_version, 1.0);
    }

    fn remove_connection(&self, con: &Arc<Connection>) {
        {
            let mut clients = self.clients.write().expect("registry lock");
            if clients.remove(con.id()).is_none() {
                error!(con = %con.id(), "removing connection for unknown node");
                metrics::inc_internal_errors();
            } else {
                metrics::record_clients(&con.proxy().metadata.proxy_version, -1.0);
            }
        }
        if let Some(reporter) = &self.status_reporter {
            let reporter = Arc::clone(reporter);
            let con_id = con.id().to_string();
            tokio::spawn(async move {
                reporter.register_disconnect(&con_id, &ALL_EVENT_TYPES);
            });
        }
    }
}

/// Accept on the first identity whose namespace and service account
/// match the proxy's, with empty expected fields acting as wildcards.
fn check_connection_identity(
    proxy: &Proxy,
    identities: &[String],
) -> std::result::Result<(), String> {
    for raw in identities {
        let Ok(id) = SpiffeIdentity::parse(raw) else {
            continue;
        };
        if !proxy.config_namespace.is_empty() && id.namespace != proxy.config_namespace {
            continue;
        }
        if !proxy.metadata.service_account.is_empty()
            && id.service_account != proxy.metadata.service_account
        {
            continue;
        }
        return Ok(());
    }
    Err(format!(
        "no identities ({identities:?}) matched {}/{}",
        proxy.config_namespace, proxy.metadata.service_account
    ))
}

/// The inbound half of an ADS stream. Abstracted so sessions can be
/// driven without a transport in tests.
pub(crate) trait RequestStream: Send + 'static {
    /// Receive the next request. `Ok(None)` is a clean client EOF.
    fn recv(
        &mut self,
    ) -> impl Future<Output = std::result::Result<Option<DiscoveryRequest>, Status>> + Send;
}

impl RequestStream for Streaming<DiscoveryRequest> {
    async fn recv(&mut self) -> std::result::Result<Option<DiscoveryRequest>, Status> {
        self.message().await
    }
}

/// The receive pump: forward inbound requests into the session's queue
/// and classify the terminating condition.
async fn receive<S: RequestStream>(
    mut stream: S,
    tx: mpsc::Sender<std::result::Result<DiscoveryRequest, Status>>,
    peer_addr: String,
) {
    loop {
        match stream.recv().await {
            Ok(Some(request)) => {
                if tx.send(Ok(request)).await.is_err() {
                    // Session exited; stop reading.
                    return;
                }
            }
            Ok(None) => {
                debug!(peer = %peer_addr, "ads stream closed by client");
                return;
            }
            Err(status) => {
                if is_expected_stream_error(&status) {
                    info!(peer = %peer_addr, %status, "ads stream terminated");
                } else {
                    metrics::inc_internal_errors();
                    error!(peer = %peer_addr, %status, "ads stream terminated with error");
                    let _ = tx.send(Err(status)).await;
                }
                return;
            }
        }
    }
}

/// The gRPC-facing service. Thin: readiness, authentication, and push
/// context initialization happen here; everything else on the session
/// task.
#[derive(Clone)]
pub struct AdsService {
    server: Arc<DiscoveryServer>,
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream =
        ReceiverStream<std::result::Result<DiscoveryResponse, Status>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let server = Arc::clone(&self.server);

        if !server.is_server_ready() {
            return Err(Error::NotReady.into());
        }

        let peer_addr = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let identities = server.authenticator.authenticate(&AuthContext {
            peer_addr: request.remote_addr(),
            metadata: request.metadata(),
        })?;
        if identities.is_empty() {
            debug!(peer = %peer_addr, "unauthenticated ads stream");
        } else {
            debug!(peer = %peer_addr, identities = ?identities, "authenticated ads stream");
        }

        // Returns immediately if the context was already initialized.
        server.env.push_context().init_context();

        let inbound = request.into_inner();
        let (out_tx, out_rx) = mpsc::channel(1);
        tokio::spawn(server.handle_stream(inbound, out_tx, peer_addr, identities));

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }

    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    /// The delta variant is deliberately not served; a partial behavior
    /// would be worse than an honest status.
    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("not implemented"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory harness: sessions driven over channels, with recording
    //! collaborators.

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use envoy_types::pb::google::protobuf::value::Kind;
    use envoy_types::pb::google::protobuf::{Any, Struct, Value};
    use envoy_types::pb::google::rpc::Status as RpcStatus;
    use tokio::time::{sleep, timeout};

    use crate::cache::XdsCache;
    use crate::generator::{ConfigGenerator, PushTypes};
    use crate::model::context::{ConfigKey, PushContext, PushRequest, ServiceDiscovery};
    use crate::model::{Labels, Service, ServiceInstance};

    impl RequestStream for mpsc::Receiver<std::result::Result<DiscoveryRequest, Status>> {
        async fn recv(&mut self) -> std::result::Result<Option<DiscoveryRequest>, Status> {
            match mpsc::Receiver::recv(self).await {
                Some(Ok(request)) => Ok(Some(request)),
                Some(Err(status)) => Err(status),
                None => Ok(None),
            }
        }
    }

    pub(crate) struct StaticDiscovery {
        pub(crate) services: Vec<Service>,
        pub(crate) instances: Vec<ServiceInstance>,
    }

    impl ServiceDiscovery for StaticDiscovery {
        fn services(&self) -> Vec<Service> {
            self.services.clone()
        }
        fn proxy_service_instances(&self, _proxy: &Proxy) -> Vec<ServiceInstance> {
            self.instances.clone()
        }
        fn proxy_workload_labels(&self, _proxy: &Proxy) -> Labels {
            Labels::default()
        }
    }

    pub(crate) fn any_resource(type_url: &str, name: &str) -> Any {
        Any {
            type_url: type_url.to_string(),
            value: name.as_bytes().to_vec(),
        }
    }

    /// Deterministic payloads: one resource per watched name, carrying
    /// the name as its value.
    pub(crate) struct EchoConfigGen;

    impl ConfigGenerator for EchoConfigGen {
        fn clusters(&self, _proxy: &Proxy, _push: &PushContext) -> Vec<Any> {
            vec![any_resource(CLUSTER_TYPE, "default-cluster")]
        }
        fn listeners(&self, _proxy: &Proxy, _push: &PushContext) -> Vec<Any> {
            vec![any_resource(LISTENER_TYPE, "default-listener")]
        }
        fn routes(&self, _proxy: &Proxy, _push: &PushContext, names: &[String]) -> Vec<Any> {
            names
                .iter()
                .map(|name| any_resource(ROUTE_TYPE, name))
                .collect()
        }
        fn endpoints(
            &self,
            _proxy: &Proxy,
            _push: &PushContext,
            clusters: &[String],
            updated_services: Option<&HashSet<String>>,
        ) -> Vec<Any> {
            clusters
                .iter()
                .filter(|cluster| {
                    updated_services.map_or(true, |services| services.contains(*cluster))
                })
                .map(|cluster| any_resource(ENDPOINT_TYPE, cluster))
                .collect()
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub(crate) events: Mutex<Vec<(String, String, String)>>,
        pub(crate) disconnects: Mutex<Vec<String>>,
    }

    impl StatusReporter for RecordingReporter {
        fn register_event(&self, con_id: &str, type_url: &str, nonce_or_version: &str) {
            self.events.lock().unwrap().push((
                con_id.to_string(),
                type_url.to_string(),
                nonce_or_version.to_string(),
            ));
        }
        fn register_disconnect(&self, con_id: &str, _type_urls: &[&str]) {
            self.disconnects.lock().unwrap().push(con_id.to_string());
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingWatcher {
        pub(crate) connects: Mutex<Vec<String>>,
        pub(crate) disconnects: Mutex<Vec<String>>,
        pub(crate) nacks: Mutex<Vec<(String, String)>>,
    }

    impl InternalWatcher for RecordingWatcher {
        fn on_connect(&self, con: &Arc<Connection>) {
            self.connects.lock().unwrap().push(con.id().to_string());
        }
        fn on_disconnect(&self, con: &Arc<Connection>) {
            self.disconnects.lock().unwrap().push(con.id().to_string());
        }
        fn on_nack(&self, proxy: &Proxy, request: &DiscoveryRequest) {
            self.nacks
                .lock()
                .unwrap()
                .push((proxy.node_id.clone(), request.type_url.clone()));
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    pub(crate) enum CacheOp {
        ClearAll,
        Clear(Vec<String>),
    }

    #[derive(Default)]
    pub(crate) struct RecordingCache {
        pub(crate) ops: Mutex<Vec<CacheOp>>,
    }

    impl XdsCache for RecordingCache {
        fn clear(&self, keys: &HashSet<ConfigKey>) {
            let mut names: Vec<String> = keys.iter().map(|key| key.name.clone()).collect();
            names.sort();
            self.ops.lock().unwrap().push(CacheOp::Clear(names));
        }
        fn clear_all(&self) {
            self.ops.lock().unwrap().push(CacheOp::ClearAll);
        }
    }

    /// Refuses every push; subscriptions still get their direct
    /// responses.
    pub(crate) struct NeverPush;

    impl PushPolicy for NeverPush {
        fn proxy_needs_push(&self, _proxy: &Proxy, _request: &PushRequest) -> bool {
            false
        }
        fn push_type_for(&self, _proxy: &Proxy, _request: &PushRequest) -> PushTypes {
            PushTypes {
                cds: false,
                eds: false,
                lds: false,
                rds: false,
            }
        }
    }

    /// Succeeds on the first call, fails afterwards. Lets a session
    /// subscribe cleanly and then break on the next push.
    #[derive(Default)]
    pub(crate) struct FlakyGenerator {
        calls: AtomicUsize,
    }

    impl XdsResourceGenerator for FlakyGenerator {
        fn generate(
            &self,
            _proxy: &Proxy,
            _push: &PushContext,
            watched: &WatchedResource,
            _updates: &HashSet<ConfigKey>,
        ) -> Result<Option<Vec<Any>>> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Ok(Some(vec![any_resource(&watched.type_url, "generated")]))
            } else {
                Err(Error::Generate("generator exploded".to_string()))
            }
        }
    }

    pub(crate) struct StaticGenerator(pub(crate) Vec<Any>);

    impl XdsResourceGenerator for StaticGenerator {
        fn generate(
            &self,
            _proxy: &Proxy,
            _push: &PushContext,
            _watched: &WatchedResource,
            _updates: &HashSet<ConfigKey>,
        ) -> Result<Option<Vec<Any>>> {
            Ok(Some(self.0.clone()))
        }
    }

    pub(crate) const TEST_NODE_ID: &str = "sidecar~10.0.0.1~app-1.test~test.svc.cluster.local";

    pub(crate) fn string_value(s: &str) -> Value {
        Value {
            kind: Some(Kind::StringValue(s.to_string())),
        }
    }

    pub(crate) fn test_node() -> Node {
        Node {
            id: TEST_NODE_ID.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn node_with_metadata(id: &str, fields: &[(&str, &str)]) -> Node {
        Node {
            id: id.to_string(),
            metadata: Some(Struct {
                fields: fields
                    .iter()
                    .map(|(key, value)| (key.to_string(), string_value(value)))
                    .collect(),
            }),
            ..Default::default()
        }
    }

    pub(crate) fn ads_request(
        node: Option<Node>,
        type_url: &str,
        names: &[&str],
        nonce: &str,
        version: &str,
    ) -> DiscoveryRequest {
        DiscoveryRequest {
            node,
            type_url: type_url.to_string(),
            resource_names: names.iter().map(|s| s.to_string()).collect(),
            response_nonce: nonce.to_string(),
            version_info: version.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn subscribe(type_url: &str, names: &[&str]) -> DiscoveryRequest {
        ads_request(Some(test_node()), type_url, names, "", "")
    }

    pub(crate) fn ack(type_url: &str, names: &[&str], nonce: &str, version: &str) -> DiscoveryRequest {
        ads_request(None, type_url, names, nonce, version)
    }

    pub(crate) fn nack(type_url: &str, nonce: &str, code: i32, message: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: type_url.to_string(),
            response_nonce: nonce.to_string(),
            error_detail: Some(RpcStatus {
                code,
                message: message.to_string(),
                details: Vec::new(),
            }),
            ..Default::default()
        }
    }

    pub(crate) fn test_env() -> Arc<Environment> {
        let discovery = Arc::new(StaticDiscovery {
            services: vec![Service {
                hostname: "x".to_string(),
                namespace: "test".to_string(),
            }],
            instances: Vec::new(),
        });
        let env = Arc::new(Environment::new(discovery));
        env.push_context().init_context();
        env
    }

    pub(crate) fn test_server() -> Arc<DiscoveryServer> {
        let server = DiscoveryServer::builder(test_env(), Arc::new(EchoConfigGen)).build();
        server.set_server_ready(true);
        server
    }

    /// One ADS stream driven over channels: requests in, responses out.
    pub(crate) struct TestStream {
        req_tx: Option<mpsc::Sender<std::result::Result<DiscoveryRequest, Status>>>,
        pub(crate) out_rx: mpsc::Receiver<std::result::Result<DiscoveryResponse, Status>>,
    }

    pub(crate) fn open_stream(server: &Arc<DiscoveryServer>) -> TestStream {
        open_stream_with_identities(server, Vec::new())
    }

    pub(crate) fn open_stream_with_identities(
        server: &Arc<DiscoveryServer>,
        identities: Vec<String>,
    ) -> TestStream {
        let (req_tx, req_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        tokio::spawn(Arc::clone(server).handle_stream(
            req_rx,
            out_tx,
            "127.0.0.1:52000".to_string(),
            identities,
        ));
        TestStream {
            req_tx: Some(req_tx),
            out_rx,
        }
    }

    impl TestStream {
        pub(crate) async fn send(&self, request: DiscoveryRequest) {
            self.req_tx
                .as_ref()
                .expect("stream already closed")
                .send(Ok(request))
                .await
                .expect("stream open");
        }

        /// Close the client side of the stream (a clean EOF).
        pub(crate) fn close(&mut self) {
            self.req_tx = None;
        }

        pub(crate) async fn response(&mut self) -> DiscoveryResponse {
            match timeout(Duration::from_secs(2), self.out_rx.recv()).await {
                Ok(Some(Ok(response))) => response,
                other => panic!("expected a response, got {other:?}"),
            }
        }

        pub(crate) async fn expect_error(&mut self) -> Status {
            match timeout(Duration::from_secs(2), self.out_rx.recv()).await {
                Ok(Some(Err(status))) => status,
                other => panic!("expected an error, got {other:?}"),
            }
        }

        pub(crate) async fn expect_silence(&mut self) {
            if let Ok(traffic) = timeout(Duration::from_millis(150), self.out_rx.recv()).await {
                panic!("expected no traffic, got {traffic:?}");
            }
        }

        pub(crate) async fn expect_closed(&mut self) {
            match timeout(Duration::from_secs(2), self.out_rx.recv()).await {
                Ok(None) => {}
                other => panic!("expected stream end, got {other:?}"),
            }
        }
    }

    pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const MESH_TYPE: &str = "type.googleapis.com/test.config.v1.Mesh";

    #[tokio::test]
    async fn clean_cds_ack() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let response = stream.response().await;
        assert_eq!(response.type_url, CLUSTER_TYPE);
        assert!(!response.nonce.is_empty());

        stream
            .send(ack(CLUSTER_TYPE, &[], &response.nonce, &response.version_info))
            .await;
        stream.expect_silence().await;

        let con = server.connection_snapshot().pop().expect("registered");
        assert_eq!(con.nonce_acked(CLUSTER_TYPE), response.nonce);
        let watched = con.watched(CLUSTER_TYPE).expect("watched");
        assert_eq!(watched.version_acked, response.version_info);
        assert_eq!(watched.nonce_sent, response.nonce);
    }

    #[tokio::test]
    async fn stale_nonce_is_ignored() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let response = stream.response().await;
        stream
            .send(ack(CLUSTER_TYPE, &[], &response.nonce, &response.version_info))
            .await;
        stream.expect_silence().await;

        stream.send(ack(CLUSTER_TYPE, &[], "n0", "v0")).await;
        stream.expect_silence().await;

        let con = server.connection_snapshot().pop().expect("registered");
        let watched = con.watched(CLUSTER_TYPE).expect("watched");
        assert_eq!(watched.nonce_acked, response.nonce);
        assert_eq!(watched.version_acked, response.version_info);
    }

    #[tokio::test]
    async fn resource_change_triggers_response() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let first = stream.response().await;
        stream
            .send(ack(CLUSTER_TYPE, &[], &first.nonce, &first.version_info))
            .await;
        stream.expect_silence().await;

        // Same nonce, different resource names: a response is owed.
        stream
            .send(ack(CLUSTER_TYPE, &["c1", "c2"], &first.nonce, &first.version_info))
            .await;
        let second = stream.response().await;
        assert_eq!(second.type_url, CLUSTER_TYPE);
        assert_ne!(second.nonce, first.nonce);

        let con = server.connection_snapshot().pop().expect("registered");
        eventually(|| con.nonce_sent(CLUSTER_TYPE) == second.nonce).await;
    }

    #[tokio::test]
    async fn ack_with_reordered_names_is_a_noop() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(subscribe(ENDPOINT_TYPE, &["a", "b"])).await;
        let response = stream.response().await;

        stream
            .send(ack(ENDPOINT_TYPE, &["b", "a"], &response.nonce, &response.version_info))
            .await;
        stream.expect_silence().await;

        let con = server.connection_snapshot().pop().expect("registered");
        assert_eq!(con.nonce_acked(ENDPOINT_TYPE), response.nonce);

        // One extra name is a resource change again.
        stream
            .send(ack(ENDPOINT_TYPE, &["a", "b", "c"], &response.nonce, &response.version_info))
            .await;
        let next = stream.response().await;
        assert_eq!(next.type_url, ENDPOINT_TYPE);
        assert_eq!(next.resources.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_subscription_initializes_once() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(subscribe(ENDPOINT_TYPE, &["x"])).await;
        stream.send(subscribe(ENDPOINT_TYPE, &["x"])).await;
        let first = stream.response().await;
        let second = stream.response().await;
        assert_ne!(first.nonce, second.nonce);

        let con = server.connection_snapshot().pop().expect("registered");
        assert_eq!(con.proxy().watched_snapshot().len(), 1);

        // Once nonces exist, the same subscription is a plain ack.
        stream
            .send(ack(ENDPOINT_TYPE, &["x"], &second.nonce, &second.version_info))
            .await;
        stream.expect_silence().await;
        assert_eq!(con.nonce_acked(ENDPOINT_TYPE), second.nonce);
    }

    #[tokio::test]
    async fn reconnect_with_unknown_nonce_gets_lds() {
        let server = test_server();
        let mut stream = open_stream(&server);

        // A brand-new stream echoing state from a previous server run.
        stream
            .send(ads_request(Some(test_node()), LISTENER_TYPE, &[], "nZ", "vZ"))
            .await;
        let response = stream.response().await;
        assert_eq!(response.type_url, LISTENER_TYPE);
        assert_eq!(response.version_info, server.version_info());

        let con = server.connection_snapshot().pop().expect("registered");
        eventually(|| con.watching(LISTENER_TYPE)).await;
    }

    #[tokio::test]
    async fn reconnect_with_unknown_nonce_stores_eds_names() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream
            .send(ads_request(Some(test_node()), ENDPOINT_TYPE, &["x"], "nZ", "vZ"))
            .await;
        let response = stream.response().await;
        assert_eq!(response.type_url, ENDPOINT_TYPE);

        let con = server.connection_snapshot().pop().expect("registered");
        let watched = con.watched(ENDPOINT_TYPE).expect("watched");
        assert_eq!(watched.resource_names, vec!["x".to_string()]);
        assert!(watched.last_request.is_some());
    }

    #[tokio::test]
    async fn nack_produces_no_response_and_reaches_watcher() {
        let watcher = Arc::new(RecordingWatcher::default());
        let server = DiscoveryServer::builder(test_env(), Arc::new(EchoConfigGen))
            .internal_watcher(watcher.clone())
            .build();
        server.set_server_ready(true);
        let mut stream = open_stream(&server);

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let response = stream.response().await;

        // INVALID_ARGUMENT
        stream.send(nack(CLUSTER_TYPE, &response.nonce, 3, "bad config")).await;
        stream.expect_silence().await;

        let nacks = watcher.nacks.lock().unwrap();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].0, TEST_NODE_ID);
        assert_eq!(nacks[0].1, CLUSTER_TYPE);

        // Subscription state untouched by the nack.
        drop(nacks);
        let con = server.connection_snapshot().pop().expect("registered");
        assert_eq!(con.nonce_acked(CLUSTER_TYPE), "");
    }

    #[tokio::test]
    async fn missing_node_id_rejects_stream() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(ads_request(None, CLUSTER_TYPE, &[], "", "")).await;
        let status = stream.expect_error().await;
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("missing node ID"));
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn identity_mismatch_is_unauthorized() {
        let server = test_server();
        let mut stream = open_stream_with_identities(
            &server,
            vec!["spiffe://cluster.local/ns/other/sa/default".to_string()],
        );

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let status = stream.expect_error().await;
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn matching_identity_is_accepted() {
        let server = test_server();
        let mut stream = open_stream_with_identities(
            &server,
            vec![
                "not-a-spiffe-id".to_string(),
                "spiffe://cluster.local/ns/test/sa/default".to_string(),
            ],
        );

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let response = stream.response().await;
        assert_eq!(response.type_url, CLUSTER_TYPE);
        assert_eq!(server.client_count(), 1);
    }

    #[tokio::test]
    async fn clean_eof_unregisters_connection() {
        let watcher = Arc::new(RecordingWatcher::default());
        let server = DiscoveryServer::builder(test_env(), Arc::new(EchoConfigGen))
            .internal_watcher(watcher.clone())
            .build();
        server.set_server_ready(true);
        let mut stream = open_stream(&server);

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let _ = stream.response().await;
        assert_eq!(server.client_count(), 1);

        // Client closes its side.
        stream.close();
        stream.expect_closed().await;
        eventually(|| server.client_count() == 0).await;
        eventually(|| watcher.disconnects.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn connection_ids_are_monotonic() {
        let server = test_server();
        let mut first = open_stream(&server);
        first.send(subscribe(CLUSTER_TYPE, &[])).await;
        let _ = first.response().await;

        let mut second = open_stream(&server);
        second.send(subscribe(CLUSTER_TYPE, &[])).await;
        let _ = second.response().await;

        let mut ids: Vec<String> = server
            .connection_snapshot()
            .iter()
            .map(|con| con.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids[0], format!("{TEST_NODE_ID}-1"));
        assert_eq!(ids[1], format!("{TEST_NODE_ID}-2"));
    }

    #[tokio::test]
    async fn custom_type_url_routes_to_registered_generator() {
        let server = DiscoveryServer::builder(test_env(), Arc::new(EchoConfigGen))
            .generator(
                MESH_TYPE,
                Arc::new(StaticGenerator(vec![any_resource(MESH_TYPE, "mesh")])),
            )
            .build();
        server.set_server_ready(true);
        let mut stream = open_stream(&server);

        stream.send(subscribe(MESH_TYPE, &["default"])).await;
        let response = stream.response().await;
        assert_eq!(response.type_url, MESH_TYPE);
        assert_eq!(response.resources.len(), 1);

        let con = server.connection_snapshot().pop().expect("registered");
        let watched = con.watched(MESH_TYPE).expect("watched");
        assert_eq!(watched.resource_names, vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn unknown_type_without_generator_is_dropped() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(subscribe(MESH_TYPE, &["default"])).await;
        stream.expect_silence().await;
        // The subscription still exists for a later generator push.
        let con = server.connection_snapshot().pop().expect("registered");
        assert!(con.watching(MESH_TYPE));
    }

    #[tokio::test]
    async fn metadata_generator_overrides_builtin_handling() {
        let server = DiscoveryServer::builder(test_env(), Arc::new(EchoConfigGen))
            .generator("api", Arc::new(StaticGenerator(vec![any_resource(MESH_TYPE, "mesh")])))
            .build();
        server.set_server_ready(true);
        let mut stream = open_stream(&server);

        let node = node_with_metadata(TEST_NODE_ID, &[("GENERATOR", "api")]);
        stream.send(ads_request(Some(node), MESH_TYPE, &[], "", "")).await;
        let response = stream.response().await;
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.resources[0].type_url, MESH_TYPE);
    }

    #[tokio::test]
    async fn requests_are_reported_to_status_reporter() {
        let reporter = Arc::new(RecordingReporter::default());
        let server = DiscoveryServer::builder(test_env(), Arc::new(EchoConfigGen))
            .status_reporter(reporter.clone())
            .build();
        server.set_server_ready(true);
        let mut stream = open_stream(&server);

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let _ = stream.response().await;

        let events = reporter.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|(_, type_url, _)| type_url == CLUSTER_TYPE));
    }

    /// The reconciler never runs for a request carrying an error
    /// detail, so even a malformed one cannot disturb watch state.
    #[tokio::test]
    async fn nack_with_stale_nonce_still_skips_response() {
        let server = test_server();
        let mut stream = open_stream(&server);

        stream.send(subscribe(CLUSTER_TYPE, &[])).await;
        let response = stream.response().await;

        stream.send(nack(CLUSTER_TYPE, "bogus-nonce", 13, "broken")).await;
        stream.expect_silence().await;

        let con = server.connection_snapshot().pop().expect("registered");
        assert_eq!(con.nonce_sent(CLUSTER_TYPE), response.nonce);
    }

    #[tokio::test]
    async fn not_ready_server_rejects_streams() {
        // Exercised through the service-level gate rather than the
        // session: handle_stream is never reached.
        let server = test_server();
        server.set_server_ready(false);
        assert!(!server.is_server_ready());
    }
}
