//! Push fan-out: from a configuration change to per-connection
//! responses.
//!
//! Global entry points invalidate the response cache, snapshot the
//! registry, and enqueue work; a dispatcher task drains the queue under
//! a concurrency bound and delivers events to session loops through
//! each connection's single-slot push channel. The channel stays
//! unbuffered on purpose: merging of outstanding work belongs to the
//! queue, and a buffer here would duplicate that and lose the merging.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info};

use super::connection::{Connection, Event};
use super::DiscoveryServer;
use crate::error::Result;
use crate::generator::XdsResourceGenerator;
use crate::metrics;
use crate::model::context::{
    config_names_of_kind, ConfigKind, PushContext, PushRequest, TriggerReason,
};
use crate::model::WatchedResource;
use crate::resource::{nonce, CLUSTER_TYPE, ENDPOINT_TYPE, LISTENER_TYPE, ROUTE_TYPE};

impl DiscoveryServer {
    /// Run the push dispatcher. Idempotent; later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let server = Arc::clone(self);
        tokio::spawn(server.send_pushes());
    }

    /// Drain the push queue, delivering one event per connection at a
    /// time and at most `concurrent_push_limit` overall.
    async fn send_pushes(self: Arc<Self>) {
        let limit = self.config.concurrent_push_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        loop {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("push semaphore is never closed");
            let (con, request) = self.queue.dequeue().await;
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                let (done_tx, done_rx) = oneshot::channel();
                let event = Event {
                    request,
                    done: done_tx,
                };
                if con.push_sender().send(event).await.is_ok() {
                    // Parked until the session invokes done; if the
                    // session dies first the dropped channel resolves
                    // the wait the same way.
                    let _ = done_rx.await;
                }
                queue.mark_done(&con);
                drop(permit);
            });
        }
    }

    /// Schedule a push for every connected client.
    ///
    /// The response cache is invalidated before any fan-out: fully if
    /// the change set is unknown, else just the named entries.
    pub fn push_all(&self, version: &str, mut request: PushRequest) {
        if request.configs_updated.is_empty() {
            self.cache.clear_all();
        } else {
            self.cache.clear(&request.configs_updated);
        }

        if !request.full {
            info!(
                version,
                services = ?config_names_of_kind(&request.configs_updated, ConfigKind::ServiceEntry),
                clients = self.client_count(),
                "incremental endpoint push",
            );
        } else {
            let total_services = request.push.services().len();
            info!(
                version,
                services = total_services,
                clients = self.client_count(),
                "full push",
            );
            metrics::record_pushed_services(total_services);
        }

        request.start = Instant::now();
        self.start_push(request);
    }

    /// Schedule a full push for the one connection matching a cluster
    /// id and primary address, if it is connected here. The proxy may
    /// well be connected to a different control plane instance.
    pub fn proxy_update(&self, cluster_id: &str, ip: &str) {
        let found = self.connection_snapshot().into_iter().find(|con| {
            con.proxy().metadata.cluster_id == cluster_id
                && con.proxy().ip_addresses.first().map(String::as_str) == Some(ip)
        });
        let Some(con) = found else {
            return;
        };
        self.queue.enqueue(
            &con,
            &PushRequest::full(self.env.push_context(), TriggerReason::ProxyUpdate),
        );
    }

    /// Enqueue a request against a snapshot of the current connections.
    fn start_push(&self, request: PushRequest) {
        let pending = self.connection_snapshot();
        let in_flight = self.queue.pending();
        if in_flight != 0 {
            debug!(pending = in_flight, "starting new push with pushes still in flight");
        }
        for con in pending {
            self.queue.enqueue(&con, &request);
        }
    }

    /// Compute and send the new configuration for one connection. May
    /// be slow for large configs; runs on the connection's session
    /// task.
    pub(crate) async fn push_connection(
        &self,
        con: &Arc<Connection>,
        request: &PushRequest,
    ) -> Result<()> {
        if !request.full {
            // Incremental: at most an endpoint push for the updated
            // services, and only if the connection watches clusters.
            if !self.push_policy.proxy_needs_push(con.proxy(), request) {
                debug!(con = %con.id(), "skipping endpoint push, no updates required");
                return Ok(());
            }
            let updated_services =
                config_names_of_kind(&request.configs_updated, ConfigKind::ServiceEntry);
            if !con.clusters().is_empty() && !updated_services.is_empty() {
                self.push_eds(
                    &request.push,
                    con,
                    &self.version_info(),
                    Some(&updated_services),
                )
                .await?;
            }
            return Ok(());
        }

        self.update_proxy(con.proxy(), &request.push);

        // Depends on the freshly derived sidecar scope, so it must run
        // after the update above.
        if !self.push_policy.proxy_needs_push(con.proxy(), request) {
            debug!(con = %con.id(), "skipping push, no updates required");
            if let Some(reporter) = &self.status_reporter {
                // This version will never be sent to this client because
                // it is not a relevant diff; from the proxy's standpoint
                // it has effectively been applied.
                for event_type in crate::resource::ALL_EVENT_TYPES {
                    reporter.register_event(con.id(), event_type, &request.push.version);
                }
            }
            return Ok(());
        }

        info!(con = %con.id(), version = %request.push.version, "pushing");
        let current_version = self.version_info();

        // With a generator attached, the generic watch list replaces
        // the per-type handling; the generator decides per watch
        // whether the event needs a push.
        if let Some(generator) = con.proxy().generator() {
            for watched in con.proxy().watched_snapshot() {
                self.push_generator(
                    con,
                    &request.push,
                    &current_version,
                    &watched,
                    &request.configs_updated,
                    generator.as_ref(),
                )
                .await?;
            }
        }

        let push_types = self.push_policy.push_type_for(con.proxy(), request);

        if con.watching(CLUSTER_TYPE) && push_types.cds {
            self.push_cds(con, &request.push, &current_version).await?;
        } else if let Some(reporter) = &self.status_reporter {
            reporter.register_event(con.id(), CLUSTER_TYPE, &request.push.version);
        }

        if !con.clusters().is_empty() && push_types.eds {
            self.push_eds(&request.push, con, &current_version, None)
                .await?;
        } else if let Some(reporter) = &self.status_reporter {
            reporter.register_event(con.id(), ENDPOINT_TYPE, &request.push.version);
        }

        if con.watching(LISTENER_TYPE) && push_types.lds {
            self.push_lds(con, &request.push, &current_version).await?;
        } else if let Some(reporter) = &self.status_reporter {
            reporter.register_event(con.id(), LISTENER_TYPE, &request.push.version);
        }

        if !con.routes().is_empty() && push_types.rds {
            self.push_rds(con, &request.push, &current_version).await?;
        } else if let Some(reporter) = &self.status_reporter {
            reporter.register_event(con.id(), ROUTE_TYPE, &request.push.version);
        }

        metrics::record_convergence(request.start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn push_generator(
        &self,
        con: &Arc<Connection>,
        push: &Arc<PushContext>,
        version: &str,
        watched: &WatchedResource,
        updates: &HashSet<crate::model::context::ConfigKey>,
        generator: &dyn XdsResourceGenerator,
    ) -> Result<()> {
        let Some(resources) = generator.generate(con.proxy(), push, watched, updates)? else {
            return Ok(());
        };
        self.send_response(con, &watched.type_url, push, version, resources)
            .await
    }

    pub(crate) async fn push_cds(
        &self,
        con: &Arc<Connection>,
        push: &Arc<PushContext>,
        version: &str,
    ) -> Result<()> {
        let resources = self.config_gen.clusters(con.proxy(), push);
        debug!(con = %con.id(), clusters = resources.len(), "cds push");
        self.send_response(con, CLUSTER_TYPE, push, version, resources)
            .await
    }

    pub(crate) async fn push_lds(
        &self,
        con: &Arc<Connection>,
        push: &Arc<PushContext>,
        version: &str,
    ) -> Result<()> {
        let resources = self.config_gen.listeners(con.proxy(), push);
        debug!(con = %con.id(), listeners = resources.len(), "lds push");
        self.send_response(con, LISTENER_TYPE, push, version, resources)
            .await
    }

    pub(crate) async fn push_rds(
        &self,
        con: &Arc<Connection>,
        push: &Arc<PushContext>,
        version: &str,
    ) -> Result<()> {
        let routes = con.routes();
        let resources = self.config_gen.routes(con.proxy(), push, &routes);
        debug!(con = %con.id(), routes = resources.len(), "rds push");
        self.send_response(con, ROUTE_TYPE, push, version, resources)
            .await
    }

    pub(crate) async fn push_eds(
        &self,
        push: &Arc<PushContext>,
        con: &Arc<Connection>,
        version: &str,
        updated_services: Option<&HashSet<String>>,
    ) -> Result<()> {
        let clusters = con.clusters();
        let resources = self
            .config_gen
            .endpoints(con.proxy(), push, &clusters, updated_services);
        // An incremental push that matched none of the watched clusters
        // owes nothing; an empty response would reset the client.
        if updated_services.is_some() && resources.is_empty() {
            return Ok(());
        }
        debug!(
            con = %con.id(),
            clusters = clusters.len(),
            assignments = resources.len(),
            incremental = updated_services.is_some(),
            "eds push",
        );
        self.send_response(con, ENDPOINT_TYPE, push, version, resources)
            .await
    }

    pub(super) async fn send_response(
        &self,
        con: &Arc<Connection>,
        type_url: &str,
        push: &Arc<PushContext>,
        version: &str,
        resources: Vec<Any>,
    ) -> Result<()> {
        let response = DiscoveryResponse {
            type_url: type_url.to_string(),
            version_info: version.to_string(),
            nonce: nonce(&push.version),
            resources,
            ..Default::default()
        };
        con.send(response).await
    }
}
