//! Server side of the [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol)
//! Aggregated Discovery Service (ADS).
//!
//! A single bidirectional gRPC stream per client carries every resource
//! type (clusters, endpoints, listeners, routes). This crate implements
//! the server half: the per-stream session state machine, ACK/NACK and
//! subscription reconciliation keyed by response nonces, and the fan-out
//! engine that turns a global configuration change into per-proxy
//! pushes.
//!
//! What a proxy should actually receive is supplied by the embedding
//! control plane through the [`generator`], [`auth`], [`cache`], and
//! [`status`] contracts; the wire types come from the `envoy-types`
//! generated stub.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xds_server::{DiscoveryServer, Environment};
//!
//! let env = Arc::new(Environment::new(store));
//! let server = DiscoveryServer::builder(env, config_gen).build();
//! server.start();
//! server.set_server_ready(true);
//!
//! tonic::transport::Server::builder()
//!     .add_service(server.grpc_service())
//!     .serve(addr)
//!     .await?;
//! ```

pub mod auth;
pub mod cache;
pub mod error;
pub mod generator;
mod metrics;
pub mod model;
pub mod resource;
pub mod server;
pub mod status;

pub use error::{Error, Result};
pub use model::context::{
    ConfigKey, ConfigKind, Environment, PushContext, PushRequest, ServiceDiscovery, TriggerReason,
};
pub use model::{Proxy, WatchedResource};
pub use server::{AdsService, Connection, DiscoveryConfig, DiscoveryServer, DiscoveryServerBuilder};
