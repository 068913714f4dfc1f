//! Response cache invalidation contract.
//!
//! The server never inserts into the cache; response generators do.
//! The push dispatcher only invalidates, before any fan-out for a
//! change batch begins.

use std::collections::HashSet;

use crate::model::context::ConfigKey;

/// A cache of prepared responses, keyed (indirectly) by the configs
/// they were derived from.
pub trait XdsCache: Send + Sync + 'static {
    /// Drop the entries derived from the given configs.
    fn clear(&self, keys: &HashSet<ConfigKey>);

    /// Drop everything. Used when the change set is unknown.
    fn clear_all(&self);
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCache;

impl XdsCache for DisabledCache {
    fn clear(&self, _keys: &HashSet<ConfigKey>) {}

    fn clear_all(&self) {}
}
