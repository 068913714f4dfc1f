//! Distribution status reporting contract.
//!
//! The reporter tracks which config version each connection has
//! observed per resource type. The server registers an event both when
//! a response is acknowledged and when a push decides nothing is owed,
//! so convergence accounting stays accurate either way.

/// Observer of per-connection distribution progress.
pub trait StatusReporter: Send + Sync + 'static {
    /// A connection has observed `nonce_or_version` for a type URL.
    fn register_event(&self, con_id: &str, type_url: &str, nonce_or_version: &str);

    /// A connection went away; its pending distribution state for the
    /// given types should be dropped.
    fn register_disconnect(&self, con_id: &str, type_urls: &[&str]);
}
