//! SPIFFE identity parsing.
//!
//! Connection identities arrive as opaque strings; the ones that matter
//! for authorization follow the workload identity form
//! `spiffe://<trust-domain>/ns/<namespace>/sa/<service-account>`.

use crate::error::Error;

const SPIFFE_SCHEME: &str = "spiffe://";

/// A parsed SPIFFE workload identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffeIdentity {
    /// Trust domain the identity was issued under.
    pub trust_domain: String,
    /// Workload namespace.
    pub namespace: String,
    /// Workload service account.
    pub service_account: String,
}

impl SpiffeIdentity {
    /// Parse an identity string of the form
    /// `spiffe://<trust-domain>/ns/<namespace>/sa/<service-account>`.
    pub fn parse(identity: &str) -> Result<Self, Error> {
        let rest = identity
            .strip_prefix(SPIFFE_SCHEME)
            .ok_or_else(|| Error::InvalidIdentity(identity.to_string()))?;

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [trust_domain, "ns", namespace, "sa", service_account]
                if !trust_domain.is_empty()
                    && !namespace.is_empty()
                    && !service_account.is_empty() =>
            {
                Ok(SpiffeIdentity {
                    trust_domain: trust_domain.to_string(),
                    namespace: namespace.to_string(),
                    service_account: service_account.to_string(),
                })
            }
            _ => Err(Error::InvalidIdentity(identity.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_workload_identity() {
        let id = SpiffeIdentity::parse("spiffe://cluster.local/ns/default/sa/bookinfo").unwrap();
        assert_eq!(id.trust_domain, "cluster.local");
        assert_eq!(id.namespace, "default");
        assert_eq!(id.service_account, "bookinfo");
    }

    #[test]
    fn rejects_malformed_identities() {
        for bad in [
            "",
            "cluster.local/ns/default/sa/bookinfo",
            "spiffe://cluster.local",
            "spiffe://cluster.local/ns/default",
            "spiffe://cluster.local/ns//sa/bookinfo",
            "spiffe://cluster.local/sa/bookinfo/ns/default",
            "spiffe://cluster.local/ns/default/sa/bookinfo/extra",
        ] {
            assert!(SpiffeIdentity::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
