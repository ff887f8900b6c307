//! Custom Resource Definitions (CRDs) for ats-ingress.
//!
//! - `CachingPolicy`: TTL and cache-key policy for a host/path selector
//! - `SNIPolicy`: per-fqdn TLS handshake policy

mod caching_policy;
mod condition;
mod sni_policy;

pub use caching_policy::*;
pub use condition::*;
pub use sni_policy::*;

use kube::CustomResourceExt;

/// API group shared by all ats-ingress CRDs.
pub const API_GROUP: &str = "k8s.trafficserver.apache.com";

/// Render every CRD as a multi-document YAML stream, ready for `kubectl apply -f -`.
pub fn crd_manifests() -> Result<String, serde_yaml::Error> {
    let mut out = String::new();
    for crd in [CachingPolicy::crd(), SNIPolicy::crd()] {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}
