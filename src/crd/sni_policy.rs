//! SNIPolicy Custom Resource Definition.
//!
//! Per-host TLS handshake policy: how SNI/Host mismatches are treated,
//! whether origin certificates are verified, whether client certificates
//! are demanded, and whether HTTP/2 is offered.
//!
//! Enumerated fields are plain strings so that a typo in one object is
//! reported on that object's status instead of breaking the watch.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PolicyStatus;

/// SNIPolicy is a list of per-fqdn TLS policies.
///
/// Example:
/// ```yaml
/// apiVersion: k8s.trafficserver.apache.com/v1alpha1
/// kind: SNIPolicy
/// metadata:
///   name: media
/// spec:
///   sni:
///     - fqdn: test.media.com
///       hostSniPolicy: PERMISSIVE
///       verifyClient: STRICT
///       http2: false
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.trafficserver.apache.com",
    version = "v1alpha1",
    kind = "SNIPolicy",
    plural = "snipolicies",
    shortname = "asp",
    status = "PolicyStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Applied", "type":"integer", "jsonPath":".status.appliedGeneration"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SNIPolicySpec {
    /// One entry per fqdn.
    #[serde(default)]
    pub sni: Vec<SniEntrySpec>,
}

/// TLS policy for a single fqdn.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SniEntrySpec {
    /// Exact host or `*.suffix` wildcard.
    pub fqdn: String,

    /// ENFORCED, PERMISSIVE or DISABLED.
    #[serde(default = "default_host_sni_policy")]
    pub host_sni_policy: String,

    /// ENFORCED, PERMISSIVE or DISABLED.
    #[serde(default = "default_verify_server_policy")]
    pub verify_server_policy: String,

    /// NONE, MODERATE or STRICT.
    #[serde(default = "default_verify_client")]
    pub verify_client: String,

    /// Offer HTTP/2 via ALPN.
    #[serde(default = "default_http2")]
    pub http2: bool,
}

fn default_host_sni_policy() -> String {
    "ENFORCED".to_string()
}

fn default_verify_server_policy() -> String {
    "DISABLED".to_string()
}

fn default_verify_client() -> String {
    "NONE".to_string()
}

fn default_http2() -> bool {
    true
}
