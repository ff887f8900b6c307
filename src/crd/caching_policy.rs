//! CachingPolicy Custom Resource Definition.
//!
//! A CachingPolicy selects a set of routes by host and path prefix and
//! tells Traffic Server how long to keep responses for them, and which
//! request components make up the cache key.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PolicyStatus;

/// CachingPolicy configures response caching for matching routes.
///
/// Example:
/// ```yaml
/// apiVersion: k8s.trafficserver.apache.com/v1alpha1
/// kind: CachingPolicy
/// metadata:
///   name: media-images
/// spec:
///   selector:
///     host: "*.media.com"
///     path: "/images/*"
///   ttl: 30
///   cacheKey:
///     headers: ["Accept-Encoding"]
///     queryParams: ["v"]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.trafficserver.apache.com",
    version = "v1alpha1",
    kind = "CachingPolicy",
    plural = "cachingpolicies",
    shortname = "acp",
    status = "PolicyStatus",
    namespaced,
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.selector.host"}"#,
    printcolumn = r#"{"name":"Path", "type":"string", "jsonPath":".spec.selector.path"}"#,
    printcolumn = r#"{"name":"TTL", "type":"integer", "jsonPath":".spec.ttl"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CachingPolicySpec {
    /// Routes this policy applies to.
    #[serde(default)]
    pub selector: CacheSelector,

    /// Time to keep a response in cache, in seconds. `0` disables caching.
    pub ttl: i64,

    /// Request components added to the cache key.
    #[serde(default)]
    pub cache_key: CacheKeySpec,
}

/// Host/path glob selecting routes.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheSelector {
    /// Exact host, `*.suffix` wildcard, or `*` for every host.
    #[serde(default = "default_selector_host")]
    pub host: String,

    /// Path prefix, optionally ending in `*`.
    #[serde(default = "default_selector_path")]
    pub path: String,
}

impl Default for CacheSelector {
    fn default() -> Self {
        Self {
            host: default_selector_host(),
            path: default_selector_path(),
        }
    }
}

fn default_selector_host() -> String {
    "*".to_string()
}

fn default_selector_path() -> String {
    "/*".to_string()
}

/// Cache key components to vary on.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeySpec {
    /// Request header names.
    #[serde(default)]
    pub headers: Vec<String>,

    /// Query parameter names.
    #[serde(default)]
    pub query_params: Vec<String>,
}
