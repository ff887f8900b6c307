//! Typed, validated policy objects.
//!
//! Raw cluster objects are turned into these types by [`validation`] and
//! held in the [`working_set::WorkingSet`]. Only objects that passed
//! validation ever reach the compiler.

pub mod validation;
pub mod working_set;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use jiff::Timestamp;

use crate::watcher::ResourceKey;

pub use validation::{
    ConflictError, ValidationError, detect_conflicts, validate_caching_policy, validate_ingress,
    validate_records, validate_sni_policy, validate_tls_secret,
};
pub use working_set::{ActiveResourceSet, Admission, WorkingSet};

/// Where a policy object came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub key: ResourceKey,
    /// `metadata.generation`, when the API server sets one.
    pub generation: Option<i64>,
    /// `metadata.creationTimestamp`.
    pub created: Option<Timestamp>,
}

impl Origin {
    /// Precedence between two objects competing for the same target.
    ///
    /// `Greater` means `self` wins: the newer object wins, and objects
    /// created at the same instant fall back to the smaller `namespace/name`.
    pub fn precedence_cmp(&self, other: &Origin) -> Ordering {
        self.created
            .cmp(&other.created)
            .then_with(|| other.key.cmp(&self.key))
    }

    pub fn outranks(&self, other: &Origin) -> bool {
        self.precedence_cmp(other) == Ordering::Greater
    }
}

/// Identity plus metadata generation of a resource contributing to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceRef {
    pub key: ResourceKey,
    pub generation: Option<i64>,
}

impl From<&Origin> for ResourceRef {
    fn from(origin: &Origin) -> Self {
        Self {
            key: origin.key.clone(),
            generation: origin.generation,
        }
    }
}

/// Host pattern used by caching selectors and SNI entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostPattern {
    /// `*`: every host.
    Any,
    /// A single fully-qualified host.
    Exact(String),
    /// `*.suffix`: any host with at least one label in front of `suffix`.
    Wildcard(String),
}

impl HostPattern {
    /// Whether this pattern covers a route host.
    ///
    /// Route hosts are either exact, a `*.suffix` wildcard, or `*` for
    /// rules without a host. A wildcard route host is only covered by an
    /// identical wildcard or by `Any`.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Exact(h) => h == host,
            HostPattern::Wildcard(suffix) => match host.strip_prefix("*.") {
                Some(route_suffix) => route_suffix == suffix,
                None => host
                    .strip_suffix(suffix.as_str())
                    .and_then(|head| head.strip_suffix('.'))
                    .is_some_and(|label| !label.is_empty()),
            },
        }
    }

    /// Number of literal characters, used for longest-match ordering.
    pub fn literal_len(&self) -> usize {
        match self {
            HostPattern::Any => 0,
            HostPattern::Exact(h) => h.len(),
            HostPattern::Wildcard(s) => s.len(),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, HostPattern::Exact(_))
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Any => f.write_str("*"),
            HostPattern::Exact(h) => f.write_str(h),
            HostPattern::Wildcard(s) => write!(f, "*.{s}"),
        }
    }
}

/// How a route path is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathType {
    Exact,
    Prefix,
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathType::Exact => f.write_str("Exact"),
            PathType::Prefix => f.write_str("Prefix"),
        }
    }
}

/// Client-facing scheme a route is served on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// In-cluster service a route forwards to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Backend {
    pub service: String,
    pub namespace: String,
    pub port: u16,
}

/// One host/path entry of an Ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    /// Exact host, `*.suffix`, or `*` when the Ingress rule had no host.
    pub host: String,
    pub path: String,
    pub path_type: PathType,
    pub backend: Backend,
    pub scheme: Scheme,
}

/// A TLS block of an Ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsBinding {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

/// Validated view of one Ingress object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRoutes {
    pub origin: Origin,
    pub rules: Vec<IngressRule>,
    pub default_backend: Option<Backend>,
    pub tls: Vec<TlsBinding>,
    /// Lua source attached to every route of this Ingress.
    pub snippet: Option<String>,
    /// Redirect target replacing the backend of every route.
    pub redirect: Option<String>,
    /// Replacement for the matched path prefix on the backend side.
    pub rewrite_target: Option<String>,
}

/// Validated CachingPolicy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub origin: Origin,
    pub host: HostPattern,
    /// Path prefix with any trailing `*` removed.
    pub path_prefix: String,
    pub ttl_secs: u64,
    /// Sorted, deduplicated header names.
    pub vary_headers: Vec<String>,
    /// Sorted, deduplicated query parameter names.
    pub vary_query_params: Vec<String>,
}

/// Ordering key for selector specificity; larger is more specific.
pub type Specificity = (usize, bool, usize);

impl CachePolicy {
    /// Longest path prefix, then exact host before wildcard, then longest host.
    pub fn specificity(&self) -> Specificity {
        (
            self.path_prefix.len(),
            self.host.is_exact(),
            self.host.literal_len(),
        )
    }

    /// Whether the selector covers a route.
    pub fn selects(&self, host: &str, path: &str) -> bool {
        self.host.matches(host) && path.starts_with(self.path_prefix.as_str())
    }

    /// Whether two policies would produce the same cache behaviour.
    pub fn same_effect(&self, other: &CachePolicy) -> bool {
        self.ttl_secs == other.ttl_secs
            && self.vary_headers == other.vary_headers
            && self.vary_query_params == other.vary_query_params
    }

    /// Full ordering used to pick the winner among candidates for one route.
    pub fn resolution_cmp(&self, other: &CachePolicy) -> Ordering {
        self.specificity()
            .cmp(&other.specificity())
            .then_with(|| self.origin.precedence_cmp(&other.origin))
    }
}

/// Policy mode for SNI/Host comparison and origin certificate verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyMode {
    Enforced,
    Permissive,
    Disabled,
}

impl PolicyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::Enforced => "ENFORCED",
            PolicyMode::Permissive => "PERMISSIVE",
            PolicyMode::Disabled => "DISABLED",
        }
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENFORCED" => Ok(PolicyMode::Enforced),
            "PERMISSIVE" => Ok(PolicyMode::Permissive),
            "DISABLED" => Ok(PolicyMode::Disabled),
            other => Err(format!(
                "'{other}' is not one of ENFORCED, PERMISSIVE, DISABLED"
            )),
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client certificate requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VerifyClient {
    None,
    Moderate,
    Strict,
}

impl VerifyClient {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyClient::None => "NONE",
            VerifyClient::Moderate => "MODERATE",
            VerifyClient::Strict => "STRICT",
        }
    }
}

impl FromStr for VerifyClient {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(VerifyClient::None),
            "MODERATE" => Ok(VerifyClient::Moderate),
            "STRICT" => Ok(VerifyClient::Strict),
            other => Err(format!("'{other}' is not one of NONE, MODERATE, STRICT")),
        }
    }
}

impl fmt::Display for VerifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS handshake policy for one fqdn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniRule {
    pub fqdn: HostPattern,
    pub host_sni_policy: PolicyMode,
    pub verify_server_policy: PolicyMode,
    pub verify_client: VerifyClient,
    pub http2: bool,
}

/// Validated SNIPolicy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniPolicySet {
    pub origin: Origin,
    pub entries: Vec<SniRule>,
}

/// Validated `kubernetes.io/tls` Secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub origin: Origin,
    pub cert_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBundle")
            .field("origin", &self.origin)
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Validated records ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOverrides {
    pub origin: Origin,
    pub records: BTreeMap<String, String>,
    /// Entries left out because they failed validation.
    pub ignored: Vec<ValidationError>,
}
