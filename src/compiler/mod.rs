//! Config compiler: active resources in, Traffic Server configuration out.
//!
//! [`compile`] is a pure function of the [`ActiveResourceSet`] and the
//! [`CompileOptions`]. Every map is ordered and every ordering is total, so
//! the same inputs always render byte-identical files. [`Compiler`] wraps it
//! and stamps each distinct output with a strictly increasing generation.

pub mod precedence;
pub mod render;
pub mod sni;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::health::HealthState;
use crate::policy::{ActiveResourceSet, Backend, PathType, ResourceRef, Scheme};
use crate::watcher::{ResourceKey, ResourceKind};

pub use precedence::{host_order, path_order, resolve_cache};
pub use sni::{
    ClientCertificate, DEFAULT_SNI_POLICY, MismatchAction, ResolvedSni, ServerVerification,
    SniCheck, TlsAlert, evaluate_client_certificate, evaluate_host_sni,
    evaluate_server_verification,
};

/// Deployment facts the rendered files depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// DNS suffix of in-cluster services.
    pub cluster_domain: String,
    /// Directory Traffic Server reads its configuration from.
    pub config_dir: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            cluster_domain: "cluster.local".to_string(),
            config_dir: "/opt/ats/etc/trafficserver".to_string(),
        }
    }
}

/// Compiler invariant violation. Unreachable for a validated input set.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("compiler invariant violated: {0}")]
    Invariant(String),

    #[error("failed to render {file}: {source}")]
    Render {
        file: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Broad class of a route host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostClass {
    Exact,
    Wildcard,
    Any,
}

impl HostClass {
    pub fn of(host: &str) -> Self {
        if host == "*" {
            HostClass::Any
        } else if host.starts_with("*.") {
            HostClass::Wildcard
        } else {
            HostClass::Exact
        }
    }
}

/// Where a route sends matching requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Backend(Backend),
    /// Passed through verbatim.
    Redirect(String),
}

/// Winning caching policy for a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCache {
    pub policy: ResourceKey,
    pub ttl_secs: u64,
    pub vary_headers: Vec<String>,
    pub vary_query_params: Vec<String>,
}

/// One compiled route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub scheme: Scheme,
    pub path: String,
    pub path_type: PathType,
    pub target: RouteTarget,
    /// Replacement URL for backends, verbatim location for redirects.
    pub upstream: String,
    /// Ingress that owns this route.
    pub source: ResourceKey,
    /// File stem of the Lua snippet, relative to `snippets/`.
    pub snippet: Option<String>,
    pub rewrite: Option<String>,
    pub cache: Option<ResolvedCache>,
}

/// Everything the proxy does for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Ordered by descending specificity.
    pub routes: Vec<RouteEntry>,
    pub sni: ResolvedSni,
    pub mismatch_action: MismatchAction,
}

/// Certificate material bound to the hosts of Ingress TLS blocks.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBinding {
    pub secret: ResourceKey,
    pub hosts: Vec<String>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for CertificateBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBinding")
            .field("secret", &self.secret)
            .field("hosts", &self.hosts)
            .finish_non_exhaustive()
    }
}

/// Non-fatal problem found while compiling, attached to a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompileWarning {
    pub key: ResourceKey,
    pub reason: &'static str,
    pub message: String,
}

/// Compiled, proxy-independent view of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledConfig {
    /// Hosts with at least one route. Hosts without routes are absent.
    pub hosts: BTreeMap<String, HostConfig>,
    /// Effective `sni.yaml` entries in file order, default excluded.
    pub sni_entries: Vec<(crate::policy::SniRule, ResourceKey)>,
    /// Keyed by file stem under `certs/`.
    pub certificates: BTreeMap<String, CertificateBinding>,
    /// Lua source keyed by file stem under `snippets/`.
    pub snippets: BTreeMap<String, String>,
    pub records: BTreeMap<String, String>,
    pub warnings: Vec<CompileWarning>,
}

impl CompiledConfig {
    /// Hosts in rendering order.
    pub fn hosts_in_order(&self) -> Vec<(&str, &HostConfig)> {
        let mut hosts: Vec<(&str, &HostConfig)> =
            self.hosts.iter().map(|(h, c)| (h.as_str(), c)).collect();
        hosts.sort_by(|(a, _), (b, _)| host_order(a, b));
        hosts
    }
}

/// File stem for a namespaced object, unique per (namespace, name).
pub(crate) fn file_stem(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

pub(crate) fn snippet_stem(key: &ResourceKey) -> String {
    file_stem(&key.namespace, &key.name)
}

/// In-cluster URL of a backend, with the path the request is forwarded to.
pub fn upstream_url(backend: &Backend, path: &str, options: &CompileOptions) -> String {
    format!(
        "http://{}.{}.svc.{}:{}{}",
        backend.service, backend.namespace, options.cluster_domain, backend.port, path
    )
}

/// Compile the active resource set.
pub fn compile(
    set: &ActiveResourceSet,
    options: &CompileOptions,
) -> Result<CompiledConfig, CompileError> {
    let mut config = CompiledConfig::default();

    // 1. routes grouped by host, in specificity order
    let by_host = precedence::resolve_routes(precedence::route_candidates(set));

    // 3. SNI entries are needed per host below
    config.sni_entries = sni::effective_entries(set);

    for (host, candidates) in by_host {
        let mut routes = Vec::with_capacity(candidates.len());
        for c in candidates {
            // 2. caching per (host, path)
            let cache = resolve_cache(set.caching.values().map(Arc::as_ref), c.host, c.path);
            let upstream = match &c.target {
                RouteTarget::Backend(backend) => {
                    upstream_url(backend, c.rewrite.unwrap_or(c.path), options)
                }
                RouteTarget::Redirect(location) => location.clone(),
            };
            routes.push(RouteEntry {
                scheme: c.scheme,
                path: c.path.to_string(),
                path_type: c.path_type,
                target: c.target,
                upstream,
                source: c.origin.key.clone(),
                snippet: c.snippet,
                rewrite: c.rewrite.map(str::to_string),
                cache,
            });
        }
        let sni = sni::resolve_for_host(host, &config.sni_entries);
        // 4. mismatch action
        let mismatch_action = MismatchAction::for_mode(sni.rule.host_sni_policy);
        config.hosts.insert(
            host.to_string(),
            HostConfig {
                routes,
                sni,
                mismatch_action,
            },
        );
    }

    for routes in set.ingresses.values() {
        let key = &routes.origin.key;
        if let Some(snippet) = &routes.snippet {
            config.snippets.insert(snippet_stem(key), snippet.clone());
        }
        for binding in &routes.tls {
            let secret_key =
                ResourceKey::new(ResourceKind::Secret, &key.namespace, &binding.secret_name);
            match set.secrets.get(&secret_key) {
                Some(bundle) => {
                    let stem = file_stem(&secret_key.namespace, &secret_key.name);
                    let entry = config.certificates.entry(stem).or_insert_with(|| {
                        CertificateBinding {
                            secret: secret_key.clone(),
                            hosts: Vec::new(),
                            cert_pem: bundle.cert_pem.clone(),
                            key_pem: bundle.key_pem.clone(),
                        }
                    });
                    entry.hosts.extend(binding.hosts.iter().cloned());
                    entry.hosts.sort();
                    entry.hosts.dedup();
                }
                None => config.warnings.push(CompileWarning {
                    key: key.clone(),
                    reason: "SecretNotFound",
                    message: format!(
                        "TLS secret {} not found or invalid; hosts {:?} served without a certificate",
                        secret_key.namespaced_name(),
                        binding.hosts
                    ),
                }),
            }
        }
    }

    if let Some(records) = &set.records {
        config.records = records.records.clone();
    }

    check_invariants(&config)?;
    Ok(config)
}

fn check_invariants(config: &CompiledConfig) -> Result<(), CompileError> {
    for (host, host_config) in &config.hosts {
        if host_config.routes.is_empty() {
            return Err(CompileError::Invariant(format!(
                "host {host} present without routes"
            )));
        }
        if let Some(route) = host_config.routes.iter().find(|r| !r.path.starts_with('/')) {
            return Err(CompileError::Invariant(format!(
                "route {host} {} has a relative path",
                route.path
            )));
        }
        for pair in host_config.routes.windows(2) {
            if let [a, b] = pair
                && a.path == b.path
                && a.path_type == b.path_type
            {
                return Err(CompileError::Invariant(format!(
                    "duplicate route {host}{} after resolution",
                    a.path
                )));
            }
        }
    }
    Ok(())
}

/// An immutable, versioned compilation result.
#[derive(Debug, Clone)]
pub struct CompiledSnapshot {
    /// Strictly increasing across distinct outputs.
    pub generation: u64,
    /// Revision of the active set this was compiled from.
    pub revision: u64,
    /// SHA-256 over rendered files and records.
    pub digest: String,
    pub config: CompiledConfig,
    /// Rendered files keyed by path relative to the config directory.
    pub files: BTreeMap<String, String>,
    /// Resources that contributed to this snapshot.
    pub resources: Vec<ResourceRef>,
}

/// Digest over rendered files and records.
pub fn digest(files: &BTreeMap<String, String>, records: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, contents) in files {
        hasher.update(b"file\0");
        hasher.update(path.as_bytes());
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(contents.as_bytes());
    }
    for (name, value) in records {
        hasher.update(b"record\0");
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default)]
struct CompilerState {
    last_generation: u64,
    last: Option<Arc<CompiledSnapshot>>,
}

/// Assigns generations to compiled output.
///
/// Shared by every proxy target so a given set of files carries the same
/// generation everywhere.
pub struct Compiler {
    options: CompileOptions,
    state: Mutex<CompilerState>,
    health: Option<Arc<HealthState>>,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            state: Mutex::new(CompilerState::default()),
            health: None,
        }
    }

    /// Count new generations in `ats_ingress_snapshots_compiled_total`.
    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Compile and render a set, reusing the previous snapshot when nothing
    /// changed.
    ///
    /// A new generation is assigned only when the digest differs from the
    /// previous snapshot's.
    pub fn compile(&self, set: &ActiveResourceSet) -> Result<Arc<CompiledSnapshot>, CompileError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = &state.last
            && last.revision == set.revision
        {
            return Ok(last.clone());
        }

        let config = compile(set, &self.options)?;
        let files = render::render(&config, &self.options)?;
        let digest = digest(&files, &config.records);
        let resources = set.resources();

        let generation = match &state.last {
            Some(last) if last.digest == digest => last.generation,
            _ => state.last_generation + 1,
        };
        state.last_generation = generation;

        let snapshot = Arc::new(CompiledSnapshot {
            generation,
            revision: set.revision,
            digest,
            config,
            files,
            resources,
        });
        if generation == state.last.as_ref().map_or(0, |s| s.generation) {
            debug!(generation, revision = set.revision, "Compiled output unchanged");
        } else {
            if let Some(health) = &self.health {
                health.metrics.snapshots_compiled_total.inc();
            }
            info!(
                generation,
                revision = set.revision,
                hosts = snapshot.config.hosts.len(),
                files = snapshot.files.len(),
                digest = %snapshot.digest,
                "Compiled new configuration"
            );
        }
        state.last = Some(snapshot.clone());
        Ok(snapshot)
    }
}
