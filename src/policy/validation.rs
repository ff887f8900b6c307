//! Validation of raw cluster objects into typed policy objects.
//!
//! This module provides validation for:
//! - Ingress hosts, paths, backends and annotations
//! - CachingPolicy selectors, TTL and cache-key components
//! - SNIPolicy fqdns and enumerated modes
//! - TLS Secrets and the records ConfigMap
//!
//! and detection of conflicts between otherwise valid objects.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::ResourceExt;
use thiserror::Error;

use super::{
    ActiveResourceSet, Backend, CachePolicy, HostPattern, IngressRoutes, IngressRule, Origin,
    PathType, RecordOverrides, Scheme, SniPolicySet, SniRule, TlsBinding, TlsBundle,
};
use crate::crd::{CachingPolicy, SNIPolicy};
use crate::watcher::{ResourceKey, ResourceKind};

/// Annotation carrying a Lua snippet for every route of an Ingress.
pub const SNIPPET_ANNOTATION: &str = "ats.ingress.kubernetes.io/server-snippet";
/// Annotation turning every route of an Ingress into a redirect.
pub const REDIRECT_ANNOTATION: &str = "ats.ingress.kubernetes.io/redirect-to";
/// Annotation replacing the matched path prefix on the backend side.
pub const REWRITE_ANNOTATION: &str = "ats.ingress.kubernetes.io/rewrite-target";

/// Secret type carrying a certificate/key pair.
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
/// Prefix every record override key must carry.
pub const RECORD_PREFIX: &str = "proxy.config.";

/// Maximum length of a fully-qualified host.
pub const MAX_HOST_LEN: usize = 253;
/// Maximum length of a single DNS label.
pub const MAX_LABEL_LEN: usize = 63;

/// A resource spec that cannot be compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{key}: invalid {field}: {message}")]
pub struct ValidationError {
    pub key: ResourceKey,
    /// JSON-path-like location of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(key: &ResourceKey, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Two valid objects competing for the same target.
///
/// Resolved by precedence; the loser stays active but is overridden for
/// `target`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{loser} overridden by {winner} for {target}: {reason}")]
pub struct ConflictError {
    pub winner: ResourceKey,
    pub loser: ResourceKey,
    pub target: String,
    pub reason: String,
}

fn origin_of<K: ResourceExt>(obj: &K, kind: ResourceKind) -> Result<Origin, ValidationError> {
    let name = obj.name_any();
    let key = ResourceKey::new(kind, obj.namespace().unwrap_or_default(), name);
    if key.namespace.is_empty() {
        return Err(ValidationError::new(
            &key,
            "metadata.namespace",
            "namespace is required",
        ));
    }
    Ok(Origin {
        key,
        generation: obj.meta().generation,
        created: obj.meta().creation_timestamp.as_ref().map(|t| t.0),
    })
}

/// Validate hostname according to DNS-1123 subdomain rules.
///
/// Accepts a leading `*.` wildcard.
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("hostname cannot be empty".to_string());
    }
    if hostname.len() > MAX_HOST_LEN {
        return Err(format!("hostname '{hostname}' exceeds {MAX_HOST_LEN} characters"));
    }

    let to_check = hostname.strip_prefix("*.").unwrap_or(hostname);
    if to_check.is_empty() {
        return Err("hostname cannot be just '*.'".to_string());
    }

    for label in to_check.split('.') {
        if label.is_empty() {
            return Err(format!("hostname '{hostname}' contains an empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(format!(
                "hostname label '{label}' exceeds {MAX_LABEL_LEN} characters"
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!(
                "hostname label '{label}' cannot start or end with '-'"
            ));
        }
        if let Some(c) = label
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
        {
            return Err(format!(
                "hostname '{hostname}' contains invalid character '{c}' (must be lowercase alphanumeric or hyphen)"
            ));
        }
    }

    Ok(())
}

/// Parse a selector host: `*`, `*.suffix` or an exact host.
pub fn parse_host_pattern(host: &str) -> Result<HostPattern, String> {
    if host == "*" {
        return Ok(HostPattern::Any);
    }
    validate_hostname(host)?;
    Ok(match host.strip_prefix("*.") {
        Some(suffix) => HostPattern::Wildcard(suffix.to_string()),
        None => HostPattern::Exact(host.to_string()),
    })
}

fn validate_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("path '{path}' must start with '/'"));
    }
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("path '{path}' contains whitespace"));
    }
    Ok(())
}

/// HTTP token characters (RFC 9110), used for header and parameter names.
fn validate_token(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c));
    if ok {
        Ok(())
    } else {
        Err(format!("'{value}' is not a valid token"))
    }
}

fn single_line(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err("value cannot be empty".to_string());
    }
    if value.chars().any(|c| c.is_whitespace()) {
        return Err(format!("'{value}' cannot contain whitespace"));
    }
    Ok(())
}

fn validate_backend(
    key: &ResourceKey,
    field: &str,
    backend: &IngressBackend,
) -> Result<Backend, ValidationError> {
    let Some(service) = backend.service.as_ref() else {
        return Err(ValidationError::new(
            key,
            field,
            "only service backends are supported",
        ));
    };
    let Some(number) = service.port.as_ref().and_then(|p| p.number) else {
        return Err(ValidationError::new(
            key,
            format!("{field}.service.port"),
            "a numeric service port is required",
        ));
    };
    let port = u16::try_from(number)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| {
            ValidationError::new(
                key,
                format!("{field}.service.port.number"),
                format!("port {number} is out of range"),
            )
        })?;
    Ok(Backend {
        service: service.name.clone(),
        namespace: key.namespace.clone(),
        port,
    })
}

/// Validate an Ingress into its routes.
pub fn validate_ingress(ingress: &Ingress) -> Result<IngressRoutes, ValidationError> {
    let origin = origin_of(ingress, ResourceKind::Ingress)?;
    let key = &origin.key;
    let annotations = ingress.annotations();
    let spec = ingress.spec.clone().unwrap_or_default();

    let mut tls = Vec::new();
    let mut tls_hosts = BTreeSet::new();
    for (i, block) in spec.tls.iter().flatten().enumerate() {
        let hosts = block.hosts.clone().unwrap_or_default();
        for host in &hosts {
            validate_hostname(host)
                .map_err(|m| ValidationError::new(key, format!("spec.tls[{i}].hosts"), m))?;
            tls_hosts.insert(host.clone());
        }
        if let Some(secret_name) = block.secret_name.clone() {
            tls.push(TlsBinding { hosts, secret_name });
        }
    }

    let mut rules = Vec::new();
    let mut seen = BTreeSet::new();
    for (i, rule) in spec.rules.iter().flatten().enumerate() {
        let host = match rule.host.as_deref() {
            None | Some("") => "*".to_string(),
            Some(h) => {
                validate_hostname(h)
                    .map_err(|m| ValidationError::new(key, format!("spec.rules[{i}].host"), m))?;
                h.to_string()
            }
        };
        let scheme = if tls_hosts.contains(&host) {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        for (j, p) in http.paths.iter().enumerate() {
            let field = format!("spec.rules[{i}].http.paths[{j}]");
            let path = p.path.clone().unwrap_or_else(|| "/".to_string());
            validate_path(&path)
                .map_err(|m| ValidationError::new(key, format!("{field}.path"), m))?;
            let path_type = match p.path_type.as_str() {
                "Exact" => PathType::Exact,
                "Prefix" | "ImplementationSpecific" => PathType::Prefix,
                other => {
                    return Err(ValidationError::new(
                        key,
                        format!("{field}.pathType"),
                        format!("unknown path type '{other}'"),
                    ));
                }
            };
            if !seen.insert((host.clone(), path.clone(), path_type)) {
                return Err(ValidationError::new(
                    key,
                    field,
                    format!("duplicate {path_type} path '{path}' for host '{host}'"),
                ));
            }
            let backend = validate_backend(key, &format!("{field}.backend"), &p.backend)?;
            rules.push(IngressRule {
                host: host.clone(),
                path,
                path_type,
                backend,
                scheme,
            });
        }
    }

    let default_backend = spec
        .default_backend
        .as_ref()
        .map(|b| validate_backend(key, "spec.defaultBackend", b))
        .transpose()?;

    let snippet = annotations
        .get(SNIPPET_ANNOTATION)
        .filter(|s| !s.trim().is_empty())
        .cloned();

    let redirect = annotations
        .get(REDIRECT_ANNOTATION)
        .map(|r| {
            single_line(r)
                .map(|()| r.clone())
                .map_err(|m| ValidationError::new(key, format!("metadata.annotations[{REDIRECT_ANNOTATION}]"), m))
        })
        .transpose()?;

    let rewrite_target = annotations
        .get(REWRITE_ANNOTATION)
        .map(|r| {
            validate_path(r)
                .map(|()| r.clone())
                .map_err(|m| ValidationError::new(key, format!("metadata.annotations[{REWRITE_ANNOTATION}]"), m))
        })
        .transpose()?;

    Ok(IngressRoutes {
        origin,
        rules,
        default_backend,
        tls,
        snippet,
        redirect,
        rewrite_target,
    })
}

fn sorted_tokens(
    key: &ResourceKey,
    field: &str,
    values: &[String],
) -> Result<Vec<String>, ValidationError> {
    let mut out = BTreeSet::new();
    for (i, v) in values.iter().enumerate() {
        validate_token(v).map_err(|m| ValidationError::new(key, format!("{field}[{i}]"), m))?;
        out.insert(v.clone());
    }
    Ok(out.into_iter().collect())
}

/// Validate a CachingPolicy.
pub fn validate_caching_policy(policy: &CachingPolicy) -> Result<CachePolicy, ValidationError> {
    let origin = origin_of(policy, ResourceKind::CachingPolicy)?;
    let key = &origin.key;
    let spec = &policy.spec;

    let host = parse_host_pattern(&spec.selector.host)
        .map_err(|m| ValidationError::new(key, "spec.selector.host", m))?;

    let raw_path = spec.selector.path.as_str();
    let path_prefix = raw_path.strip_suffix('*').unwrap_or(raw_path);
    if path_prefix.contains('*') {
        return Err(ValidationError::new(
            key,
            "spec.selector.path",
            "'*' is only allowed at the end of the path",
        ));
    }
    validate_path(path_prefix).map_err(|m| ValidationError::new(key, "spec.selector.path", m))?;

    let ttl_secs = u64::try_from(spec.ttl).map_err(|_| {
        ValidationError::new(
            key,
            "spec.ttl",
            format!("ttl must be non-negative, got {}", spec.ttl),
        )
    })?;

    let vary_headers = sorted_tokens(key, "spec.cacheKey.headers", &spec.cache_key.headers)?;
    let vary_query_params =
        sorted_tokens(key, "spec.cacheKey.queryParams", &spec.cache_key.query_params)?;

    Ok(CachePolicy {
        origin,
        host,
        path_prefix: path_prefix.to_string(),
        ttl_secs,
        vary_headers,
        vary_query_params,
    })
}

/// Validate an SNIPolicy.
pub fn validate_sni_policy(policy: &SNIPolicy) -> Result<SniPolicySet, ValidationError> {
    let origin = origin_of(policy, ResourceKind::SniPolicy)?;
    let key = &origin.key;

    let mut entries = Vec::with_capacity(policy.spec.sni.len());
    let mut seen = BTreeSet::new();
    for (i, entry) in policy.spec.sni.iter().enumerate() {
        let field = format!("spec.sni[{i}]");
        if entry.fqdn == "*" {
            return Err(ValidationError::new(
                key,
                format!("{field}.fqdn"),
                "fqdn '*' is reserved for the controller default",
            ));
        }
        let fqdn = parse_host_pattern(&entry.fqdn)
            .map_err(|m| ValidationError::new(key, format!("{field}.fqdn"), m))?;
        if !seen.insert(fqdn.clone()) {
            return Err(ValidationError::new(
                key,
                format!("{field}.fqdn"),
                format!("fqdn '{fqdn}' is listed more than once"),
            ));
        }
        let host_sni_policy = entry
            .host_sni_policy
            .parse()
            .map_err(|m| ValidationError::new(key, format!("{field}.hostSniPolicy"), m))?;
        let verify_server_policy = entry
            .verify_server_policy
            .parse()
            .map_err(|m| ValidationError::new(key, format!("{field}.verifyServerPolicy"), m))?;
        let verify_client = entry
            .verify_client
            .parse()
            .map_err(|m| ValidationError::new(key, format!("{field}.verifyClient"), m))?;
        entries.push(SniRule {
            fqdn,
            host_sni_policy,
            verify_server_policy,
            verify_client,
            http2: entry.http2,
        });
    }

    Ok(SniPolicySet { origin, entries })
}

/// Validate a `kubernetes.io/tls` Secret.
pub fn validate_tls_secret(secret: &Secret) -> Result<TlsBundle, ValidationError> {
    let origin = origin_of(secret, ResourceKind::Secret)?;
    let key = &origin.key;

    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return Err(ValidationError::new(
            key,
            "type",
            format!("expected secret type {TLS_SECRET_TYPE}"),
        ));
    }

    let data = secret.data.as_ref();
    let cert = secret_field(data, key, "tls.crt")?;
    let private_key = secret_field(data, key, "tls.key")?;

    let certs = rustls_pemfile::certs(&mut &cert[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ValidationError::new(key, "data.tls.crt", format!("invalid PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ValidationError::new(
            key,
            "data.tls.crt",
            "no certificates found",
        ));
    }
    match rustls_pemfile::private_key(&mut &private_key[..]) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(ValidationError::new(
                key,
                "data.tls.key",
                "no private key found",
            ));
        }
        Err(e) => {
            return Err(ValidationError::new(
                key,
                "data.tls.key",
                format!("invalid PEM: {e}"),
            ));
        }
    }

    let utf8 = |bytes: &[u8], name: &str| {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ValidationError::new(key, format!("data.{name}"), "PEM is not UTF-8"))
    };

    Ok(TlsBundle {
        cert_pem: utf8(cert, "tls.crt")?,
        key_pem: utf8(private_key, "tls.key")?,
        origin,
    })
}

fn secret_field<'a>(
    data: Option<&'a BTreeMap<String, ByteString>>,
    key: &ResourceKey,
    name: &str,
) -> Result<&'a [u8], ValidationError> {
    data.and_then(|d| d.get(name))
        .map(|b| b.0.as_slice())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ValidationError::new(key, format!("data.{name}"), "missing or empty"))
}

/// Validate the records ConfigMap.
///
/// Every entry stands on its own: a bad key or value is left out and
/// listed in [`RecordOverrides::ignored`], the rest are still applied.
pub fn validate_records(config_map: &ConfigMap) -> Result<RecordOverrides, ValidationError> {
    let origin = origin_of(config_map, ResourceKind::ConfigMap)?;
    let key = &origin.key;

    let mut records = BTreeMap::new();
    let mut ignored = Vec::new();
    for (name, value) in config_map.data.iter().flatten() {
        if !name.starts_with(RECORD_PREFIX) {
            ignored.push(ValidationError::new(
                key,
                format!("data.{name}"),
                format!("record names must start with '{RECORD_PREFIX}'"),
            ));
            continue;
        }
        let value = value.trim();
        if value.is_empty() || value.contains('\n') {
            ignored.push(ValidationError::new(
                key,
                format!("data.{name}"),
                "record values must be a single non-empty line",
            ));
            continue;
        }
        records.insert(name.clone(), value.to_string());
    }

    Ok(RecordOverrides {
        origin,
        records,
        ignored,
    })
}

/// Find every pair of valid objects that compete for the same target.
///
/// Reported conflicts are resolved the same way the compiler resolves them,
/// so the loser named here is the object whose setting is not live.
pub fn detect_conflicts(set: &ActiveResourceSet) -> Vec<ConflictError> {
    let mut conflicts = Vec::new();

    // Identical caching selectors.
    let mut by_selector: BTreeMap<(HostPattern, &str), Vec<&CachePolicy>> = BTreeMap::new();
    for policy in set.caching.values() {
        by_selector
            .entry((policy.host.clone(), policy.path_prefix.as_str()))
            .or_default()
            .push(policy);
    }
    for ((host, path), mut group) in by_selector {
        group.sort_by(|a, b| b.origin.precedence_cmp(&a.origin));
        let Some((winner, losers)) = group.split_first() else {
            continue;
        };
        for loser in losers.iter().filter(|l| !l.same_effect(winner)) {
            conflicts.push(ConflictError {
                winner: winner.origin.key.clone(),
                loser: loser.origin.key.clone(),
                target: format!("host={host} path={path}"),
                reason: format!(
                    "identical selector with different cache settings (ttl {}s overridden by {}s)",
                    loser.ttl_secs, winner.ttl_secs
                ),
            });
        }
    }

    // Duplicate Ingress routes across objects. The default backend claims `*/`.
    let mut by_route: BTreeMap<(&str, &str, PathType), BTreeMap<&ResourceKey, &IngressRoutes>> =
        BTreeMap::new();
    for routes in set.ingresses.values() {
        let default_slot = routes
            .default_backend
            .as_ref()
            .map(|_| ("*", "/", PathType::Prefix));
        let slots = routes
            .rules
            .iter()
            .map(|rule| (rule.host.as_str(), rule.path.as_str(), rule.path_type))
            .chain(default_slot);
        for slot in slots {
            by_route
                .entry(slot)
                .or_default()
                .insert(&routes.origin.key, routes);
        }
    }
    for ((host, path, path_type), owners) in by_route {
        let mut group: Vec<&IngressRoutes> = owners.into_values().collect();
        group.sort_by(|a, b| b.origin.precedence_cmp(&a.origin));
        let Some((winner, losers)) = group.split_first() else {
            continue;
        };
        for loser in losers {
            conflicts.push(ConflictError {
                winner: winner.origin.key.clone(),
                loser: loser.origin.key.clone(),
                target: format!("host={host} path={path} pathType={path_type}"),
                reason: "route is defined by a newer Ingress".to_string(),
            });
        }
    }

    // Duplicate SNI fqdns across policies.
    let mut by_fqdn: BTreeMap<&HostPattern, Vec<&SniPolicySet>> = BTreeMap::new();
    for policy in set.sni.values() {
        for entry in &policy.entries {
            by_fqdn.entry(&entry.fqdn).or_default().push(policy);
        }
    }
    for (fqdn, mut group) in by_fqdn {
        group.sort_by(|a, b| b.origin.precedence_cmp(&a.origin));
        let Some((winner, losers)) = group.split_first() else {
            continue;
        };
        for loser in losers {
            conflicts.push(ConflictError {
                winner: winner.origin.key.clone(),
                loser: loser.origin.key.clone(),
                target: format!("fqdn={fqdn}"),
                reason: "fqdn is defined by a newer SNIPolicy".to_string(),
            });
        }
    }

    conflicts
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::crd::{CacheKeySpec, CacheSelector, CachingPolicySpec, SNIPolicySpec, SniEntrySpec};
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressRule as K8sIngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            generation: Some(1),
            ..Default::default()
        }
    }

    fn service_backend(name: &str, port: ServiceBackendPort) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.to_string(),
                port: Some(port),
            }),
            resource: None,
        }
    }

    fn numbered(port: i32) -> ServiceBackendPort {
        ServiceBackendPort {
            number: Some(port),
            name: None,
        }
    }

    fn ingress(host: Option<&str>, path: &str, port: ServiceBackendPort) -> Ingress {
        Ingress {
            metadata: meta("web"),
            spec: Some(IngressSpec {
                rules: Some(vec![K8sIngressRule {
                    host: host.map(str::to_string),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(path.to_string()),
                            path_type: "Prefix".to_string(),
                            backend: service_backend("app", port),
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_hostname_rules() {
        assert!(validate_hostname("test.media.com").is_ok());
        assert!(validate_hostname("*.media.com").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("*.").is_err());
        assert!(validate_hostname("Test.media.com").is_err());
        assert!(validate_hostname("-bad.media.com").is_err());
        assert!(validate_hostname("a..b").is_err());
        assert!(validate_hostname(&"a".repeat(254)).is_err());
        assert!(validate_hostname(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_ingress_basic_rule() {
        let routes = validate_ingress(&ingress(Some("test.media.com"), "/test", numbered(8080))).unwrap();
        assert_eq!(routes.rules.len(), 1);
        let rule = &routes.rules[0];
        assert_eq!(rule.host, "test.media.com");
        assert_eq!(rule.path, "/test");
        assert_eq!(rule.path_type, PathType::Prefix);
        assert_eq!(rule.scheme, Scheme::Http);
        assert_eq!(rule.backend.port, 8080);
        assert_eq!(rule.backend.namespace, "default");
    }

    #[test]
    fn test_ingress_empty_host_becomes_star() {
        let routes = validate_ingress(&ingress(None, "/", numbered(80))).unwrap();
        assert_eq!(routes.rules[0].host, "*");
    }

    #[test]
    fn test_ingress_tls_host_is_https() {
        let mut ing = ingress(Some("secure.media.com"), "/", numbered(443));
        ing.spec.as_mut().unwrap().tls = Some(vec![IngressTLS {
            hosts: Some(vec!["secure.media.com".to_string()]),
            secret_name: Some("secure-cert".to_string()),
        }]);
        let routes = validate_ingress(&ing).unwrap();
        assert_eq!(routes.rules[0].scheme, Scheme::Https);
        assert_eq!(routes.tls[0].secret_name, "secure-cert");
    }

    #[test]
    fn test_ingress_named_port_rejected() {
        let port = ServiceBackendPort {
            name: Some("http".to_string()),
            number: None,
        };
        let err = validate_ingress(&ingress(Some("a.com"), "/", port)).unwrap_err();
        assert!(err.field.ends_with("service.port"));
    }

    #[test]
    fn test_ingress_bad_path_rejected() {
        let err = validate_ingress(&ingress(Some("a.com"), "test", numbered(80))).unwrap_err();
        assert!(err.message.contains("must start with '/'"));
    }

    #[test]
    fn test_ingress_annotations() {
        let mut ing = ingress(Some("a.com"), "/", numbered(80));
        ing.metadata.annotations = Some(BTreeMap::from([
            (SNIPPET_ANNOTATION.to_string(), "ts.debug('hi')".to_string()),
            (REDIRECT_ANNOTATION.to_string(), "https://b.com/".to_string()),
        ]));
        let routes = validate_ingress(&ing).unwrap();
        assert_eq!(routes.snippet.as_deref(), Some("ts.debug('hi')"));
        assert_eq!(routes.redirect.as_deref(), Some("https://b.com/"));

        ing.metadata.annotations = Some(BTreeMap::from([(
            REDIRECT_ANNOTATION.to_string(),
            "https://b.com/ x".to_string(),
        )]));
        assert!(validate_ingress(&ing).is_err());
    }

    fn caching(name: &str, host: &str, path: &str, ttl: i64) -> CachingPolicy {
        let mut policy = CachingPolicy::new(
            name,
            CachingPolicySpec {
                selector: CacheSelector {
                    host: host.to_string(),
                    path: path.to_string(),
                },
                ttl,
                cache_key: CacheKeySpec {
                    headers: vec!["b".to_string(), "a".to_string(), "a".to_string()],
                    query_params: vec![],
                },
            },
        );
        policy.metadata = meta(name);
        policy
    }

    #[test]
    fn test_caching_policy_normalizes() {
        let policy = validate_caching_policy(&caching("p", "*.media.com", "/img/*", 30)).unwrap();
        assert_eq!(policy.host, HostPattern::Wildcard("media.com".to_string()));
        assert_eq!(policy.path_prefix, "/img/");
        assert_eq!(policy.ttl_secs, 30);
        assert_eq!(policy.vary_headers, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_caching_policy_rejects_negative_ttl() {
        let err = validate_caching_policy(&caching("p", "*", "/", -1)).unwrap_err();
        assert_eq!(err.field, "spec.ttl");
    }

    #[test]
    fn test_caching_policy_rejects_inner_glob() {
        let err = validate_caching_policy(&caching("p", "*", "/a/*/b", 1)).unwrap_err();
        assert_eq!(err.field, "spec.selector.path");
    }

    fn sni(entries: Vec<SniEntrySpec>) -> SNIPolicy {
        let mut policy = SNIPolicy::new("sni", SNIPolicySpec { sni: entries });
        policy.metadata = meta("sni");
        policy
    }

    fn entry(fqdn: &str, host_policy: &str, verify_client: &str) -> SniEntrySpec {
        SniEntrySpec {
            fqdn: fqdn.to_string(),
            host_sni_policy: host_policy.to_string(),
            verify_server_policy: "DISABLED".to_string(),
            verify_client: verify_client.to_string(),
            http2: true,
        }
    }

    #[test]
    fn test_sni_policy_enumerations() {
        let ok = validate_sni_policy(&sni(vec![entry("a.com", "PERMISSIVE", "STRICT")])).unwrap();
        assert_eq!(ok.entries[0].verify_client, crate::policy::VerifyClient::Strict);

        let err = validate_sni_policy(&sni(vec![entry("a.com", "LOOSE", "NONE")])).unwrap_err();
        assert_eq!(err.field, "spec.sni[0].hostSniPolicy");

        let err = validate_sni_policy(&sni(vec![entry("a.com", "ENFORCED", "ALWAYS")])).unwrap_err();
        assert_eq!(err.field, "spec.sni[0].verifyClient");
    }

    #[test]
    fn test_sni_policy_rejects_duplicates_and_star() {
        let err = validate_sni_policy(&sni(vec![
            entry("a.com", "ENFORCED", "NONE"),
            entry("a.com", "DISABLED", "NONE"),
        ]))
        .unwrap_err();
        assert!(err.message.contains("more than once"));

        assert!(validate_sni_policy(&sni(vec![entry("*", "ENFORCED", "NONE")])).is_err());
    }

    #[test]
    fn test_tls_secret_type_and_data() {
        let secret = Secret {
            metadata: meta("cert"),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        assert_eq!(validate_tls_secret(&secret).unwrap_err().field, "type");

        let secret = Secret {
            metadata: meta("cert"),
            type_: Some(TLS_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                "tls.crt".to_string(),
                ByteString(b"not pem".to_vec()),
            )])),
            ..Default::default()
        };
        let err = validate_tls_secret(&secret).unwrap_err();
        assert!(err.field.starts_with("data.tls."));
    }

    #[test]
    fn test_records_prefix() {
        let cm = ConfigMap {
            metadata: meta("ats"),
            data: Some(BTreeMap::from([(
                "proxy.config.http.cache.http".to_string(),
                "1".to_string(),
            )])),
            ..Default::default()
        };
        let records = validate_records(&cm).unwrap();
        assert_eq!(records.records["proxy.config.http.cache.http"], "1");

    }

    #[test]
    fn test_bad_record_does_not_block_others() {
        let cm = ConfigMap {
            metadata: meta("ats"),
            data: Some(BTreeMap::from([
                ("log.level".to_string(), "1".to_string()),
                ("proxy.config.http.cache.http".to_string(), "1".to_string()),
                ("proxy.config.diags.debug.enabled".to_string(), " ".to_string()),
            ])),
            ..Default::default()
        };
        let records = validate_records(&cm).unwrap();
        assert_eq!(records.records.len(), 1);
        assert_eq!(records.records["proxy.config.http.cache.http"], "1");

        let fields: Vec<&str> = records.ignored.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["data.log.level", "data.proxy.config.diags.debug.enabled"]);
    }
}
