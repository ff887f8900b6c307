//! Deterministic precedence between competing routes and caching policies.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::{HostClass, ResolvedCache, RouteTarget};
use crate::policy::{ActiveResourceSet, CachePolicy, Origin, PathType, Scheme};

/// A route before it is placed in a host.
#[derive(Debug, Clone)]
pub(crate) struct RouteCandidate<'a> {
    pub host: &'a str,
    pub path: &'a str,
    pub path_type: PathType,
    pub scheme: Scheme,
    pub target: RouteTarget,
    pub origin: &'a Origin,
    pub snippet: Option<String>,
    pub rewrite: Option<&'a str>,
    /// Synthesised from `spec.defaultBackend`.
    pub is_default: bool,
}

impl RouteCandidate<'_> {
    /// `Greater` means `self` wins the (host, path, type) slot.
    fn precedence_cmp(&self, other: &RouteCandidate<'_>) -> Ordering {
        self.origin
            .precedence_cmp(other.origin)
            .then_with(|| other.is_default.cmp(&self.is_default))
    }
}

/// Ordering of paths within a host: longest literal first, exact before
/// prefix at equal length, then lexicographic for a total order.
pub fn path_order(
    (a_path, a_type): (&str, PathType),
    (b_path, b_type): (&str, PathType),
) -> Ordering {
    b_path
        .len()
        .cmp(&a_path.len())
        .then_with(|| a_type.cmp(&b_type))
        .then_with(|| a_path.cmp(b_path))
}

/// Ordering of hosts in rendered files: exact hosts, then wildcards from the
/// longest suffix, then the catch-all.
pub fn host_order(a: &str, b: &str) -> Ordering {
    HostClass::of(a)
        .cmp(&HostClass::of(b))
        .then_with(|| b.len().cmp(&a.len()))
        .then_with(|| a.cmp(b))
}

/// Every route of every active Ingress.
pub(crate) fn route_candidates(set: &ActiveResourceSet) -> Vec<RouteCandidate<'_>> {
    let mut out = Vec::new();
    for routes in set.ingresses.values() {
        let snippet = routes
            .snippet
            .as_ref()
            .map(|_| super::snippet_stem(&routes.origin.key));
        let target = |backend: &crate::policy::Backend| match &routes.redirect {
            Some(location) => RouteTarget::Redirect(location.clone()),
            None => RouteTarget::Backend(backend.clone()),
        };
        for rule in &routes.rules {
            out.push(RouteCandidate {
                host: &rule.host,
                path: &rule.path,
                path_type: rule.path_type,
                scheme: rule.scheme,
                target: target(&rule.backend),
                origin: &routes.origin,
                snippet: snippet.clone(),
                rewrite: routes.rewrite_target.as_deref(),
                is_default: false,
            });
        }
        if let Some(backend) = &routes.default_backend {
            out.push(RouteCandidate {
                host: "*",
                path: "/",
                path_type: PathType::Prefix,
                scheme: Scheme::Http,
                target: target(backend),
                origin: &routes.origin,
                snippet: snippet.clone(),
                rewrite: None,
                is_default: true,
            });
        }
    }
    out
}

/// Keep one winner per (host, path, type), grouped by host.
///
/// Each host's routes come back in [`path_order`]. The scheme of the
/// winning rule is kept; a losing rule does not survive under another
/// scheme.
pub(crate) fn resolve_routes<'a>(
    candidates: Vec<RouteCandidate<'a>>,
) -> BTreeMap<&'a str, Vec<RouteCandidate<'a>>> {
    let mut winners: BTreeMap<(&'a str, &'a str, PathType), RouteCandidate<'a>> = BTreeMap::new();
    for candidate in candidates {
        let slot = (candidate.host, candidate.path, candidate.path_type);
        match winners.get(&slot) {
            Some(current) if candidate.precedence_cmp(current) != Ordering::Greater => {}
            _ => {
                winners.insert(slot, candidate);
            }
        }
    }

    let mut by_host: BTreeMap<&'a str, Vec<RouteCandidate<'a>>> = BTreeMap::new();
    for ((host, _, _), candidate) in winners {
        by_host.entry(host).or_default().push(candidate);
    }
    for routes in by_host.values_mut() {
        routes.sort_by(|a, b| path_order((a.path, a.path_type), (b.path, b.path_type)));
    }
    by_host
}

/// Most specific caching policy selecting a route, if any.
pub fn resolve_cache<'a, I>(policies: I, host: &str, path: &str) -> Option<ResolvedCache>
where
    I: IntoIterator<Item = &'a CachePolicy>,
{
    policies
        .into_iter()
        .filter(|p| p.selects(host, path))
        .max_by(|a, b| a.resolution_cmp(b))
        .map(|p| ResolvedCache {
            policy: p.origin.key.clone(),
            ttl_secs: p.ttl_secs,
            vary_headers: p.vary_headers.clone(),
            vary_query_params: p.vary_query_params.clone(),
        })
}
