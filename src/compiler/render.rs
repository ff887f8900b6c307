//! Rendering of a [`CompiledConfig`] into Traffic Server configuration files.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;

use super::{
    CompileError, CompileOptions, CompiledConfig, DEFAULT_SNI_POLICY, HostClass, RouteEntry,
    RouteTarget,
};
use crate::policy::SniRule;

pub const REMAP_CONFIG: &str = "remap.config";
pub const SNI_YAML: &str = "sni.yaml";
pub const CACHE_CONFIG: &str = "cache.config";
pub const SSL_MULTICERT_CONFIG: &str = "ssl_multicert.config";
pub const CERTS_DIR: &str = "certs";
pub const SNIPPETS_DIR: &str = "snippets";

const HEADER: &str = "# Generated by ats-ingress. Do not edit.\n";

/// Render every managed file, keyed by path relative to the config directory.
pub fn render(
    config: &CompiledConfig,
    options: &CompileOptions,
) -> Result<BTreeMap<String, String>, CompileError> {
    let mut files = BTreeMap::new();
    files.insert(REMAP_CONFIG.to_string(), render_remap(config));
    files.insert(SNI_YAML.to_string(), render_sni(config)?);
    files.insert(CACHE_CONFIG.to_string(), render_cache(config));
    files.insert(
        SSL_MULTICERT_CONFIG.to_string(),
        render_ssl_multicert(config, options),
    );
    for (stem, binding) in &config.certificates {
        files.insert(format!("{CERTS_DIR}/{stem}.crt"), binding.cert_pem.clone());
        files.insert(format!("{CERTS_DIR}/{stem}.key"), binding.key_pem.clone());
    }
    for (stem, source) in &config.snippets {
        files.insert(format!("{SNIPPETS_DIR}/{stem}.lua"), source.clone());
    }
    Ok(files)
}

/// Request side of a remap rule for a host, scheme and path.
fn remap_source(host: &str, entry: &RouteEntry) -> (&'static str, String) {
    match HostClass::of(host) {
        HostClass::Exact => ("map", format!("{}://{host}{}", entry.scheme, entry.path)),
        HostClass::Wildcard => {
            let suffix = host.trim_start_matches("*.");
            (
                "regex_map",
                format!(
                    "{}://^.+\\.{}${}",
                    entry.scheme,
                    regex::escape(suffix),
                    entry.path
                ),
            )
        }
        HostClass::Any => ("map", entry.path.clone()),
    }
}

fn render_remap(config: &CompiledConfig) -> String {
    let mut out = String::from(HEADER);
    for (host, host_config) in config.hosts_in_order() {
        for entry in &host_config.routes {
            let (directive, source) = remap_source(host, entry);
            let directive = match entry.target {
                RouteTarget::Redirect(_) => "redirect",
                RouteTarget::Backend(_) => directive,
            };
            let mut line = format!("{directive} {source} {}", entry.upstream);
            if let Some(cache) = &entry.cache {
                if !cache.vary_headers.is_empty() || !cache.vary_query_params.is_empty() {
                    line.push_str(" @plugin=cachekey.so");
                }
                if !cache.vary_headers.is_empty() {
                    let _ = write!(
                        line,
                        " @pparam=--include-headers={}",
                        cache.vary_headers.join(",")
                    );
                }
                if !cache.vary_query_params.is_empty() {
                    let _ = write!(
                        line,
                        " @pparam=--include-params={}",
                        cache.vary_query_params.join(",")
                    );
                }
            }
            if let Some(stem) = &entry.snippet {
                let _ = write!(
                    line,
                    " @plugin=tslua.so @pparam={SNIPPETS_DIR}/{stem}.lua"
                );
            }
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

#[derive(Serialize)]
struct SniFile {
    sni: Vec<SniYamlEntry>,
}

/// One `sni.yaml` entry. Field order is the output key order.
#[derive(Serialize)]
struct SniYamlEntry {
    fqdn: String,
    host_sni_policy: &'static str,
    http2: &'static str,
    verify_client: &'static str,
    verify_server_policy: &'static str,
}

impl From<&SniRule> for SniYamlEntry {
    fn from(rule: &SniRule) -> Self {
        Self {
            fqdn: rule.fqdn.to_string(),
            host_sni_policy: rule.host_sni_policy.as_str(),
            http2: if rule.http2 { "on" } else { "off" },
            verify_client: rule.verify_client.as_str(),
            verify_server_policy: rule.verify_server_policy.as_str(),
        }
    }
}

fn render_sni(config: &CompiledConfig) -> Result<String, CompileError> {
    let mut entries: Vec<SniYamlEntry> = config
        .sni_entries
        .iter()
        .map(|(rule, _)| SniYamlEntry::from(rule))
        .collect();
    entries.push(SniYamlEntry::from(&DEFAULT_SNI_POLICY.rule()));

    let body = serde_yaml::to_string(&SniFile { sni: entries }).map_err(|source| {
        CompileError::Render {
            file: SNI_YAML,
            source,
        }
    })?;
    Ok(format!("{HEADER}{body}"))
}

fn render_cache(config: &CompiledConfig) -> String {
    let mut out = String::from(HEADER);
    let mut seen = BTreeSet::new();
    for (host, host_config) in config.hosts_in_order() {
        for entry in &host_config.routes {
            let Some(cache) = &entry.cache else {
                continue;
            };
            let mut line = match HostClass::of(host) {
                HostClass::Exact => format!("dest_host={host}"),
                HostClass::Wildcard => format!("dest_domain={}", host.trim_start_matches("*.")),
                HostClass::Any => "url_regex=.*".to_string(),
            };
            let prefix = entry.path.trim_start_matches('/');
            if !prefix.is_empty() {
                let _ = write!(line, " prefix={prefix}");
            }
            if HostClass::of(host) != HostClass::Any {
                let _ = write!(line, " scheme={}", entry.scheme);
            }
            if cache.ttl_secs == 0 {
                line.push_str(" action=never-cache");
            } else {
                let _ = write!(line, " ttl-in-cache={}s", cache.ttl_secs);
            }
            if seen.insert(line.clone()) {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }
    out
}

fn render_ssl_multicert(config: &CompiledConfig, options: &CompileOptions) -> String {
    let mut out = String::from(HEADER);
    let dir = options.config_dir.trim_end_matches('/');
    for stem in config.certificates.keys() {
        let _ = writeln!(
            out,
            "ssl_cert_name={dir}/{CERTS_DIR}/{stem}.crt ssl_key_name={dir}/{CERTS_DIR}/{stem}.key"
        );
    }
    out
}
