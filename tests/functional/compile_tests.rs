//! Compile scenarios: cluster objects in, Traffic Server files out.

use std::sync::Arc;

use ats_ingress::compiler::render::{CACHE_CONFIG, REMAP_CONFIG, SNI_YAML, SSL_MULTICERT_CONFIG};
use ats_ingress::compiler::{
    CompileOptions, CompiledSnapshot, Compiler, MismatchAction, SniCheck, evaluate_host_sni,
};
use ats_ingress::policy::validation::{REDIRECT_ANNOTATION, REWRITE_ANNOTATION, detect_conflicts};
use ats_ingress::policy::{Admission, WorkingSet};
use ats_ingress::watcher::{ResourceEvent, ResourceKind};

use crate::fixtures::*;

fn compile_events(events: &[ResourceEvent]) -> Arc<CompiledSnapshot> {
    let mut working = WorkingSet::new();
    for event in events {
        working.apply(event);
    }
    Compiler::new(CompileOptions::default())
        .compile(&working.snapshot())
        .unwrap()
}

fn media_ingress() -> IngressBuilder {
    IngressBuilder::new("media").rule("test.media.com", "/test", "app", 80)
}

#[test]
fn test_add_then_delete_ingress_route() {
    let mut working = WorkingSet::new();
    let compiler = Compiler::new(CompileOptions::default());

    working.apply(&added(media_ingress().build()));
    let first = compiler.compile(&working.snapshot()).unwrap();
    assert!(first.files[REMAP_CONFIG]
        .contains("map http://test.media.com/test http://app.default.svc.cluster.local:80/test"));

    working.apply(&deleted(ResourceKind::Ingress, "media"));
    let second = compiler.compile(&working.snapshot()).unwrap();
    assert!(!second.files[REMAP_CONFIG].contains("test.media.com"));
    assert!(second.config.hosts.is_empty());
    assert!(second.generation > first.generation);
}

#[test]
fn test_caching_ttl_rendered() {
    let snapshot = compile_events(&[
        added(media_ingress().build()),
        added(
            CachingPolicyBuilder::new("media-cache")
                .host("test.media.com")
                .path("/test*")
                .ttl(30)
                .build(),
        ),
    ]);
    assert!(snapshot.files[CACHE_CONFIG]
        .contains("dest_host=test.media.com prefix=test scheme=http ttl-in-cache=30s"));
}

#[test]
fn test_zero_ttl_is_never_cache() {
    let snapshot = compile_events(&[
        added(media_ingress().build()),
        added(CachingPolicyBuilder::new("no-cache").ttl(0).build()),
    ]);
    assert!(snapshot.files[CACHE_CONFIG].contains("action=never-cache"));
    assert!(!snapshot.files[CACHE_CONFIG].contains("ttl-in-cache"));
}

#[test]
fn test_more_specific_policy_wins_regardless_of_age() {
    let snapshot = compile_events(&[
        added(media_ingress().build()),
        added(CachingPolicyBuilder::new("broad").ttl(10).created(2_000_000_000).build()),
        added(
            CachingPolicyBuilder::new("narrow")
                .host("test.media.com")
                .path("/test*")
                .ttl(90)
                .created(1_000_000_000)
                .build(),
        ),
    ]);
    let route = &snapshot.config.hosts["test.media.com"].routes[0];
    let cache = route.cache.as_ref().unwrap();
    assert_eq!(cache.policy.name, "narrow");
    assert_eq!(cache.ttl_secs, 90);
}

#[test]
fn test_cache_key_plugin_parameters() {
    let snapshot = compile_events(&[
        added(media_ingress().build()),
        added(
            CachingPolicyBuilder::new("keyed")
                .headers(&["Accept-Encoding"])
                .query_params(&["v"])
                .build(),
        ),
    ]);
    assert!(snapshot.files[REMAP_CONFIG].contains(
        "@plugin=cachekey.so @pparam=--include-headers=Accept-Encoding @pparam=--include-params=v"
    ));
}

#[test]
fn test_tls_host_uses_https_and_binds_certificate() {
    let snapshot = compile_events(&[
        added(
            IngressBuilder::new("secure")
                .rule("secure.media.com", "/", "app", 80)
                .tls(&["secure.media.com"], "media-tls")
                .build(),
        ),
        added(tls_secret(NAMESPACE, "media-tls")),
    ]);

    assert!(snapshot.files[REMAP_CONFIG]
        .contains("map https://secure.media.com/ http://app.default.svc.cluster.local:80/"));
    assert!(snapshot.files[SSL_MULTICERT_CONFIG].contains(
        "ssl_cert_name=/opt/ats/etc/trafficserver/certs/default_media-tls.crt \
         ssl_key_name=/opt/ats/etc/trafficserver/certs/default_media-tls.key"
    ));
    assert_eq!(snapshot.files["certs/default_media-tls.crt"], CERT_PEM);
    assert_eq!(snapshot.files["certs/default_media-tls.key"], KEY_PEM);
    assert!(snapshot.config.warnings.is_empty());
}

#[test]
fn test_missing_secret_is_a_warning() {
    let snapshot = compile_events(&[added(
        IngressBuilder::new("secure")
            .rule("secure.media.com", "/", "app", 80)
            .tls(&["secure.media.com"], "absent")
            .build(),
    )]);

    assert!(snapshot.config.certificates.is_empty());
    assert_eq!(snapshot.config.warnings.len(), 1);
    assert_eq!(snapshot.config.warnings[0].reason, "SecretNotFound");
    assert_eq!(snapshot.config.warnings[0].key.name, "secure");
    // the host is still served
    assert!(snapshot.files[REMAP_CONFIG].contains("map https://secure.media.com/"));
}

#[test]
fn test_sni_policy_rendered_and_resolved() {
    let snapshot = compile_events(&[
        added(media_ingress().build()),
        added(
            SniPolicyBuilder::new("media-sni")
                .entry("test.media.com", "PERMISSIVE", "STRICT")
                .without_http2()
                .build(),
        ),
    ]);

    let parsed: serde_yaml::Value = serde_yaml::from_str(&snapshot.files[SNI_YAML]).unwrap();
    let entries = parsed["sni"].as_sequence().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["fqdn"].as_str(), Some("test.media.com"));
    assert_eq!(entries[0]["host_sni_policy"].as_str(), Some("PERMISSIVE"));
    assert_eq!(entries[0]["verify_client"].as_str(), Some("STRICT"));
    assert_eq!(entries[0]["http2"].as_str(), Some("off"));
    assert_eq!(entries[1]["fqdn"].as_str(), Some("*"));

    let host = &snapshot.config.hosts["test.media.com"];
    assert_eq!(host.mismatch_action, MismatchAction::Continue);
    match evaluate_host_sni(host.sni.rule.host_sni_policy, "test.media.com", "other.media.com") {
        SniCheck::Mismatch { log_line, .. } => assert_eq!(
            log_line,
            "SNI/hostname mismatch sni=test.media.com host=other.media.com action=continue"
        ),
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[test]
fn test_default_backend_is_catch_all() {
    let snapshot = compile_events(&[added(
        IngressBuilder::new("fallback")
            .default_backend("fallback", 8080)
            .build(),
    )]);
    assert!(snapshot.files[REMAP_CONFIG]
        .contains("map / http://fallback.default.svc.cluster.local:8080/"));
}

#[test]
fn test_wildcard_host_uses_regex_map() {
    let snapshot = compile_events(&[added(
        IngressBuilder::new("wild").rule("*.media.com", "/", "app", 80).build(),
    )]);
    assert!(snapshot.files[REMAP_CONFIG]
        .contains("regex_map http://^.+\\.media\\.com$/ http://app.default.svc.cluster.local:80/"));
}

#[test]
fn test_newest_ingress_wins_route() {
    let mut working = WorkingSet::new();
    working.apply(&added(
        IngressBuilder::new("old")
            .created(1_000)
            .rule("a.media.com", "/", "old-app", 80)
            .build(),
    ));
    working.apply(&added(
        IngressBuilder::new("new")
            .created(2_000)
            .rule("a.media.com", "/", "new-app", 80)
            .build(),
    ));
    let set = working.snapshot();
    let snapshot = Compiler::new(CompileOptions::default()).compile(&set).unwrap();

    assert!(snapshot.files[REMAP_CONFIG].contains("new-app.default.svc"));
    assert!(!snapshot.files[REMAP_CONFIG].contains("old-app.default.svc"));

    let conflicts = detect_conflicts(&set);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].winner.name, "new");
    assert_eq!(conflicts[0].loser.name, "old");
}

#[test]
fn test_redirect_and_rewrite_annotations() {
    let snapshot = compile_events(&[
        added(
            IngressBuilder::new("moved")
                .annotation(REDIRECT_ANNOTATION, "https://new.media.com/")
                .rule("old.media.com", "/", "app", 80)
                .build(),
        ),
        added(
            IngressBuilder::new("api")
                .annotation(REWRITE_ANNOTATION, "/v2")
                .rule("api.media.com", "/api", "api", 8080)
                .build(),
        ),
    ]);
    let remap = &snapshot.files[REMAP_CONFIG];
    assert!(remap.contains("redirect http://old.media.com/ https://new.media.com/"));
    assert!(remap.contains("map http://api.media.com/api http://api.default.svc.cluster.local:8080/v2"));
}

#[test]
fn test_invalid_update_removes_previous_version() {
    let mut working = WorkingSet::new();
    working.apply(&added(media_ingress().build()));
    assert_eq!(working.snapshot().ingresses.len(), 1);

    let broken = IngressBuilder::new("media")
        .rule("test.media.com", "no-slash", "app", 80)
        .build();
    match working.apply(&updated(broken)) {
        Admission::Rejected(error) => {
            assert!(error.field.ends_with(".path"), "field was {}", error.field);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(working.snapshot().ingresses.is_empty());
}

#[test]
fn test_records_flow_into_snapshot() {
    let snapshot = compile_events(&[added(records_configmap(
        NAMESPACE,
        "ats",
        &[("proxy.config.http.cache.http", "1")],
    ))]);
    assert_eq!(
        snapshot.config.records.get("proxy.config.http.cache.http").map(String::as_str),
        Some("1")
    );
}

#[test]
fn test_compile_independent_of_event_order() {
    let events = vec![
        added(media_ingress().build()),
        added(
            IngressBuilder::new("other")
                .created(1_800_000_000)
                .rule("test.media.com", "/test", "other", 80)
                .rule("*.media.com", "/", "wild", 80)
                .build(),
        ),
        added(CachingPolicyBuilder::new("a").ttl(10).build()),
        added(CachingPolicyBuilder::new("b").host("*.media.com").ttl(20).build()),
        added(
            SniPolicyBuilder::new("sni")
                .entry("test.media.com", "ENFORCED", "NONE")
                .build(),
        ),
    ];
    let forward = compile_events(&events);
    let mut reversed_events = events.clone();
    reversed_events.reverse();
    let reversed = compile_events(&reversed_events);

    assert_eq!(forward.files, reversed.files);
    assert_eq!(forward.digest, reversed.digest);
}
