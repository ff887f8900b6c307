//! SNI policy resolution and the handshake behaviour it configures.
//!
//! The evaluation helpers mirror what Traffic Server does with a rendered
//! `sni.yaml` entry. They produce the exact log lines the proxy emits, so
//! callers and tests can reason about a policy without a running proxy.

use std::collections::BTreeMap;
use std::fmt;

use super::HostClass;
use crate::policy::{ActiveResourceSet, HostPattern, Origin, PolicyMode, SniRule, VerifyClient};
use crate::watcher::ResourceKey;

/// Policy applied to any host without an SNIPolicy entry.
///
/// Host/SNI mismatches terminate the connection, origin certificates are
/// not verified, no client certificate is requested, HTTP/2 is offered.
/// Rendered as the `fqdn: '*'` entry at the end of `sni.yaml`.
pub const DEFAULT_SNI_POLICY: DefaultSniPolicy = DefaultSniPolicy {
    host_sni_policy: PolicyMode::Enforced,
    verify_server_policy: PolicyMode::Disabled,
    verify_client: VerifyClient::None,
    http2: true,
};

/// Field values of [`DEFAULT_SNI_POLICY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultSniPolicy {
    pub host_sni_policy: PolicyMode,
    pub verify_server_policy: PolicyMode,
    pub verify_client: VerifyClient,
    pub http2: bool,
}

impl DefaultSniPolicy {
    pub fn rule(&self) -> SniRule {
        SniRule {
            fqdn: HostPattern::Any,
            host_sni_policy: self.host_sni_policy,
            verify_server_policy: self.verify_server_policy,
            verify_client: self.verify_client,
            http2: self.http2,
        }
    }
}

/// SNI rule in effect for a host, and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSni {
    pub rule: SniRule,
    /// `None` when the default policy applies.
    pub source: Option<ResourceKey>,
}

/// What the proxy does when SNI and Host disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MismatchAction {
    /// Abort the connection before any HTTP response.
    Terminate,
    /// Serve the request in the SNI-selected host context.
    Continue,
    /// No comparison is made.
    NoCheck,
}

impl MismatchAction {
    pub fn for_mode(mode: PolicyMode) -> Self {
        match mode {
            PolicyMode::Enforced => MismatchAction::Terminate,
            PolicyMode::Permissive => MismatchAction::Continue,
            PolicyMode::Disabled => MismatchAction::NoCheck,
        }
    }
}

impl fmt::Display for MismatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchAction::Terminate => f.write_str("terminate"),
            MismatchAction::Continue => f.write_str("continue"),
            MismatchAction::NoCheck => f.write_str("none"),
        }
    }
}

/// Winning SNI entry per fqdn across all SNIPolicy objects.
///
/// The newest policy wins a duplicated fqdn. Entries are returned in
/// `sni.yaml` order: exact hosts, then wildcards from the longest suffix.
pub fn effective_entries(set: &ActiveResourceSet) -> Vec<(SniRule, ResourceKey)> {
    let mut winners: BTreeMap<&HostPattern, (&SniRule, &Origin)> = BTreeMap::new();
    for policy in set.sni.values() {
        for entry in &policy.entries {
            match winners.get(&entry.fqdn) {
                Some((_, current)) if !policy.origin.outranks(current) => {}
                _ => {
                    winners.insert(&entry.fqdn, (entry, &policy.origin));
                }
            }
        }
    }

    let mut entries: Vec<(SniRule, ResourceKey)> = winners
        .into_values()
        .map(|(rule, origin)| (rule.clone(), origin.key.clone()))
        .collect();
    entries.sort_by(|(a, _), (b, _)| {
        let class = |p: &HostPattern| match p {
            HostPattern::Exact(_) => 0u8,
            HostPattern::Wildcard(_) => 1,
            HostPattern::Any => 2,
        };
        class(&a.fqdn)
            .cmp(&class(&b.fqdn))
            .then_with(|| b.fqdn.literal_len().cmp(&a.fqdn.literal_len()))
            .then_with(|| a.fqdn.cmp(&b.fqdn))
    });
    entries
}

/// Resolve the SNI rule for a route host against ordered effective entries.
pub fn resolve_for_host(host: &str, entries: &[(SniRule, ResourceKey)]) -> ResolvedSni {
    let found = match HostClass::of(host) {
        HostClass::Any => None,
        _ => entries.iter().find(|(rule, _)| rule.fqdn.matches(host)),
    };
    match found {
        Some((rule, key)) => ResolvedSni {
            rule: rule.clone(),
            source: Some(key.clone()),
        },
        None => ResolvedSni {
            rule: DEFAULT_SNI_POLICY.rule(),
            source: None,
        },
    }
}

/// Outcome of comparing the TLS SNI with the HTTP Host header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniCheck {
    /// SNI and Host agree.
    Match,
    /// They disagree; `log_line` is what the proxy writes.
    Mismatch {
        action: MismatchAction,
        log_line: String,
    },
    /// The policy is DISABLED; nothing is compared or logged.
    Skipped,
}

/// Evaluate the host/SNI comparison for a request under `mode`.
pub fn evaluate_host_sni(mode: PolicyMode, sni: &str, host: &str) -> SniCheck {
    let action = MismatchAction::for_mode(mode);
    if action == MismatchAction::NoCheck {
        return SniCheck::Skipped;
    }
    let host_only = host.split(':').next().unwrap_or(host);
    if sni.eq_ignore_ascii_case(host_only) {
        return SniCheck::Match;
    }
    SniCheck::Mismatch {
        action,
        log_line: format!("SNI/hostname mismatch sni={sni} host={host_only} action={action}"),
    }
}

/// Outcome of verifying the origin server certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerVerification {
    /// Verification passed, or is disabled.
    Proceed,
    /// Verification failed; the connection continues with a log line.
    ProceedWithWarning(String),
    /// Verification failed; the connection is closed with a log line.
    Terminate(String),
}

/// Evaluate origin certificate verification under `mode`.
pub fn evaluate_server_verification(
    mode: PolicyMode,
    server: &str,
    certificate_valid: bool,
) -> ServerVerification {
    if certificate_valid || mode == PolicyMode::Disabled {
        return ServerVerification::Proceed;
    }
    let action = if mode == PolicyMode::Enforced {
        "Terminate"
    } else {
        "Continue"
    };
    let line = format!("Core server certificate verification failed for ({server}). Action={action}");
    match mode {
        PolicyMode::Enforced => ServerVerification::Terminate(line),
        _ => ServerVerification::ProceedWithWarning(line),
    }
}

/// TLS alert sent when a handshake is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsAlert {
    /// `certificate_required` (116).
    CertificateRequired,
    /// `bad_certificate` (42).
    BadCertificate,
}

impl TlsAlert {
    pub fn code(&self) -> u8 {
        match self {
            TlsAlert::CertificateRequired => 116,
            TlsAlert::BadCertificate => 42,
        }
    }
}

/// What a presented client certificate looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCertificate {
    Absent,
    Valid,
    Invalid,
}

/// Evaluate the client certificate requirement at handshake time.
///
/// STRICT refuses a handshake without a valid certificate. MODERATE
/// requests one and refuses only a certificate that fails verification.
pub fn evaluate_client_certificate(
    verify: VerifyClient,
    presented: ClientCertificate,
) -> Result<(), TlsAlert> {
    match (verify, presented) {
        (VerifyClient::None, _) => Ok(()),
        (_, ClientCertificate::Valid) => Ok(()),
        (VerifyClient::Strict, ClientCertificate::Absent) => Err(TlsAlert::CertificateRequired),
        (_, ClientCertificate::Invalid) => Err(TlsAlert::BadCertificate),
        (VerifyClient::Moderate, ClientCertificate::Absent) => Ok(()),
    }
}
