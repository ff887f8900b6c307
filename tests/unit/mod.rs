// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for ats-ingress.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use ats_ingress::crd::{
        CacheSelector, CachingPolicySpec, Condition, ConditionType, PolicyPhase, PolicyStatus,
        SNIPolicySpec,
    };

    #[test]
    fn test_phase_display() {
        assert_eq!(PolicyPhase::Pending.to_string(), "Pending");
        assert_eq!(PolicyPhase::Applied.to_string(), "Applied");
        assert_eq!(PolicyPhase::Degraded.to_string(), "Degraded");
        assert_eq!(PolicyPhase::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(PolicyPhase::default(), PolicyPhase::Pending);
    }

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "Applied", "generation 3 live on local", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "Applied");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_condition_failed() {
        let condition = Condition::failed(true, "ValidationFailed", "bad ttl", None);
        assert_eq!(condition.r#type, ConditionType::Failed.to_string());
        assert_eq!(condition.status, "True");
    }

    #[test]
    fn test_selector_defaults() {
        let selector = CacheSelector::default();
        assert_eq!(selector.host, "*");
        assert_eq!(selector.path, "/*");
    }

    #[test]
    fn test_caching_spec_from_yaml() {
        let spec: CachingPolicySpec = serde_yaml::from_str(
            "selector:\n  host: test.media.com\n  path: /test*\nttl: 30\ncacheKey:\n  headers: [Accept-Encoding]\n",
        )
        .unwrap();
        assert_eq!(spec.selector.host, "test.media.com");
        assert_eq!(spec.ttl, 30);
        assert_eq!(spec.cache_key.headers, vec!["Accept-Encoding".to_string()]);
        assert!(spec.cache_key.query_params.is_empty());
    }

    #[test]
    fn test_sni_spec_from_yaml() {
        let spec: SNIPolicySpec = serde_yaml::from_str(
            "sni:\n- fqdn: test.media.com\n  hostSniPolicy: PERMISSIVE\n  verifyClient: STRICT\n",
        )
        .unwrap();
        assert_eq!(spec.sni.len(), 1);
        assert_eq!(spec.sni[0].host_sni_policy, "PERMISSIVE");
        assert!(spec.sni[0].http2);
    }

    #[test]
    fn test_status_omits_empty_fields() {
        let json = serde_json::to_value(PolicyStatus::default()).unwrap();
        assert_eq!(json["phase"], "Pending");
        assert!(json.get("lastError").is_none());
        assert!(json.get("appliedGeneration").is_none());
    }
}

mod state_machine_tests {
    use ats_ingress::controller::state_machine::{TransitionContext, determine_failure_event};
    use ats_ingress::controller::{LoopEvent, ReconcilePhase, ReconcileStateMachine};

    #[test]
    fn test_valid_events_from_idle() {
        let sm = ReconcileStateMachine::new();
        assert_eq!(sm.valid_events(ReconcilePhase::Idle), vec![LoopEvent::InputChanged]);
        assert!(!sm.can_transition(ReconcilePhase::Idle, LoopEvent::ApplySucceeded));
    }

    #[test]
    fn test_valid_events_from_compiling() {
        let sm = ReconcileStateMachine::new();
        assert!(sm.can_transition(ReconcilePhase::Compiling, LoopEvent::SnapshotReady));
        assert!(sm.can_transition(ReconcilePhase::Compiling, LoopEvent::CompileFailed));
        assert!(sm.can_transition(ReconcilePhase::Compiling, LoopEvent::GenerationUnchanged));
        assert!(!sm.can_transition(ReconcilePhase::Compiling, LoopEvent::RetryScheduled));
    }

    #[test]
    fn test_valid_events_from_failed() {
        let sm = ReconcileStateMachine::new();
        for event in [
            LoopEvent::RetryScheduled,
            LoopEvent::Superseded,
            LoopEvent::GaveUp,
        ] {
            assert!(sm.can_transition(ReconcilePhase::Failed, event));
        }
        assert!(!sm.can_transition(ReconcilePhase::Failed, LoopEvent::ApplySucceeded));
    }

    #[test]
    fn test_halted_is_terminal() {
        let sm = ReconcileStateMachine::new();
        assert!(sm.valid_events(ReconcilePhase::Halted).is_empty());
        assert!(ReconcilePhase::Halted.is_terminal());
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let ctx = TransitionContext::new(1, 5).with_permanent(true);
        assert_eq!(determine_failure_event(&ctx), LoopEvent::GaveUp);
    }

    #[test]
    fn test_newer_input_wins_over_retry() {
        let ctx = TransitionContext::new(1, 5).with_input_changed(true);
        assert_eq!(determine_failure_event(&ctx), LoopEvent::Superseded);
    }

    #[test]
    fn test_exhausted_attempts_give_up() {
        assert_eq!(
            determine_failure_event(&TransitionContext::new(4, 5)),
            LoopEvent::RetryScheduled
        );
        assert_eq!(
            determine_failure_event(&TransitionContext::new(5, 5)),
            LoopEvent::GaveUp
        );
        assert_eq!(
            determine_failure_event(&TransitionContext::new(500, 0)),
            LoopEvent::RetryScheduled
        );
    }
}

mod error_tests {
    use ats_ingress::applier::ApplyError;
    use ats_ingress::controller::Error;

    #[test]
    fn test_error_is_retryable() {
        let kube_err = Error::Kube(kube::Error::Api(Box::new(kube::error::ErrorResponse {
            status: Some(kube::core::response::StatusSummary::Failure),
            message: "timeout".to_string(),
            reason: "Timeout".to_string(),
            code: 504,
            metadata: None,
            details: None,
        })));
        assert!(kube_err.is_retryable());

        let not_found = Error::Kube(kube::Error::Api(Box::new(kube::error::ErrorResponse {
            status: Some(kube::core::response::StatusSummary::Failure),
            message: "gone".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
            metadata: None,
            details: None,
        })));
        assert!(not_found.is_not_found());
        assert!(!not_found.is_retryable());

        let rejected: Error = ApplyError::RejectedConfig("bad line".to_string()).into();
        assert!(!rejected.is_retryable());
    }
}

mod status_tests {
    use ats_ingress::controller::StatusUpdate;
    use ats_ingress::controller::status::{
        ConditionBuilder, is_condition_true, next_policy_status, status_changed,
    };
    use ats_ingress::crd::{Condition, ConditionType, PolicyPhase, PolicyStatus};
    use ats_ingress::policy::{ConflictError, ResourceRef, ValidationError};
    use ats_ingress::watcher::{ResourceKey, ResourceKind};

    fn key() -> ResourceKey {
        ResourceKey::new(ResourceKind::CachingPolicy, "default", "media")
    }

    fn applied(generation: u64) -> StatusUpdate {
        StatusUpdate::Applied {
            target: "local".to_string(),
            generation,
            resources: vec![ResourceRef {
                key: key(),
                generation: Some(2),
            }],
        }
    }

    #[test]
    fn test_condition_builder() {
        let mut builder = ConditionBuilder::new();
        builder.ready(true, "Applied", "live", Some(1));
        builder.degraded(false, "NoConflict", "none", Some(1));
        let conditions = builder.build();

        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, ConditionType::Ready));
        assert!(!is_condition_true(&conditions, ConditionType::Degraded));
    }

    #[test]
    fn test_condition_builder_keeps_transition_time() {
        let mut original = Condition::ready(true, "Applied", "live", Some(1));
        original.last_transition_time = "2024-01-01T00:00:00Z".to_string();

        let mut builder = ConditionBuilder::from_existing(&[original]);
        builder.ready(true, "Applied", "generation 2 live", Some(2));
        let conditions = builder.build();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_is_condition_true_missing() {
        let conditions: Vec<Condition> = vec![];
        assert!(!is_condition_true(&conditions, ConditionType::Ready));
    }

    #[test]
    fn test_accepted_then_applied() {
        let accepted = next_policy_status(
            &PolicyStatus::default(),
            &StatusUpdate::Accepted {
                key: key(),
                generation: Some(2),
            },
            Some(2),
        );
        assert_eq!(accepted.phase, PolicyPhase::Pending);
        assert_eq!(accepted.observed_generation, Some(2));

        let live = next_policy_status(&accepted, &applied(7), Some(2));
        assert_eq!(live.phase, PolicyPhase::Applied);
        assert_eq!(live.applied_generation, Some(7));
        assert!(is_condition_true(&live.conditions, ConditionType::Ready));
        assert!(live.last_error.is_none());
    }

    #[test]
    fn test_invalid_sets_failed() {
        let error = ValidationError::new(&key(), "spec.ttl", "ttl must be non-negative, got -1");
        let status = next_policy_status(
            &PolicyStatus::default(),
            &StatusUpdate::Invalid {
                error,
                generation: Some(3),
            },
            Some(3),
        );
        assert_eq!(status.phase, PolicyPhase::Failed);
        assert!(is_condition_true(&status.conditions, ConditionType::Failed));
        assert_eq!(
            status.last_error.as_deref(),
            Some("CachingPolicy/default/media: invalid spec.ttl: ttl must be non-negative, got -1")
        );
    }

    #[test]
    fn test_conflict_degrades_until_resolved() {
        let live = next_policy_status(&PolicyStatus::default(), &applied(1), Some(1));
        let conflict = StatusUpdate::Conflict(ConflictError {
            winner: ResourceKey::new(ResourceKind::CachingPolicy, "default", "newer"),
            loser: key(),
            target: "cache */".to_string(),
            reason: "newer policy with identical selector".to_string(),
        });

        let degraded = next_policy_status(&live, &conflict, None);
        assert_eq!(degraded.phase, PolicyPhase::Degraded);
        assert!(is_condition_true(&degraded.conditions, ConditionType::Degraded));

        let resolved =
            next_policy_status(&degraded, &StatusUpdate::ConflictResolved { key: key() }, None);
        assert_eq!(resolved.phase, PolicyPhase::Applied);
        assert!(!is_condition_true(&resolved.conditions, ConditionType::Degraded));
    }

    #[test]
    fn test_repeated_update_is_not_a_change() {
        let first = next_policy_status(&PolicyStatus::default(), &applied(4), Some(2));
        let second = next_policy_status(&first, &applied(4), Some(2));
        assert!(!status_changed(&first, &second));
        assert!(status_changed(&PolicyStatus::default(), &first));
    }
}
