//! Unit tests for per-pass action planning

use std::time::Duration;

use apphook_operator::controller::state_machine::{PlanInput, PlannedAction, plan_action};
use apphook_operator::crd::HookPhase;
use chrono::{DateTime, TimeZone, Utc};

const QUIESCED_AT: &str = "2026-03-01T12:00:00Z";

fn quiesced_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn input(operation: &str, phase: HookPhase) -> PlanInput<'_> {
    PlanInput {
        operation,
        phase,
        timeout: Duration::ZERO,
        quiesced_at: None,
        generation: Some(1),
        expired_generation: None,
        now: quiesced_at(),
    }
}

fn quiesced_with_timeout(seconds_after: i64) -> PlanInput<'static> {
    PlanInput {
        operation: "quiesce",
        phase: HookPhase::Quiesced,
        timeout: Duration::from_secs(60),
        quiesced_at: Some(QUIESCED_AT),
        generation: Some(1),
        expired_generation: None,
        now: quiesced_at() + chrono::Duration::seconds(seconds_after),
    }
}

mod no_operation_tests {
    use super::*;

    #[test]
    fn test_created_ensures_ready() {
        assert_eq!(
            plan_action(&input("", HookPhase::Created)),
            PlannedAction::EnsureReady
        );
    }

    #[test]
    fn test_not_ready_ensures_ready() {
        assert_eq!(
            plan_action(&input("", HookPhase::NotReady)),
            PlannedAction::EnsureReady
        );
    }

    #[test]
    fn test_ready_is_noop() {
        assert!(matches!(
            plan_action(&input("", HookPhase::Ready)),
            PlannedAction::NoOp(_)
        ));
    }

    #[test]
    fn test_quiesced_without_timeout_stays() {
        assert!(matches!(
            plan_action(&input("", HookPhase::Quiesced)),
            PlannedAction::NoOp(_)
        ));
    }
}

mod quiesce_tests {
    use super::*;

    #[test]
    fn test_quiesce_from_ready() {
        assert_eq!(
            plan_action(&input("quiesce", HookPhase::Ready)),
            PlannedAction::Quiesce
        );
    }

    #[test]
    fn test_quiesce_retried_from_in_progress() {
        assert_eq!(
            plan_action(&input("quiesce", HookPhase::QuiesceInProgress)),
            PlannedAction::Quiesce
        );
    }

    #[test]
    fn test_quiesce_is_idempotent() {
        assert!(matches!(
            plan_action(&input("quiesce", HookPhase::Quiesced)),
            PlannedAction::NoOp(_)
        ));
    }

    #[test]
    fn test_expired_generation_not_requiesced() {
        let mut plan = input("quiesce", HookPhase::Unquiesced);
        plan.expired_generation = Some(1);
        assert!(matches!(plan_action(&plan), PlannedAction::NoOp(_)));
    }

    #[test]
    fn test_new_generation_quiesces_again() {
        let mut plan = input("quiesce", HookPhase::Unquiesced);
        plan.generation = Some(2);
        plan.expired_generation = Some(1);
        assert_eq!(plan_action(&plan), PlannedAction::Quiesce);
    }
}

mod unquiesce_tests {
    use super::*;

    #[test]
    fn test_unquiesce_from_quiesced() {
        assert_eq!(
            plan_action(&input("unquiesce", HookPhase::Quiesced)),
            PlannedAction::Unquiesce { auto_resume: false }
        );
    }

    #[test]
    fn test_unquiesce_from_ready_releases_anyway() {
        assert_eq!(
            plan_action(&input("unquiesce", HookPhase::Ready)),
            PlannedAction::Unquiesce { auto_resume: false }
        );
    }

    #[test]
    fn test_unquiesce_is_idempotent() {
        assert!(matches!(
            plan_action(&input("unquiesce", HookPhase::Unquiesced)),
            PlannedAction::NoOp(_)
        ));
    }

    #[test]
    fn test_explicit_unquiesce_is_not_auto_resume() {
        let mut plan = quiesced_with_timeout(120);
        plan.operation = "unquiesce";
        assert_eq!(
            plan_action(&plan),
            PlannedAction::Unquiesce { auto_resume: false }
        );
    }
}

mod timeout_tests {
    use super::*;

    #[test]
    fn test_waits_before_timeout() {
        assert_eq!(
            plan_action(&quiesced_with_timeout(59)),
            PlannedAction::WaitForTimeout(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_resumes_after_timeout() {
        assert_eq!(
            plan_action(&quiesced_with_timeout(61)),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }

    #[test]
    fn test_resumes_exactly_at_timeout() {
        assert_eq!(
            plan_action(&quiesced_with_timeout(60)),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }

    #[test]
    fn test_missing_timestamp_resumes() {
        let mut plan = quiesced_with_timeout(0);
        plan.quiesced_at = None;
        assert_eq!(
            plan_action(&plan),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }

    #[test]
    fn test_garbled_timestamp_resumes() {
        let mut plan = quiesced_with_timeout(0);
        plan.quiesced_at = Some("yesterday");
        assert_eq!(
            plan_action(&plan),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }

    #[test]
    fn test_failed_resume_is_retried_from_not_ready() {
        let mut plan = quiesced_with_timeout(120);
        plan.phase = HookPhase::NotReady;
        assert_eq!(
            plan_action(&plan),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }

    #[test]
    fn test_timeout_applies_with_empty_operation() {
        let mut plan = quiesced_with_timeout(120);
        plan.operation = "";
        assert_eq!(
            plan_action(&plan),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }

    #[test]
    fn test_new_quiesce_after_failed_resume_is_released() {
        // The resume failed, so the old timestamp is still recorded while a
        // new generation asks for quiesce again
        let mut plan = quiesced_with_timeout(120);
        plan.phase = HookPhase::UnquiesceInProgress;
        plan.generation = Some(2);
        plan.expired_generation = Some(1);
        assert_eq!(
            plan_action(&plan),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }

    #[test]
    fn test_new_quiesce_before_deadline_waits() {
        let mut plan = quiesced_with_timeout(20);
        plan.phase = HookPhase::NotReady;
        plan.generation = Some(2);
        assert_eq!(
            plan_action(&plan),
            PlannedAction::WaitForTimeout(Duration::from_secs(40))
        );
    }

    #[test]
    fn test_clock_skew_waits_full_timeout() {
        assert_eq!(
            plan_action(&quiesced_with_timeout(-30)),
            PlannedAction::WaitForTimeout(Duration::from_secs(60))
        );
    }
}

mod reject_tests {
    use super::*;

    #[test]
    fn test_unknown_operation_rejected() {
        match plan_action(&input("freeze", HookPhase::Ready)) {
            PlannedAction::Reject(reason) => assert!(reason.contains("freeze")),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_operation_is_case_sensitive() {
        assert!(matches!(
            plan_action(&input("Quiesce", HookPhase::Ready)),
            PlannedAction::Reject(_)
        ));
    }

    #[test]
    fn test_timeout_release_beats_invalid_operation() {
        let mut plan = quiesced_with_timeout(120);
        plan.operation = "freeze";
        assert_eq!(
            plan_action(&plan),
            PlannedAction::Unquiesce { auto_resume: true }
        );
    }
}
