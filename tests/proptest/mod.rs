// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for planning, validation and reply parsing
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. The state machine never panics and always lands on a known phase
//! 2. Planning never panics and honours the quiesce timeout
//! 3. Spec validation is deterministic and rejects instead of panicking
//! 4. Engine reply parsers never panic on arbitrary text

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use apphook_operator::controller::state_machine::{
    HookEvent, HookStateMachine, PlanInput, PlannedAction, TransitionContext, plan_action,
};
use apphook_operator::controller::validation::validate_spec;
use apphook_operator::crd::{HookPhase, Operation, Provider};
use apphook_operator::driver::postgres::parse_major_version;
use apphook_operator::driver::redis::parsing::{
    RedisVersion, parse_cluster_nodes, parse_info_output,
};
use apphook_operator::driver::split_endpoint;

use common::*;

// =============================================================================
// Strategies
// =============================================================================

fn hook_phase() -> impl Strategy<Value = HookPhase> {
    prop::sample::select(HookPhase::ALL.to_vec())
}

fn hook_event() -> impl Strategy<Value = HookEvent> {
    prop::sample::select(HookEvent::ALL.to_vec())
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::None),
        Just(Operation::Quiesce),
        Just(Operation::Unquiesce),
    ]
}

/// Operation strings, mostly valid with some noise
fn operation_text() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => prop_oneof![Just(String::new()), Just("quiesce".to_string()), Just("unquiesce".to_string())],
        1 => "[a-zA-Z ]{0,12}",
    ]
}

fn provider_text() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("mysql".to_string()),
        Just("postgres".to_string()),
        Just("mongodb".to_string()),
        Just("redis".to_string()),
    ]
}

/// Randomly upper-case some characters
fn mixed_case(input: &str, mask: u64) -> String {
    input
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if mask & (1 << (i % 64)) != 0 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

// =============================================================================
// Property-based tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: State machine never panics and stays within known phases
    #[test]
    fn prop_state_machine_no_panic(
        phase in hook_phase(),
        event in hook_event(),
        op in operation(),
        auto_resume in any::<bool>()
    ) {
        let sm = HookStateMachine::new();
        let mut ctx = TransitionContext::new(op);
        if auto_resume {
            ctx = ctx.auto_resume();
        }

        let result = sm.transition(&phase, event, &ctx);
        prop_assert!(HookPhase::ALL.contains(&result.resulting_phase(phase)));
    }

    /// Property: Connection failures always lead to NotReady
    #[test]
    fn prop_connection_failure_not_ready(phase in hook_phase(), op in operation()) {
        let sm = HookStateMachine::new();
        let ctx = TransitionContext::new(op);
        let result = sm.transition(&phase, HookEvent::ConnectionFailed, &ctx);
        prop_assert_eq!(result.resulting_phase(phase), HookPhase::NotReady);
    }

    /// Property: Planning never panics on any input
    #[test]
    fn prop_plan_no_panic(
        op in operation_text(),
        phase in hook_phase(),
        timeout in 0u64..7200,
        stamp in prop::option::of("[0-9TZ:-]{0,25}"),
        generation in prop::option::of(1i64..5),
        expired in prop::option::of(1i64..5),
        offset in -3600i64..7200
    ) {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset);
        let input = PlanInput {
            operation: &op,
            phase,
            timeout: Duration::from_secs(timeout),
            quiesced_at: stamp.as_deref(),
            generation,
            expired_generation: expired,
            now,
        };
        let _ = plan_action(&input);
    }

    /// Property: A quiesced hook past its timeout is resumed unless unquiesce was requested
    #[test]
    fn prop_expired_timeout_resumes(
        op in operation_text(),
        timeout in 1u64..3600,
        overshoot in 0u64..3600
    ) {
        let quiesced_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let stamp = quiesced_at.to_rfc3339();
        let now = quiesced_at + chrono::Duration::seconds((timeout + overshoot) as i64);
        let input = PlanInput {
            operation: &op,
            phase: HookPhase::Quiesced,
            timeout: Duration::from_secs(timeout),
            quiesced_at: Some(&stamp),
            generation: Some(1),
            expired_generation: None,
            now,
        };

        let expected = PlannedAction::Unquiesce { auto_resume: op != "unquiesce" };
        prop_assert_eq!(plan_action(&input), expected);
    }

    /// Property: Remaining wait never exceeds the timeout
    #[test]
    fn prop_wait_within_timeout(timeout in 2u64..3600, elapsed_frac in 0.0f64..1.0) {
        let elapsed = ((timeout as f64) * elapsed_frac) as u64;
        prop_assume!(elapsed < timeout);

        let quiesced_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let stamp = quiesced_at.to_rfc3339();
        let input = PlanInput {
            operation: "quiesce",
            phase: HookPhase::Quiesced,
            timeout: Duration::from_secs(timeout),
            quiesced_at: Some(&stamp),
            generation: Some(1),
            expired_generation: None,
            now: quiesced_at + chrono::Duration::seconds(elapsed as i64),
        };

        match plan_action(&input) {
            PlannedAction::WaitForTimeout(remaining) => {
                prop_assert_eq!(remaining, Duration::from_secs(timeout - elapsed));
            }
            other => prop_assert!(false, "expected wait, got {:?}", other),
        }
    }

    /// Property: Provider names parse regardless of case
    #[test]
    fn prop_provider_case_insensitive(name in provider_text(), mask in any::<u64>()) {
        let expected: Provider = name.parse().unwrap();
        let parsed: Provider = mixed_case(&name, mask).parse().unwrap();
        prop_assert_eq!(parsed, expected);
        prop_assert_eq!(parsed.as_str(), name.as_str());
    }

    /// Property: Validation is deterministic and never panics
    #[test]
    fn prop_validation_deterministic(
        provider in "[a-zA-Z]{0,10}",
        endpoint in "[a-z.:\\[\\]0-9]{0,20}",
        databases in prop::collection::vec("[a-z]{0,6}", 0..3),
        timeout in prop::option::of(-10i32..100)
    ) {
        let dbs: Vec<&str> = databases.iter().map(String::as_str).collect();
        let mut builder = AppHookBuilder::new("hook", TEST_NAMESPACE)
            .with_provider(&provider)
            .with_endpoint(&endpoint)
            .with_databases(&dbs);
        if let Some(t) = timeout {
            builder = builder.with_timeout(t);
        }
        let hook = builder.build();

        let first = validate_spec(&hook).map_err(|e| e.to_string());
        let second = validate_spec(&hook).map_err(|e| e.to_string());
        prop_assert_eq!(first, second);
    }

    /// Property: Valid host:port endpoints split back into their parts
    #[test]
    fn prop_split_endpoint(host in "[a-z][a-z0-9.-]{0,20}", port in 1u16..=u16::MAX) {
        let endpoint = format!("{}:{}", host, port);
        let (parsed_host, parsed_port) = split_endpoint(&endpoint, 3306).unwrap();
        prop_assert_eq!(parsed_host, host);
        prop_assert_eq!(parsed_port, port);
    }

    /// Property: Endpoint splitting never panics
    #[test]
    fn prop_split_endpoint_no_panic(endpoint in "\\PC{0,30}") {
        let _ = split_endpoint(&endpoint, 6379);
    }

    /// Property: Server versions parse to their major number
    #[test]
    fn prop_pg_major_version(major in 9u32..30, minor in 0u32..30) {
        prop_assert_eq!(parse_major_version(&format!("{}.{}", major, minor)), Some(major));
    }

    /// Property: Redis reply parsers never panic on arbitrary text
    #[test]
    fn prop_redis_parsers_no_panic(text in "\\PC{0,200}") {
        let _ = parse_info_output(&text);
        let _ = parse_cluster_nodes(&text);
        let _ = RedisVersion::parse(&text);
    }
}
