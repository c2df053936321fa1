//! Unit tests for status patches and resource helpers

use std::collections::BTreeMap;

use apphook_operator::controller::status::status_patch;
use apphook_operator::crd::{
    AppHookStatus, HookPhase, MySqlResult, PreservedConfig, QuiesceResult,
};
use apphook_operator::driver::{Credentials, DriverConfig};

use crate::common::*;

#[test]
fn test_phase_serialization() {
    assert_eq!(
        serde_json::to_value(HookPhase::QuiesceInProgress).unwrap(),
        "Quiesce In Progress"
    );
    assert_eq!(
        serde_json::to_value(HookPhase::UnquiesceInProgress).unwrap(),
        "Unquiesce In Progress"
    );
    assert_eq!(serde_json::to_value(HookPhase::NotReady).unwrap(), "NotReady");
}

#[test]
fn test_quiesced_patch() {
    let status = AppHookStatus {
        phase: HookPhase::Quiesced,
        quiesced_timestamp: Some("2026-03-01T12:00:00Z".to_string()),
        result: Some(QuiesceResult {
            mysql: Some(MySqlResult {
                locked_databases: vec!["orders".to_string()],
                lock_method: "table".to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let patch = status_patch(&status);
    assert_eq!(patch["status"]["phase"], "Quiesced");
    assert_eq!(patch["status"]["quiescedTimestamp"], "2026-03-01T12:00:00Z");
    assert_eq!(
        patch["status"]["result"]["mysql"]["lockedDatabases"][0],
        "orders"
    );
    assert_eq!(patch["status"]["errMsg"], "");
}

#[test]
fn test_unquiesce_patch_clears_quiesce_fields() {
    let status = AppHookStatus {
        phase: HookPhase::Unquiesced,
        expired_generation: Some(3),
        ..Default::default()
    };

    let patch = status_patch(&status);
    assert!(patch["status"]["quiescedTimestamp"].is_null());
    assert!(patch["status"]["result"].is_null());
    assert!(patch["status"]["preservedConfig"].is_null());
    assert_eq!(patch["status"]["expiredGeneration"], 3);
}

#[test]
fn test_preserved_config_patch() {
    let status = AppHookStatus {
        phase: HookPhase::QuiesceInProgress,
        err_msg: "operation failed: bgsave".to_string(),
        preserved_config: Some(PreservedConfig {
            params: BTreeMap::from([("save".to_string(), "3600 1".to_string())]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let patch = status_patch(&status);
    assert_eq!(patch["status"]["phase"], "Quiesce In Progress");
    assert_eq!(patch["status"]["preservedConfig"]["params"]["save"], "3600 1");
    assert_eq!(patch["status"]["errMsg"], "operation failed: bgsave");
}

#[test]
fn test_phase_helpers() {
    let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE).build();
    assert_eq!(hook.phase(), HookPhase::Created);

    let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE)
        .with_phase(HookPhase::Quiesced)
        .with_timeout(-1)
        .build();
    assert_eq!(hook.phase(), HookPhase::Quiesced);
    assert_eq!(hook.timeout_seconds(), 0);
    assert!(HookPhase::Quiesced.may_hold_lock());
    assert!(!HookPhase::Unquiesced.may_hold_lock());
}

#[test]
fn test_driver_config_from_spec() {
    let hook = AppHookBuilder::mongodb("catalog", TEST_NAMESPACE)
        .with_param("QuiesceFromPrimary", "TRUE")
        .with_timeout(120)
        .build();
    let config = DriverConfig::from_spec(
        &hook.spec,
        apphook_operator::crd::Provider::MongoDb,
        &Credentials::new("admin", "pw"),
    );

    assert_eq!(config.name, "catalog");
    assert_eq!(config.host, "mongo.svc:27017");
    assert!(config.quiesce_from_primary);
    assert_eq!(
        config.operation_timeout,
        Some(std::time::Duration::from_secs(120))
    );
    assert_eq!(config.endpoint().unwrap(), ("mongo.svc".to_string(), 27017));
}
