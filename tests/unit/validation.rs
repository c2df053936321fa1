//! Unit tests for spec validation and credential handling

use std::collections::BTreeMap;

use apphook_operator::controller::Error;
use apphook_operator::controller::credentials::{credentials_from_secret, secret_namespace};
use apphook_operator::controller::validation::validate_spec;
use apphook_operator::crd::{Provider, SecretReference};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;

use crate::common::*;

fn secret(data: &[(&str, &str)]) -> Secret {
    Secret {
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    }
}

fn assert_invalid(result: Result<Provider, Error>, needle: &str) {
    match result {
        Err(Error::InvalidConfig(msg)) => {
            assert!(msg.contains(needle), "'{msg}' does not mention '{needle}'")
        }
        other => panic!("expected InvalidConfig, got {:?}", other),
    }
}

mod spec_tests {
    use super::*;

    #[test]
    fn test_valid_specs() {
        let hooks = [
            AppHookBuilder::mysql("orders", TEST_NAMESPACE).build(),
            AppHookBuilder::postgres("orders", TEST_NAMESPACE).build(),
            AppHookBuilder::mongodb("orders", TEST_NAMESPACE).build(),
            AppHookBuilder::redis("orders", TEST_NAMESPACE).build(),
        ];
        let providers: Vec<Provider> = hooks.iter().map(|h| validate_spec(h).unwrap()).collect();
        assert_eq!(
            providers,
            vec![
                Provider::MySql,
                Provider::Postgres,
                Provider::MongoDb,
                Provider::Redis
            ]
        );
    }

    #[test]
    fn test_provider_case_insensitive() {
        let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE)
            .with_provider("MySQL")
            .build();
        assert_eq!(validate_spec(&hook).unwrap(), Provider::MySql);
    }

    #[test]
    fn test_unknown_provider() {
        let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE)
            .with_provider("oracle")
            .build();
        assert_invalid(validate_spec(&hook), "oracle");
    }

    #[test]
    fn test_empty_name() {
        let mut hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE).build();
        hook.spec.name = "  ".to_string();
        assert_invalid(validate_spec(&hook), "spec.name");
    }

    #[test]
    fn test_empty_endpoint() {
        let hook = AppHookBuilder::redis("cache", TEST_NAMESPACE)
            .with_endpoint("")
            .build();
        assert_invalid(validate_spec(&hook), "spec.endPoint");
    }

    #[test]
    fn test_bad_port() {
        let hook = AppHookBuilder::redis("cache", TEST_NAMESPACE)
            .with_endpoint("redis.svc:99999")
            .build();
        assert_invalid(validate_spec(&hook), "port");
    }

    #[test]
    fn test_mysql_requires_databases() {
        let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE)
            .with_databases(&[])
            .build();
        assert_invalid(validate_spec(&hook), "database");
    }

    #[test]
    fn test_mongodb_needs_no_databases() {
        let hook = AppHookBuilder::mongodb("catalog", TEST_NAMESPACE).build();
        assert!(hook.spec.databases.is_empty());
        assert!(validate_spec(&hook).is_ok());
    }

    #[test]
    fn test_empty_database_name() {
        let hook = AppHookBuilder::postgres("orders", TEST_NAMESPACE)
            .with_databases(&["orders", ""])
            .build();
        assert_invalid(validate_spec(&hook), "empty names");
    }

    #[test]
    fn test_missing_secret_name() {
        let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE)
            .with_secret("", None)
            .build();
        assert_invalid(validate_spec(&hook), "spec.secret.name");
    }

    #[test]
    fn test_negative_timeout() {
        let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE)
            .with_timeout(-5)
            .build();
        assert_invalid(validate_spec(&hook), "timeoutSeconds");
    }

    #[test]
    fn test_operation_not_validated_here() {
        let hook = AppHookBuilder::mysql("orders", TEST_NAMESPACE)
            .with_operation("freeze")
            .build();
        assert!(validate_spec(&hook).is_ok());
    }
}

mod credential_tests {
    use super::*;

    fn reference(namespace: Option<&str>) -> SecretReference {
        SecretReference {
            name: "db-credentials".to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    #[test]
    fn test_secret_defaults_to_admin_namespace() {
        assert_eq!(
            secret_namespace(&reference(None), ADMIN_NAMESPACE).unwrap(),
            ADMIN_NAMESPACE
        );
        assert_eq!(
            secret_namespace(&reference(Some("")), ADMIN_NAMESPACE).unwrap(),
            ADMIN_NAMESPACE
        );
    }

    #[test]
    fn test_secret_in_admin_namespace() {
        assert_eq!(
            secret_namespace(&reference(Some(ADMIN_NAMESPACE)), ADMIN_NAMESPACE).unwrap(),
            ADMIN_NAMESPACE
        );
    }

    #[test]
    fn test_secret_in_other_namespace_rejected() {
        let err = secret_namespace(&reference(Some(TEST_NAMESPACE)), ADMIN_NAMESPACE).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_reads_data_and_trims_newline() {
        let creds = credentials_from_secret(
            &secret(&[("username", "root\n"), ("password", "s3cret\n")]),
            Provider::MySql,
        )
        .unwrap();
        assert_eq!(creds.username, "root");
        assert_eq!(creds.password, "s3cret");
    }

    #[test]
    fn test_reads_string_data() {
        let secret = Secret {
            string_data: Some(BTreeMap::from([
                ("username".to_string(), "postgres".to_string()),
                ("password".to_string(), "pw".to_string()),
            ])),
            ..Default::default()
        };
        let creds = credentials_from_secret(&secret, Provider::Postgres).unwrap();
        assert_eq!(creds.username, "postgres");
    }

    #[test]
    fn test_missing_username_rejected() {
        let err =
            credentials_from_secret(&secret(&[("password", "pw")]), Provider::MongoDb).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_empty_password_allowed() {
        let creds =
            credentials_from_secret(&secret(&[("username", "root"), ("password", "")]), Provider::MySql)
                .unwrap();
        assert!(creds.password.is_empty());
    }

    #[test]
    fn test_redis_without_credentials() {
        let creds = credentials_from_secret(&Secret::default(), Provider::Redis).unwrap();
        assert!(creds.username.is_empty());
        assert!(creds.password.is_empty());
    }
}
