//! Test fixtures and builders for AppHook resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let hook = AppHookBuilder::mysql("orders", "default")
//!     .with_operation("quiesce")
//!     .with_timeout(60)
//!     .build();
//! let config = driver_config(Provider::MySql, "db.svc:3306", &["orders"]);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use apphook_operator::crd::{
    AppHook, AppHookSpec, AppHookStatus, HookPhase, PARAM_QUIESCE_FROM_PRIMARY, Provider,
    SecretReference,
};
use apphook_operator::driver::DriverConfig;
use kube::core::ObjectMeta;

pub const TEST_NAMESPACE: &str = "default";
pub const ADMIN_NAMESPACE: &str = "storage-admin";

/// Builder for AppHook resources
pub struct AppHookBuilder {
    name: String,
    namespace: String,
    spec: AppHookSpec,
    generation: Option<i64>,
    status: Option<AppHookStatus>,
    finalizers: Option<Vec<String>>,
}

impl AppHookBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: AppHookSpec {
                name: name.to_string(),
                app_provider: String::new(),
                end_point: String::new(),
                databases: Vec::new(),
                operation_type: String::new(),
                timeout_seconds: None,
                secret: SecretReference {
                    name: format!("{}-credentials", name),
                    namespace: None,
                },
                params: BTreeMap::new(),
            },
            generation: Some(1),
            status: None,
            finalizers: None,
        }
    }

    pub fn mysql(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace)
            .with_provider("mysql")
            .with_endpoint("db.svc:3306")
            .with_databases(&["orders"])
    }

    pub fn postgres(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace)
            .with_provider("postgres")
            .with_endpoint("pg.svc:5432")
            .with_databases(&["orders"])
    }

    pub fn mongodb(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace)
            .with_provider("mongodb")
            .with_endpoint("mongo.svc:27017")
    }

    pub fn redis(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace)
            .with_provider("redis")
            .with_endpoint("redis.svc:6379")
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.spec.app_provider = provider.to_string();
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.spec.end_point = endpoint.to_string();
        self
    }

    pub fn with_databases(mut self, databases: &[&str]) -> Self {
        self.spec.databases = databases.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.spec.operation_type = operation.to_string();
        self
    }

    pub fn with_timeout(mut self, seconds: i32) -> Self {
        self.spec.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_secret(mut self, name: &str, namespace: Option<&str>) -> Self {
        self.spec.secret = SecretReference {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        };
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.spec.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_phase(mut self, phase: HookPhase) -> Self {
        self.status.get_or_insert_with(AppHookStatus::default).phase = phase;
        self
    }

    pub fn with_status(mut self, status: AppHookStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        self
    }

    pub fn build(self) -> AppHook {
        AppHook {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                generation: self.generation,
                finalizers: self.finalizers,
                uid: Some("test-uid-12345".to_string()),
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

/// Driver configuration with `root`/`secret` credentials
pub fn driver_config(provider: Provider, host: &str, databases: &[&str]) -> DriverConfig {
    DriverConfig {
        name: "backup-job".to_string(),
        provider,
        host: host.to_string(),
        databases: databases.iter().map(|d| d.to_string()).collect(),
        username: "root".to_string(),
        password: "secret".to_string(),
        quiesce_from_primary: false,
        params: BTreeMap::new(),
        operation_timeout: None,
    }
}

/// Add a param, deriving the primary flag the way `DriverConfig::from_spec` does
pub fn with_param(mut config: DriverConfig, key: &str, value: &str) -> DriverConfig {
    if key == PARAM_QUIESCE_FROM_PRIMARY {
        config.quiesce_from_primary = value.eq_ignore_ascii_case("true");
    }
    config.params.insert(key.to_string(), value.to_string());
    config
}

pub fn with_timeout(mut config: DriverConfig, timeout: Duration) -> DriverConfig {
    config.operation_timeout = Some(timeout);
    config
}
