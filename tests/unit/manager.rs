//! Unit tests for the driver manager and the instance registry

use std::sync::Arc;
use std::time::Duration;

use apphook_operator::crd::{HookPhase, PARAM_QUIESCE_FROM_PRIMARY, Provider};
use apphook_operator::driver::{
    Driver, DriverError, DriverManager, ErrorKind, InstanceRegistry, MySqlDriver, RedisDriver,
};

use crate::common::*;

fn mysql_manager(fake: &FakeMySql, databases: &[&str]) -> DriverManager {
    DriverManager::with_driver(
        driver_config(Provider::MySql, "db.svc:3306", databases),
        Driver::MySql(MySqlDriver::new(Arc::new(fake.clone()))),
    )
    .unwrap()
}

fn redis_manager(fake: &FakeRedis) -> DriverManager {
    DriverManager::with_driver(
        driver_config(Provider::Redis, REDIS_ADDRESS, &[]),
        Driver::Redis(RedisDriver::new(Arc::new(fake.clone()))),
    )
    .unwrap()
}

const REDIS_ADDRESS: &str = "redis.svc:6379";

mod manager_tests {
    use super::*;

    #[test]
    fn test_driver_must_match_provider() {
        let result = DriverManager::with_driver(
            driver_config(Provider::Postgres, "pg.svc:5432", &["orders"]),
            Driver::MySql(MySqlDriver::new(Arc::new(FakeMySql::new()))),
        );
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[test]
    fn test_live_manager_requires_databases() {
        let result = DriverManager::new(driver_config(Provider::Postgres, "pg.svc:5432", &[]));
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[test]
    fn test_live_manager_for_redis() {
        let manager =
            DriverManager::new(driver_config(Provider::Redis, "redis.svc", &[])).unwrap();
        assert_eq!(manager.provider(), Provider::Redis);
        assert!(matches!(manager.driver(), Driver::Redis(_)));
    }

    #[tokio::test]
    async fn test_name_cannot_change() {
        let mut manager = mysql_manager(&FakeMySql::new(), &["orders"]);
        let mut config = manager.config().clone();
        config.name = "other-job".to_string();

        let err = manager.update(config, HookPhase::Ready).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(manager.config().name, "backup-job");
    }

    #[tokio::test]
    async fn test_provider_cannot_change() {
        let mut manager = mysql_manager(&FakeMySql::new(), &["orders"]);
        let config = driver_config(Provider::Postgres, "db.svc:3306", &["orders"]);

        let err = manager.update(config, HookPhase::Ready).await.unwrap_err();
        assert!(err.to_string().contains("provider cannot change"));
    }

    #[tokio::test]
    async fn test_timeout_change_does_not_reconnect() {
        let fake = FakeMySql::new();
        let mut manager = mysql_manager(&fake, &["orders"]);
        let config = with_timeout(manager.config().clone(), Duration::from_secs(90));

        let reconnected = manager.update(config, HookPhase::Ready).await.unwrap();
        assert!(!reconnected);
        assert_eq!(
            manager.config().operation_timeout,
            Some(Duration::from_secs(90))
        );
        assert_eq!(fake.server.lock().unwrap().opened, 0);
    }

    #[tokio::test]
    async fn test_database_order_does_not_reconnect() {
        let fake = FakeMySql::new();
        let mut manager = mysql_manager(&fake, &["orders", "users"]);
        let config = driver_config(Provider::MySql, "db.svc:3306", &["users", "orders"]);

        assert!(!manager.update(config, HookPhase::Ready).await.unwrap());
    }

    #[tokio::test]
    async fn test_database_change_reconnects() {
        let fake = FakeMySql::new();
        let mut manager = mysql_manager(&fake, &["orders"]);
        let config = driver_config(Provider::MySql, "db.svc:3306", &["orders", "users"]);

        assert!(manager.update(config, HookPhase::Ready).await.unwrap());
        assert_eq!(manager.config().databases, vec!["orders", "users"]);
        assert_eq!(fake.server.lock().unwrap().opened, 2);
    }

    #[tokio::test]
    async fn test_connection_change_deferred_while_quiesced() {
        let fake = FakeMySql::new();
        let mut manager = mysql_manager(&fake, &["orders", "users"]);
        manager.quiesce().await.unwrap();
        let config = with_param(manager.config().clone(), PARAM_QUIESCE_FROM_PRIMARY, "true");

        let reconnected = manager
            .update(config.clone(), HookPhase::Quiesced)
            .await
            .unwrap();
        assert!(!reconnected);
        match manager.driver() {
            Driver::MySql(driver) => assert_eq!(driver.locked_databases().len(), 2),
            _ => panic!("expected mysql driver"),
        }
        assert_eq!(fake.held_locks(), vec!["orders", "users"]);
        assert!(!manager.config().quiesce_from_primary);
        assert_eq!(manager.pending_config(), Some(&config));

        manager.unquiesce(None).await.unwrap();
        assert!(fake.held_locks().is_empty());
        assert!(manager.config().quiesce_from_primary);
        assert_eq!(manager.pending_config(), None);
    }

    #[tokio::test]
    async fn test_deferred_change_dropped_when_reverted() {
        let fake = FakeMySql::new();
        let mut manager = mysql_manager(&fake, &["orders"]);
        let original = manager.config().clone();
        manager.quiesce().await.unwrap();

        let moved = driver_config(Provider::MySql, "db2.svc:3306", &["orders"]);
        manager.update(moved, HookPhase::Quiesced).await.unwrap();
        assert!(manager.pending_config().is_some());

        manager.update(original, HookPhase::Quiesced).await.unwrap();
        assert_eq!(manager.pending_config(), None);
        assert_eq!(fake.held_locks(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_held_sessions_defer_change_in_any_phase() {
        let fake = FakeMySql::new();
        let mut manager = mysql_manager(&fake, &["orders"]);
        manager.quiesce().await.unwrap();

        // Status lagging behind the driver still must not drop the locks
        let moved = driver_config(Provider::MySql, "db2.svc:3306", &["orders"]);
        assert!(!manager.update(moved, HookPhase::Ready).await.unwrap());
        assert_eq!(fake.held_locks(), vec!["orders"]);
        assert_eq!(manager.config().host, "db.svc:3306");
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_reported() {
        let mut manager = DriverManager::with_driver(
            driver_config(Provider::MySql, "db.svc:3306", &["orders"]),
            Driver::MySql(MySqlDriver::new(Arc::new(FakeMySql::unreachable()))),
        )
        .unwrap();
        let config = driver_config(Provider::MySql, "db2.svc:3306", &["orders"]);

        let err = manager.update(config, HookPhase::Ready).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert_eq!(manager.config().host, "db2.svc:3306");
    }
}

mod registry_tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(InstanceRegistry::key("default", "orders-hook"), "default/orders-hook");
    }

    #[tokio::test]
    async fn test_insert_once() {
        let registry = InstanceRegistry::new();
        let fake = FakeMySql::new();
        let key = InstanceRegistry::key("default", "orders-hook");

        let (_, created) = registry
            .get_or_try_insert_with(&key, || Ok(mysql_manager(&fake, &["orders"])))
            .await
            .unwrap();
        assert!(created);

        let (_, created) = registry
            .get_or_try_insert_with(&key, || panic!("factory must not run for an existing key"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_factory_inserts_nothing() {
        let registry = InstanceRegistry::new();
        let result = registry
            .get_or_try_insert_with("default/bad", || {
                Err(DriverError::Configuration("bad endpoint".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_shared_manager_state() {
        let registry = InstanceRegistry::new();
        let fake = FakeMySql::new();
        let shared = registry
            .insert("default/orders-hook", mysql_manager(&fake, &["orders"]))
            .await;

        shared.lock().await.quiesce().await.unwrap();

        let again = registry.get("default/orders-hook").await.unwrap();
        let manager = again.lock().await;
        match manager.driver() {
            Driver::MySql(driver) => assert_eq!(driver.locked_databases(), vec!["orders"]),
            _ => panic!("expected mysql driver"),
        }
    }

    #[tokio::test]
    async fn test_remove_drops_entry() {
        let registry = InstanceRegistry::new();
        registry
            .insert("default/orders-hook", mysql_manager(&FakeMySql::new(), &["orders"]))
            .await;

        assert!(registry.remove("default/orders-hook").await.is_some());
        assert!(!registry.contains("default/orders-hook").await);
        assert!(registry.remove("default/orders-hook").await.is_none());
    }
    #[tokio::test]
    async fn test_remove_closes_sessions_still_referenced() {
        let registry = InstanceRegistry::new();
        let fake = FakeMySql::new();
        let shared = registry
            .insert("default/orders-hook", mysql_manager(&fake, &["orders", "users"]))
            .await;
        shared.lock().await.quiesce().await.unwrap();
        assert_eq!(fake.held_locks(), vec!["orders", "users"]);

        registry.remove("default/orders-hook").await;
        assert!(fake.held_locks().is_empty());
        assert_eq!(fake.open_sessions(), 0);
        drop(shared);
    }

    #[tokio::test]
    async fn test_replaced_manager_is_closed() {
        let registry = InstanceRegistry::new();
        let first = FakeRedis::standalone(REDIS_ADDRESS, RedisServer::standalone("7.2.4"));
        let shared = registry
            .insert("default/cache-hook", redis_manager(&first))
            .await;
        shared.lock().await.connect().await.unwrap();
        assert_eq!(first.open_connections(), 1);

        let second = FakeRedis::standalone(REDIS_ADDRESS, RedisServer::standalone("7.2.4"));
        registry
            .insert("default/cache-hook", redis_manager(&second))
            .await;
        assert_eq!(first.open_connections(), 0);
    }
}
