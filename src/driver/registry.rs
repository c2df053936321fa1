//! Process-wide cache of driver managers keyed by `namespace/name`

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::{DriverError, DriverManager};

/// A manager shared between reconcile passes.
///
/// kube-runtime never reconciles the same object concurrently, so the
/// per-entry mutex is uncontended in practice.
pub type SharedManager = Arc<Mutex<DriverManager>>;

#[derive(Default)]
pub struct InstanceRegistry {
    managers: RwLock<HashMap<String, SharedManager>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }

    pub async fn get(&self, key: &str) -> Option<SharedManager> {
        self.managers.read().await.get(key).cloned()
    }

    /// Return the existing manager or insert the one built by `create`.
    ///
    /// `create` only runs when the key is absent.
    pub async fn get_or_try_insert_with<F>(
        &self,
        key: &str,
        create: F,
    ) -> Result<(SharedManager, bool), DriverError>
    where
        F: FnOnce() -> Result<DriverManager, DriverError>,
    {
        if let Some(existing) = self.get(key).await {
            return Ok((existing, false));
        }

        let mut managers = self.managers.write().await;
        if let Some(existing) = managers.get(key) {
            return Ok((Arc::clone(existing), false));
        }
        let manager = Arc::new(Mutex::new(create()?));
        managers.insert(key.to_string(), Arc::clone(&manager));
        Ok((manager, true))
    }

    /// Insert `manager`, closing any manager it replaces
    pub async fn insert(&self, key: &str, manager: DriverManager) -> SharedManager {
        let shared = Arc::new(Mutex::new(manager));
        let previous = self
            .managers
            .write()
            .await
            .insert(key.to_string(), Arc::clone(&shared));
        if let Some(previous) = previous {
            previous.lock().await.close().await;
        }
        shared
    }

    /// Remove the manager and close its connections.
    ///
    /// Closing ends session scoped locks and backups.
    pub async fn remove(&self, key: &str) -> Option<SharedManager> {
        let removed = self.managers.write().await.remove(key);
        if let Some(manager) = &removed {
            manager.lock().await.close().await;
        }
        removed
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.managers.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.managers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.managers.read().await.is_empty()
    }
}
