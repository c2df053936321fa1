//! Shared context for the AppHook controller.
//!
//! Holds the Kubernetes client, the event reporter, the driver registry and
//! per-hook error tracking used by the error policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::config::OperatorConfig;
use crate::controller::error::ErrorContext;
use crate::crd::AppHook;
use crate::driver::InstanceRegistry;
use crate::health::HealthState;

/// Field manager name for patches and events
pub const FIELD_MANAGER: &str = "apphook-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    reporter: Reporter,
    pub registry: Arc<InstanceRegistry>,
    pub health_state: Option<Arc<HealthState>>,
    pub config: OperatorConfig,
    errors: Arc<Mutex<HashMap<String, ErrorContext>>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: Some(config.pod_name.clone()),
            },
            registry: Arc::new(InstanceRegistry::new()),
            health_state,
            config,
            errors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a failed pass and return the consecutive failure count
    pub fn record_error(&self, key: &str) -> u32 {
        match self.errors.lock() {
            Ok(mut errors) => {
                let entry = errors.entry(key.to_string()).or_default();
                entry.record_error();
                entry.consecutive_errors
            }
            Err(_) => 0,
        }
    }

    pub fn reset_errors(&self, key: &str) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.remove(key);
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish(
        &self,
        hook: &AppHook,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = hook.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    pub async fn publish_normal_event(
        &self,
        hook: &AppHook,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(hook, EventType::Normal, reason, action, note)
            .await;
    }

    pub async fn publish_warning_event(
        &self,
        hook: &AppHook,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(hook, EventType::Warning, reason, action, note)
            .await;
    }
}
