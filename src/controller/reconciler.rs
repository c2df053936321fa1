//! Reconciliation logic for AppHook resources
//!
//! One pass validates the spec, resolves credentials, refreshes the cached
//! driver manager, plans a single action and executes it. Every executed
//! action ends in a status patch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::credentials::fetch_credentials;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::executor::{ExecutionContext, execute_plan};
use crate::controller::state_machine::{PlanInput, plan_action};
use crate::controller::status::StatusManager;
use crate::controller::validation::validate_spec;
use crate::crd::{AppHook, Operation};
use crate::driver::{DriverConfig, DriverManager, ErrorKind, InstanceRegistry};

pub const FINALIZER: &str = "apphook.storage.example.com/finalizer";

#[instrument(skip(hook, ctx), fields(name = %hook.name_any(), namespace = hook.namespace().unwrap_or_default()))]
pub async fn reconcile(hook: Arc<AppHook>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let ns = hook
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = hook.name_any();
    let key = InstanceRegistry::key(&ns, &name);

    debug!("Reconciling AppHook");

    if hook.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&hook, &ctx, &ns, &key).await;
    }

    if !has_finalizer(&hook) {
        add_finalizer(&hook, &ctx, &ns).await?;
        StatusManager::new(&hook, &ctx, &ns).initialize().await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let result = reconcile_hook(&hook, &ctx, &ns, &key).await;

    if let Some(state) = &ctx.health_state {
        state
            .metrics
            .record_reconcile(&ns, &name, started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => state.touch_reconcile(),
            Err(_) => state.metrics.record_error(&ns, &name),
        }
    }
    if result.is_ok() {
        ctx.reset_errors(&key);
    }
    result
}

/// Non-retryable errors wait for a spec change; the rest back off
/// exponentially per hook.
pub fn error_policy(hook: Arc<AppHook>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = InstanceRegistry::key(&hook.namespace().unwrap_or_default(), &hook.name_any());
    let attempts = ctx.record_error(&key);

    if !error.is_retryable() {
        error!(
            name = %hook.name_any(),
            %error,
            "Non-retryable error, waiting for a spec change"
        );
        return Action::await_change();
    }

    let delay = BackoffConfig::default().delay_for_attempt(attempts.saturating_sub(1));
    warn!(
        name = %hook.name_any(),
        %error,
        attempts,
        ?delay,
        "Retryable error, requeuing"
    );
    Action::requeue(delay)
}

async fn reconcile_hook(hook: &AppHook, ctx: &Context, ns: &str, key: &str) -> Result<Action> {
    let status_manager = StatusManager::new(hook, ctx, ns);

    let provider = match validate_spec(hook) {
        Ok(provider) => provider,
        Err(e) => return reject_configuration(hook, ctx, &status_manager, e).await,
    };

    let credentials = match fetch_credentials(
        ctx.client.clone(),
        &hook.spec.secret,
        &ctx.config.admin_namespace,
        provider,
    )
    .await
    {
        Ok(credentials) => credentials,
        Err(e) if !e.is_retryable() => {
            return reject_configuration(hook, ctx, &status_manager, e).await;
        }
        Err(e) => return Err(e),
    };

    let config = DriverConfig::from_spec(&hook.spec, provider, &credentials);
    let status = status_manager.current();

    let (shared, created) = match ctx
        .registry
        .get_or_try_insert_with(key, || DriverManager::new(config.clone()))
        .await
    {
        Ok(entry) => entry,
        Err(e) => return reject_configuration(hook, ctx, &status_manager, e.into()).await,
    };
    if created {
        info!(%provider, endpoint = %config.host, "Registered driver");
    }

    let mut manager = shared.lock().await;
    if !created {
        match manager.update(config, status.phase).await {
            Ok(true) => info!("Driver reconnected with new configuration"),
            Ok(false) => {}
            Err(e) if e.kind() == ErrorKind::Configuration => {
                drop(manager);
                return reject_configuration(hook, ctx, &status_manager, e.into()).await;
            }
            // The planned action reconnects and reports the failure
            Err(e) => warn!(error = %e, "Reconnect after configuration change failed"),
        }
    }

    let timeout = Duration::from_secs(hook.timeout_seconds());
    let now = Utc::now();
    let plan = plan_action(&PlanInput {
        operation: &hook.spec.operation_type,
        phase: status.phase,
        timeout,
        quiesced_at: status.quiesced_timestamp.as_deref(),
        generation: hook.metadata.generation,
        expired_generation: status.expired_generation,
        now,
    });
    debug!(?plan, phase = %status.phase, "Planned action");

    let exec_ctx = ExecutionContext {
        status: &status,
        operation: hook.spec.operation_type.parse().unwrap_or(Operation::None),
        generation: hook.metadata.generation,
        timeout,
        now,
        metrics: ctx.health_state.as_deref().map(|s| &s.metrics),
    };
    let outcome = execute_plan(&mut manager, &plan, &exec_ctx).await;
    drop(manager);

    if outcome.is_rejected() {
        let note = outcome.note.clone().unwrap_or_default();
        warn!(operation = %hook.spec.operation_type, %note, "Rejected operation");
        ctx.publish_warning_event(hook, "InvalidOperation", "Reconcile", Some(note))
            .await;
        return Ok(Action::await_change());
    }

    status_manager.update(&outcome.status).await?;

    if let (Some(reason), Some(event)) = (outcome.event_reason(), outcome.event) {
        if event.is_failure() {
            let note = Some(outcome.status.err_msg.clone());
            ctx.publish_warning_event(hook, reason, "Reconcile", note)
                .await;
        } else {
            let note = Some(format!("{} is {}", hook.spec.name, outcome.status.phase));
            ctx.publish_normal_event(hook, reason, "Reconcile", note)
                .await;
        }
    }

    if let Some(e) = outcome.error {
        return Err(e.into());
    }

    Ok(match outcome.requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// Mark the hook NotReady for a problem only a spec or secret change fixes
async fn reject_configuration(
    hook: &AppHook,
    ctx: &Context,
    status_manager: &StatusManager<'_>,
    error: Error,
) -> Result<Action> {
    warn!(%error, "Configuration rejected");
    status_manager.set_not_ready(&error.to_string()).await?;
    ctx.publish_warning_event(hook, "ConfigurationRejected", "Reconcile", Some(error.to_string()))
        .await;
    Err(error)
}

fn has_finalizer(hook: &AppHook) -> bool {
    hook.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

async fn add_finalizer(hook: &AppHook, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<AppHook> = Api::namespaced(ctx.client.clone(), ns);
    let name = hook.name_any();

    let mut finalizers = hook.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

/// Close the cached driver and release the resource.
///
/// Deletion never unquiesces. Closing the driver ends session scoped locks
/// and backups; anything else stays frozen.
async fn handle_deletion(hook: &AppHook, ctx: &Context, ns: &str, key: &str) -> Result<Action> {
    let name = hook.name_any();
    info!("Handling deletion of {}", name);

    if ctx.registry.remove(key).await.is_some() {
        debug!("Closed and removed driver from registry");
    }
    ctx.reset_errors(key);

    let phase = hook.phase();
    if phase.may_hold_lock() {
        warn!(%phase, "AppHook deleted while the instance may still be quiesced");
        ctx.publish_warning_event(
            hook,
            "DeletedWhileQuiesced",
            "Delete",
            Some(format!(
                "{} was deleted in phase {}; verify the instance accepts writes",
                hook.spec.name, phase
            )),
        )
        .await;
    }

    if let Some(state) = &ctx.health_state {
        state.metrics.remove_hook(ns, &name);
    }

    if has_finalizer(hook) {
        let api: Api<AppHook> = Api::namespaced(ctx.client.clone(), ns);
        let remaining: Vec<String> = hook
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        let patch = if remaining.is_empty() {
            serde_json::json!({ "metadata": { "finalizers": null } })
        } else {
            serde_json::json!({ "metadata": { "finalizers": remaining } })
        };

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!("Removed finalizer from {}", name);
    }

    Ok(Action::await_change())
}
