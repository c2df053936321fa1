//! Status subresource updates for AppHook resources

use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::{Value, json};

use crate::controller::Context;
use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::Result;
use crate::crd::{AppHook, AppHookStatus, HookPhase};

/// Merge patch body for a full status write.
///
/// Absent optional fields are sent as `null` so a merge patch removes them
/// instead of leaving the previous value in place.
pub fn status_patch(status: &AppHookStatus) -> Value {
    json!({
        "status": {
            "phase": status.phase,
            "errMsg": status.err_msg,
            "quiescedTimestamp": status.quiesced_timestamp,
            "result": status.result,
            "preservedConfig": status.preserved_config,
            "expiredGeneration": status.expired_generation,
        }
    })
}

pub struct StatusManager<'a> {
    hook: &'a AppHook,
    ctx: &'a Context,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    pub fn new(hook: &'a AppHook, ctx: &'a Context, ns: &'a str) -> Self {
        Self { hook, ctx, ns }
    }

    pub fn current(&self) -> AppHookStatus {
        self.hook.status.clone().unwrap_or_default()
    }

    /// Write `status`, skipping the call when nothing changed
    pub async fn update(&self, status: &AppHookStatus) -> Result<bool> {
        if self.hook.status.as_ref() == Some(status) {
            return Ok(false);
        }

        let api: Api<AppHook> = Api::namespaced(self.ctx.client.clone(), self.ns);
        api.patch_status(
            &self.hook.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch(status)),
        )
        .await?;

        if let Some(state) = &self.ctx.health_state {
            state
                .metrics
                .set_hook_phase(self.ns, &self.hook.name_any(), status.phase);
        }
        Ok(true)
    }

    /// Write the initial `Created` status if the resource has none
    pub async fn initialize(&self) -> Result<()> {
        if self.hook.status.is_some() {
            return Ok(());
        }
        self.update(&AppHookStatus::default()).await.map(|_| ())
    }

    /// Record a configuration problem without touching lock state
    pub async fn set_not_ready(&self, message: &str) -> Result<()> {
        let mut status = self.current();
        status.phase = HookPhase::NotReady;
        status.err_msg = message.to_string();
        self.update(&status).await.map(|_| ())
    }
}
