//! Runs a planned action against a driver and derives the next status.
//!
//! Nothing here talks to the Kubernetes API: the reconciler persists the
//! returned status and publishes the event.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::controller::state_machine::{
    HookEvent, HookStateMachine, PlannedAction, TransitionContext, TransitionResult,
};
use crate::crd::{AppHookStatus, HookPhase, Operation, Provider};
use crate::driver::{DriverError, DriverManager, ErrorKind};
use crate::health::Metrics;

/// Inputs for one execution
pub struct ExecutionContext<'a> {
    pub status: &'a AppHookStatus,
    /// Parsed `spec.operationType`, used by transition guards
    pub operation: Operation,
    pub generation: Option<i64>,
    pub timeout: Duration,
    pub now: DateTime<Utc>,
    pub metrics: Option<&'a Metrics>,
}

/// Result of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Status to persist; equal to the input when nothing happened
    pub status: AppHookStatus,
    pub event: Option<HookEvent>,
    /// The unquiesce was triggered by the timeout
    pub auto_resume: bool,
    pub requeue_after: Option<Duration>,
    /// Driver failure already recorded in `status`
    pub error: Option<DriverError>,
    /// Why nothing was done, or why the request was rejected
    pub note: Option<String>,
}

impl ReconcileOutcome {
    fn unchanged(status: &AppHookStatus) -> Self {
        Self {
            status: status.clone(),
            event: None,
            auto_resume: false,
            requeue_after: None,
            error: None,
            note: None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.event.is_none() && self.error.is_some()
    }

    /// Kubernetes event reason for the outcome
    pub fn event_reason(&self) -> Option<&'static str> {
        let reason = match self.event? {
            HookEvent::ConnectionEstablished => "Ready",
            HookEvent::ConnectionFailed => "ConnectionFailed",
            HookEvent::ConfigurationRejected => "ConfigurationRejected",
            HookEvent::QuiesceSucceeded => "Quiesced",
            HookEvent::QuiesceFailed => "QuiesceFailed",
            HookEvent::UnquiesceSucceeded if self.auto_resume => "AutoUnquiesced",
            HookEvent::UnquiesceSucceeded => "Unquiesced",
            HookEvent::UnquiesceFailed => "UnquiesceFailed",
        };
        Some(reason)
    }

    fn apply(&mut self, machine: &HookStateMachine, event: HookEvent, ctx: &TransitionContext) {
        let current = self.status.phase;
        match machine.transition(&current, event, ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                if from != to {
                    info!(%from, %to, %event, "{}", description);
                }
                self.status.phase = to;
            }
            TransitionResult::InvalidTransition { current, event } => {
                warn!(%current, %event, "Invalid transition ignored");
            }
            TransitionResult::GuardFailed { from, to, reason, .. } => {
                warn!(%from, %to, %reason, "Transition guard failed");
            }
        }
        self.event = Some(event);
    }

    fn fail(
        &mut self,
        machine: &HookStateMachine,
        event: HookEvent,
        ctx: &TransitionContext,
        error: DriverError,
    ) {
        self.apply(machine, event, ctx);
        self.status.err_msg = error.to_string();
        self.error = Some(error);
    }

    fn fail_connect(
        &mut self,
        machine: &HookStateMachine,
        ctx: &TransitionContext,
        error: DriverError,
    ) {
        let event = if error.kind() == ErrorKind::Configuration {
            HookEvent::ConfigurationRejected
        } else {
            HookEvent::ConnectionFailed
        };
        self.fail(machine, event, ctx, error);
    }
}

async fn timed<T, F>(
    ctx: &ExecutionContext<'_>,
    provider: Provider,
    operation: &str,
    fut: F,
) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    let started = Instant::now();
    let result = fut.await;
    if let Some(metrics) = ctx.metrics {
        metrics.record_driver_operation(
            provider,
            operation,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
    }
    result
}

/// Execute `plan` against `manager`
pub async fn execute_plan(
    manager: &mut DriverManager,
    plan: &PlannedAction,
    ctx: &ExecutionContext<'_>,
) -> ReconcileOutcome {
    let machine = HookStateMachine::new();
    let mut outcome = ReconcileOutcome::unchanged(ctx.status);

    match plan {
        PlannedAction::NoOp(reason) => {
            debug!(reason, "Nothing to do");
            outcome.note = Some((*reason).to_string());
        }
        PlannedAction::WaitForTimeout(remaining) => {
            debug!(?remaining, "Quiesced, waiting for timeout");
            outcome.requeue_after = Some(*remaining);
        }
        PlannedAction::Reject(reason) => {
            outcome.note = Some(reason.clone());
            outcome.error = Some(DriverError::Configuration(reason.clone()));
        }
        PlannedAction::EnsureReady => {
            let tctx = TransitionContext::new(ctx.operation);
            let provider = manager.provider();
            match timed(ctx, provider, "connect", manager.connect()).await {
                Ok(()) => {
                    outcome.apply(&machine, HookEvent::ConnectionEstablished, &tctx);
                    outcome.status.err_msg.clear();
                    info!(%provider, "Instance ready");
                }
                Err(e) => outcome.fail_connect(&machine, &tctx, e),
            }
        }
        PlannedAction::Quiesce => quiesce(manager, ctx, &machine, &mut outcome).await,
        PlannedAction::Unquiesce { auto_resume } => {
            outcome.auto_resume = *auto_resume;
            unquiesce(manager, ctx, &machine, &mut outcome, *auto_resume).await
        }
    }

    outcome
}

async fn quiesce(
    manager: &mut DriverManager,
    ctx: &ExecutionContext<'_>,
    machine: &HookStateMachine,
    outcome: &mut ReconcileOutcome,
) {
    let tctx = TransitionContext::new(ctx.operation);
    let provider = manager.provider();

    if let Err(e) = timed(ctx, provider, "connect", manager.connect()).await {
        outcome.fail_connect(machine, &tctx, e);
        return;
    }

    // Settings captured by an earlier failed attempt are the originals
    let preserved = match ctx.status.preserved_config.clone().filter(|p| !p.is_empty()) {
        Some(existing) => Some(existing),
        None => match timed(ctx, provider, "prepare", manager.prepare()).await {
            Ok(captured) => captured,
            Err(e) => {
                outcome.fail(machine, HookEvent::QuiesceFailed, &tctx, e);
                return;
            }
        },
    };
    outcome.status.preserved_config = preserved;

    match timed(ctx, provider, "quiesce", manager.quiesce()).await {
        Ok(result) => {
            outcome.apply(machine, HookEvent::QuiesceSucceeded, &tctx);
            if outcome.status.phase == HookPhase::Quiesced {
                outcome.status.quiesced_timestamp =
                    Some(ctx.now.to_rfc3339_opts(SecondsFormat::Secs, true));
                outcome.status.result = Some(result);
                outcome.status.err_msg.clear();
                if !ctx.timeout.is_zero() {
                    outcome.requeue_after = Some(ctx.timeout);
                }
            }
        }
        Err(e) => outcome.fail(machine, HookEvent::QuiesceFailed, &tctx, e),
    }
}

async fn unquiesce(
    manager: &mut DriverManager,
    ctx: &ExecutionContext<'_>,
    machine: &HookStateMachine,
    outcome: &mut ReconcileOutcome,
    auto_resume: bool,
) {
    let mut tctx = TransitionContext::new(ctx.operation);
    if auto_resume {
        tctx = tctx.auto_resume();
    }
    let provider = manager.provider();

    if let Err(e) = timed(ctx, provider, "connect", manager.connect()).await {
        outcome.fail_connect(machine, &tctx, e);
        return;
    }

    let preserved = ctx.status.preserved_config.as_ref();
    match timed(ctx, provider, "unquiesce", manager.unquiesce(preserved)).await {
        Ok(()) => {
            outcome.apply(machine, HookEvent::UnquiesceSucceeded, &tctx);
            if outcome.status.phase == HookPhase::Unquiesced {
                outcome.status.err_msg.clear();
                outcome.status.quiesced_timestamp = None;
                outcome.status.result = None;
                outcome.status.preserved_config = None;
                if auto_resume {
                    outcome.status.expired_generation = ctx.generation;
                }
            }
        }
        Err(e) => outcome.fail(machine, HookEvent::UnquiesceFailed, &tctx, e),
    }
}
