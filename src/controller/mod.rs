pub mod context;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use context::{Context, FIELD_MANAGER};
pub use credentials::{credentials_from_secret, fetch_credentials, secret_namespace};
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use executor::{ExecutionContext, ReconcileOutcome, execute_plan};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use state_machine::{
    HookEvent, HookStateMachine, PlanInput, PlannedAction, TransitionContext, TransitionResult,
    plan_action,
};
pub use status::{StatusManager, status_patch};
pub use validation::validate_spec;
