//! Finite state machine for the AppHook lifecycle
//!
//! Phases only change through [`HookStateMachine::transition`]. Deciding what
//! to do on a reconcile pass is a separate pure step, [`plan_action`], so the
//! timeout and idempotence rules can be tested without a cluster or a
//! database.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crd::{HookPhase, Operation};

/// Outcomes of driver calls that move the phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// The instance answered and is in a supported state
    ConnectionEstablished,
    /// The instance could not be reached
    ConnectionFailed,
    /// The spec or credential cannot be used
    ConfigurationRejected,
    QuiesceSucceeded,
    QuiesceFailed,
    UnquiesceSucceeded,
    UnquiesceFailed,
}

impl HookEvent {
    pub const ALL: [HookEvent; 7] = [
        HookEvent::ConnectionEstablished,
        HookEvent::ConnectionFailed,
        HookEvent::ConfigurationRejected,
        HookEvent::QuiesceSucceeded,
        HookEvent::QuiesceFailed,
        HookEvent::UnquiesceSucceeded,
        HookEvent::UnquiesceFailed,
    ];

    /// Whether the event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            HookEvent::ConnectionFailed
                | HookEvent::ConfigurationRejected
                | HookEvent::QuiesceFailed
                | HookEvent::UnquiesceFailed
        )
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookEvent::ConnectionEstablished => write!(f, "ConnectionEstablished"),
            HookEvent::ConnectionFailed => write!(f, "ConnectionFailed"),
            HookEvent::ConfigurationRejected => write!(f, "ConfigurationRejected"),
            HookEvent::QuiesceSucceeded => write!(f, "QuiesceSucceeded"),
            HookEvent::QuiesceFailed => write!(f, "QuiesceFailed"),
            HookEvent::UnquiesceSucceeded => write!(f, "UnquiesceSucceeded"),
            HookEvent::UnquiesceFailed => write!(f, "UnquiesceFailed"),
        }
    }
}

/// Information available to transition guards
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Operation requested in the spec
    pub operation: Operation,
    /// Unquiesce was triggered by the timeout rather than the spec
    pub auto_resume: bool,
}

impl TransitionContext {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            auto_resume: false,
        }
    }

    pub fn auto_resume(mut self) -> Self {
        self.auto_resume = true;
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: HookPhase,
    pub to: HookPhase,
    pub event: HookEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: HookPhase,
        to: HookPhase,
        event: HookEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq)]
pub enum TransitionResult {
    Success {
        from: HookPhase,
        to: HookPhase,
        event: HookEvent,
        description: &'static str,
    },
    /// No transition for this event from the current phase
    InvalidTransition {
        current: HookPhase,
        event: HookEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: HookPhase,
        to: HookPhase,
        event: HookEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after the attempt; unchanged unless the transition succeeded
    pub fn resulting_phase(&self, current: HookPhase) -> HookPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

/// Transition table for AppHook phases
pub struct HookStateMachine {
    transitions: Vec<Transition>,
}

impl Default for HookStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HookStateMachine {
    pub fn new() -> Self {
        let mut transitions = Vec::new();

        for from in HookPhase::ALL {
            // Failures to reach the instance are valid from anywhere
            transitions.push(Transition::new(
                from,
                HookPhase::NotReady,
                HookEvent::ConnectionFailed,
                "Instance unreachable",
            ));
            transitions.push(Transition::new(
                from,
                HookPhase::NotReady,
                HookEvent::ConfigurationRejected,
                "Configuration rejected",
            ));

            // A quiesced instance stays quiesced until it is resumed
            if from != HookPhase::Quiesced {
                transitions.push(Transition::new(
                    from,
                    HookPhase::Ready,
                    HookEvent::ConnectionEstablished,
                    "Instance reachable and ready",
                ));
                transitions.push(Transition::new(
                    from,
                    HookPhase::Quiesced,
                    HookEvent::QuiesceSucceeded,
                    "Instance quiesced",
                ));
                transitions.push(Transition::new(
                    from,
                    HookPhase::QuiesceInProgress,
                    HookEvent::QuiesceFailed,
                    "Quiesce failed, will retry",
                ));
            }

            if from != HookPhase::Unquiesced {
                transitions.push(Transition::new(
                    from,
                    HookPhase::Unquiesced,
                    HookEvent::UnquiesceSucceeded,
                    "Instance unquiesced",
                ));
                transitions.push(Transition::new(
                    from,
                    HookPhase::UnquiesceInProgress,
                    HookEvent::UnquiesceFailed,
                    "Unquiesce failed, will retry",
                ));
            }
        }

        Self { transitions }
    }

    pub fn transition(
        &self,
        current: &HookPhase,
        event: HookEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &HookPhase, event: &HookEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    pub fn valid_events(&self, state: &HookPhase) -> Vec<&HookEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            HookEvent::QuiesceSucceeded | HookEvent::QuiesceFailed
                if ctx.operation != Operation::Quiesce =>
            {
                Some(format!(
                    "quiesce outcome while operation is '{}'",
                    ctx.operation
                ))
            }
            HookEvent::UnquiesceSucceeded | HookEvent::UnquiesceFailed
                if ctx.operation != Operation::Unquiesce && !ctx.auto_resume =>
            {
                Some(format!(
                    "unquiesce outcome while operation is '{}'",
                    ctx.operation
                ))
            }
            _ => None,
        }
    }
}

/// What one reconcile pass should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Check the instance and mark it Ready
    EnsureReady,
    Quiesce,
    /// `auto_resume` is set when the quiesce timeout expired
    Unquiesce { auto_resume: bool },
    /// Quiesced with time left; check again after the remaining duration
    WaitForTimeout(Duration),
    NoOp(&'static str),
    /// The requested operation is not recognised
    Reject(String),
}

/// Inputs to [`plan_action`]
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    /// Raw `spec.operationType`
    pub operation: &'a str,
    pub phase: HookPhase,
    /// Zero disables the automatic resume
    pub timeout: Duration,
    /// RFC 3339 time the instance entered Quiesced
    pub quiesced_at: Option<&'a str>,
    pub generation: Option<i64>,
    pub expired_generation: Option<i64>,
    pub now: DateTime<Utc>,
}

/// Decide the single action for this pass.
///
/// The timeout rule is evaluated first: a Quiesced instance whose timeout
/// elapsed (or whose timestamp is missing) is resumed unless the spec
/// already asks for unquiesce. The rule keeps applying while a quiesce
/// timestamp is recorded, so a resume that failed to connect is retried
/// instead of re-quiescing.
pub fn plan_action(input: &PlanInput<'_>) -> PlannedAction {
    let parsed = input.operation.parse::<Operation>();

    let quiesce_recorded = input.phase == HookPhase::Quiesced || input.quiesced_at.is_some();
    if quiesce_recorded && !input.timeout.is_zero() && parsed != Ok(Operation::Unquiesce) {
        let quiesced_at = input
            .quiesced_at
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        return match quiesced_at {
            Some(at) => {
                let elapsed = (input.now - at).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= input.timeout {
                    PlannedAction::Unquiesce { auto_resume: true }
                } else {
                    PlannedAction::WaitForTimeout(input.timeout - elapsed)
                }
            }
            None => PlannedAction::Unquiesce { auto_resume: true },
        };
    }

    let operation = match parsed {
        Ok(op) => op,
        Err(e) => return PlannedAction::Reject(e.to_string()),
    };

    match operation {
        Operation::None => match input.phase {
            HookPhase::Quiesced => PlannedAction::NoOp("instance is quiesced"),
            HookPhase::Ready => PlannedAction::NoOp("instance is ready"),
            _ => PlannedAction::EnsureReady,
        },
        Operation::Quiesce => {
            if input.phase == HookPhase::Quiesced {
                PlannedAction::NoOp("instance is already quiesced")
            } else if input.generation.is_some() && input.generation == input.expired_generation {
                PlannedAction::NoOp("quiesce request expired, waiting for a spec change")
            } else {
                PlannedAction::Quiesce
            }
        }
        Operation::Unquiesce => {
            if input.phase == HookPhase::Unquiesced {
                PlannedAction::NoOp("instance is already unquiesced")
            } else {
                PlannedAction::Unquiesce { auto_resume: false }
            }
        }
    }
}
