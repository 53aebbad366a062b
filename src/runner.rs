//! Sequential step runner with reverse-order rollback.
//!
//! # Phase Flow
//!
//! ```text
//! Idle
//!   ↓
//! Running ──────────────┬──────────────┐
//!   ↓                   ↓              ↓
//! Completed         Cancelling    ErrorCleanup
//!   ↓                   ↓              ↓
//! Done ←────────────────┴──────────────┘
//! ```
//!
//! Cancellation is observed only at step boundaries: before each step starts and
//! once more after the last step returns. A step that is already executing is
//! never preempted by the runner; long-running steps watch the bag's cancel token
//! themselves.
//!
//! On `Cancelling` or `ErrorCleanup`, every step whose `run` returned `Continue`
//! is cleaned up, most recently started first. A failing cleanup is logged and
//! recorded in the report; the sweep always continues.

use std::fmt;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::BuilderError;
use crate::state::{CancelToken, StateBag};
use crate::step::{Step, StepAction};

/// Phase of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// Constructed, not yet run
    Idle,
    /// Executing forward steps
    Running,
    /// Every step returned `Continue`
    Completed,
    /// Cancellation observed; rolling back
    Cancelling,
    /// A step halted or the error slot was set; rolling back
    ErrorCleanup,
    /// Run finished (terminal)
    Done,
}

impl RunPhase {
    /// Returns true if moving from `self` to `to` is a legal transition
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Cancelling)
                | (Self::Running, Self::ErrorCleanup)
                | (Self::Completed, Self::Done)
                | (Self::Cancelling, Self::Done)
                | (Self::ErrorCleanup, Self::Done)
        )
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelling => "cancelling",
            Self::ErrorCleanup => "cleaning up after error",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors raised when the runner is driven out of order
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("Runner cannot move from {from} to {to}")]
    Invalid { from: RunPhase, to: RunPhase },
}

/// Externally observable result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All steps continued; no error recorded
    Completed,
    /// A step halted; the error slot holds the cause
    Halted,
    /// Cancellation was observed at a step boundary
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Halted => write!(f, "halted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened during one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Steps whose `run` returned `Continue`, in execution order
    pub started: Vec<&'static str>,
    /// Steps whose `cleanup` was invoked, in invocation order
    pub cleaned_up: Vec<&'static str>,
    /// Cleanup failures, in invocation order
    pub cleanup_failures: Vec<BuilderError>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            outcome: RunOutcome::Completed,
            started: Vec::new(),
            cleaned_up: Vec::new(),
            cleanup_failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Callback invoked after every step that returns `Continue`.
///
/// Used for step-by-step debugging; the callback may request cancellation
/// through the bag's cancel token.
pub type BoundaryHook = Box<dyn FnMut(&'static str, &StateBag) + Send>;

/// Drives an ordered list of steps against one state bag.
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
    phase: RunPhase,
    cancel: CancelToken,
    /// Indices of steps whose `run` returned `Continue`
    started: Vec<usize>,
    boundary_hook: Option<BoundaryHook>,
}

impl Runner {
    /// Create a runner with its own cancel token.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self::with_cancel_token(steps, CancelToken::new())
    }

    /// Create a runner observing an existing cancel token.
    pub fn with_cancel_token(steps: Vec<Box<dyn Step>>, cancel: CancelToken) -> Self {
        Self {
            steps,
            phase: RunPhase::Idle,
            cancel,
            started: Vec::new(),
            boundary_hook: None,
        }
    }

    /// Install a callback invoked after each step that continues.
    pub fn with_boundary_hook(mut self, hook: BoundaryHook) -> Self {
        self.boundary_hook = Some(hook);
        self
    }

    /// A fresh state bag sharing this runner's cancel token, so steps polling
    /// inside `run` observe `cancel()` too.
    pub fn new_state(&self) -> StateBag {
        StateBag::with_cancel_token(self.cancel.clone())
    }

    /// Request cancellation. Fire-and-forget, idempotent, callable from any
    /// thread through [`Runner::cancel_handle`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[inline]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    fn transition(&mut self, to: RunPhase) -> Result<(), RunTransitionError> {
        if !self.phase.can_transition_to(to) {
            return Err(RunTransitionError::Invalid {
                from: self.phase,
                to,
            });
        }
        debug!("runner: {} -> {}", self.phase, to);
        self.phase = to;
        Ok(())
    }

    fn cancel_requested(&self, state: &StateBag) -> bool {
        self.cancel.is_cancelled() || state.is_cancelled()
    }

    /// Execute every step in order and roll back on failure or cancellation.
    ///
    /// # Errors
    ///
    /// `RunTransitionError` if the runner has already been run. Step failures
    /// are not errors here: they are reported through the outcome and the bag's
    /// error slot.
    pub fn run(&mut self, state: &mut StateBag) -> Result<RunReport, RunTransitionError> {
        self.transition(RunPhase::Running)?;
        info!("Running {} step(s)", self.steps.len());

        let mut report = RunReport::new();
        let mut next = RunPhase::Completed;

        for index in 0..self.steps.len() {
            if self.cancel_requested(state) {
                info!("Cancellation observed before step {}", self.steps[index].name());
                next = RunPhase::Cancelling;
                break;
            }
            if state.has_error() {
                next = RunPhase::ErrorCleanup;
                break;
            }

            let total = self.steps.len();
            let (name, action) = {
                let step = &mut self.steps[index];
                let name = step.name();
                debug!("step {}/{}: {}", index + 1, total, name);
                (name, step.run(state))
            };

            match action {
                StepAction::Continue => {
                    self.started.push(index);
                    report.started.push(name);
                    if let Some(hook) = self.boundary_hook.as_mut() {
                        hook(name, &*state);
                    }
                }
                StepAction::Halt => {
                    if !state.has_error() {
                        state.put_error(BuilderError::step(
                            name,
                            "step halted without reporting an error",
                        ));
                    }
                    if let Some(err) = state.error() {
                        error!("Step {} halted: {}", name, err);
                    }
                    next = if self.cancel_requested(state) {
                        RunPhase::Cancelling
                    } else {
                        RunPhase::ErrorCleanup
                    };
                    break;
                }
            }
        }

        if next == RunPhase::Completed {
            if self.cancel_requested(state) {
                info!("Cancellation observed after the last step");
                next = RunPhase::Cancelling;
            } else if state.has_error() {
                next = RunPhase::ErrorCleanup;
            }
        }

        self.transition(next)?;
        report.outcome = match next {
            RunPhase::Cancelling => {
                self.rollback(state, &mut report);
                RunOutcome::Cancelled
            }
            RunPhase::ErrorCleanup => {
                self.rollback(state, &mut report);
                RunOutcome::Halted
            }
            _ => RunOutcome::Completed,
        };
        self.transition(RunPhase::Done)?;

        info!(
            "Run {}: {} step(s) started, {} cleaned up",
            report.outcome,
            report.started.len(),
            report.cleaned_up.len()
        );
        Ok(report)
    }

    fn rollback(&mut self, state: &mut StateBag, report: &mut RunReport) {
        let started = std::mem::take(&mut self.started);
        for &index in started.iter().rev() {
            let step = &mut self.steps[index];
            let name = step.name();
            debug!("cleanup: {}", name);
            let result = step.cleanup(state);
            report.cleaned_up.push(name);
            if let Err(err) = result {
                warn!("Cleanup of {} failed: {}", name, err);
                report
                    .cleanup_failures
                    .push(BuilderError::cleanup(name, err.to_string()));
            }
        }
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("steps", &self.step_names())
            .field("phase", &self.phase)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
