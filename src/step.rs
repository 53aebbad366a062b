//! The unit of orchestrated work.
//!
//! A step exposes a forward action (`run`) and a rollback action (`cleanup`).
//! The runner owns sequencing; steps only report what happened.
//!
//! # Contract
//!
//! - `run` reads its inputs from the [`StateBag`], writes its outputs back, and
//!   returns a [`StepAction`]. A step that halts records its error in the bag
//!   (see [`crate::steps::halt`]).
//! - `cleanup` is invoked only on steps whose `run` returned `Continue`, in
//!   reverse order, when a later step halts or the run is cancelled. It must be
//!   idempotent and must treat missing state as "nothing to undo".

use std::fmt;

use crate::error::Result;
use crate::state::StateBag;

/// Sequencing directive returned by [`Step::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// A fatal error occurred: stop forward progress and roll back.
    Halt,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

/// A step in the build sequence.
pub trait Step: Send {
    /// Stable name used in logs and run reports.
    fn name(&self) -> &'static str;

    /// Perform the step's forward work.
    fn run(&mut self, state: &mut StateBag) -> StepAction;

    /// Undo whatever `run` created. Default: nothing to undo.
    fn cleanup(&mut self, state: &mut StateBag) -> Result<()> {
        let _ = state;
        Ok(())
    }
}

impl<S: Step + ?Sized> Step for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        (**self).run(state)
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<()> {
        (**self).cleanup(state)
    }
}
