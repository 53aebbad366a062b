//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ncloud_imager::error::Result;
use ncloud_imager::{BuilderError, CancelToken, StateBag, StateKey, Step, StepAction};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub const OUTPUTS: StateKey<Vec<&'static str>> = StateKey::new("outputs");

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// What a scripted step does when run.
#[derive(Debug, Clone)]
pub enum Behavior {
    Continue,
    Halt,
    /// Halt without recording an error
    HaltSilently,
    /// Continue, but fail the cleanup
    FailCleanup,
    /// Cancel the given token, then continue
    CancelThenContinue(CancelToken),
}

/// Step that records its calls in a shared journal.
pub struct Scripted {
    pub name: &'static str,
    pub behavior: Behavior,
    pub journal: Journal,
}

impl Scripted {
    pub fn boxed(name: &'static str, behavior: Behavior, journal: &Journal) -> Box<dyn Step> {
        Box::new(Self {
            name,
            behavior,
            journal: journal.clone(),
        })
    }
}

impl Step for Scripted {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.journal.lock().unwrap().push(format!("run:{}", self.name));
        match &self.behavior {
            Behavior::Halt => {
                state.put_error(BuilderError::step(self.name, "scripted failure"));
                StepAction::Halt
            }
            Behavior::HaltSilently => StepAction::Halt,
            Behavior::CancelThenContinue(token) => {
                token.cancel();
                self.record_output(state);
                StepAction::Continue
            }
            Behavior::Continue | Behavior::FailCleanup => {
                self.record_output(state);
                StepAction::Continue
            }
        }
    }

    fn cleanup(&mut self, _state: &mut StateBag) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("cleanup:{}", self.name));
        match self.behavior {
            Behavior::FailCleanup => Err(BuilderError::step(self.name, "cleanup refused")),
            _ => Ok(()),
        }
    }
}

impl Scripted {
    fn record_output(&self, state: &mut StateBag) {
        let mut outputs = state.take(OUTPUTS).unwrap_or_default();
        outputs.push(self.name);
        state.put(OUTPUTS, outputs);
    }
}
