use std::sync::Arc;

use super::halt;
use crate::hook::ProvisionHook;
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

/// Hands the connected guest to the provisioning hook.
pub struct StepProvision {
    ui: Arc<dyn Ui>,
    hook: Arc<dyn ProvisionHook>,
}

impl StepProvision {
    pub fn new(ui: Arc<dyn Ui>, hook: Arc<dyn ProvisionHook>) -> Self {
        Self { ui, hook }
    }
}

impl Step for StepProvision {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let target = match state.require(keys::CONNECT_TARGET).cloned() {
            Ok(target) => target,
            Err(err) => return halt(state, self.ui.as_ref(), err),
        };
        self.ui.say("Provisioning ...");
        match self.hook.provision(&target, self.ui.as_ref()) {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }
}
