//! Root/Administrator password lookup.

use std::sync::Arc;

use super::halt;
use crate::api::ProvisioningApi;
use crate::error::Result;
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

/// Decrypts the administrator password of the build server with the login key.
pub struct StepGetRootPassword {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
}

impl StepGetRootPassword {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>) -> Self {
        Self { api, ui }
    }

    fn fetch(&self, state: &StateBag) -> Result<String> {
        let instance_no = &state.require(keys::SERVER_INSTANCE)?.instance_no;
        let key = state.require(keys::LOGIN_KEY)?;
        Ok(self.api.get_root_password(instance_no, &key.private_key)?)
    }
}

impl Step for StepGetRootPassword {
    fn name(&self) -> &'static str {
        "get_root_password"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.ui.say("Getting root password ...");
        match self.fetch(state) {
            Ok(password) => {
                state.put(keys::ROOT_PASSWORD, password);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }
}
