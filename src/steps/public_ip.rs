//! Public address for the build server.

use std::sync::Arc;

use tracing::info;

use super::halt;
use crate::api::{ApiError, ProvisioningApi};
use crate::error::{BuilderError, Result};
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

/// Disassociate then delete. An address that is already gone counts as
/// released.
fn release_public_ip(api: &dyn ProvisioningApi, public_ip_no: &str) -> std::result::Result<(), ApiError> {
    match api.disassociate_public_ip(public_ip_no) {
        Ok(()) => {}
        Err(ApiError::NotFound { .. }) => return Ok(()),
        Err(err) => return Err(err),
    }
    match api.delete_public_ip(public_ip_no) {
        Ok(()) | Err(ApiError::NotFound { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Allocates a public address for the build server. The address becomes the
/// host the guest is reached at.
pub struct StepCreatePublicIp {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
}

impl StepCreatePublicIp {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>) -> Self {
        Self { api, ui }
    }
}

impl Step for StepCreatePublicIp {
    fn name(&self) -> &'static str {
        "create_public_ip"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.ui.say("Creating public IP ...");
        let instance_no = match state
            .require(keys::SERVER_INSTANCE)
            .map(|server| server.instance_no.clone())
        {
            Ok(instance_no) => instance_no,
            Err(err) => return halt(state, self.ui.as_ref(), err),
        };

        match self.api.create_public_ip(&instance_no) {
            Ok(ip) => {
                self.ui.message(&format!("Public IP: {}", ip.address));
                info!("Public IP {} ({}) associated", ip.public_ip_no, ip.address);
                state.put(keys::CONNECT_HOST, ip.address.clone());
                state.put(keys::PUBLIC_IP, ip);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), BuilderError::Api(err)),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<()> {
        let Some(public_ip_no) = state
            .get(keys::PUBLIC_IP)
            .map(|ip| ip.public_ip_no.clone())
        else {
            return Ok(());
        };
        self.ui
            .say(&format!("Deleting public IP {} ...", public_ip_no));
        release_public_ip(self.api.as_ref(), &public_ip_no).map_err(|err| {
            self.ui.error(&format!("Error deleting public IP: {}", err));
            BuilderError::from(err)
        })?;
        state.remove(keys::PUBLIC_IP);
        state.remove(keys::CONNECT_HOST);
        Ok(())
    }
}

/// Forward teardown of the public address.
pub struct StepDeletePublicIp {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
}

impl StepDeletePublicIp {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>) -> Self {
        Self { api, ui }
    }
}

impl Step for StepDeletePublicIp {
    fn name(&self) -> &'static str {
        "delete_public_ip"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let Some(public_ip_no) = state
            .get(keys::PUBLIC_IP)
            .map(|ip| ip.public_ip_no.clone())
        else {
            return StepAction::Continue;
        };
        self.ui
            .say(&format!("Deleting public IP {} ...", public_ip_no));

        match release_public_ip(self.api.as_ref(), &public_ip_no) {
            Ok(()) => {
                state.remove(keys::PUBLIC_IP);
                state.remove(keys::CONNECT_HOST);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err.into()),
        }
    }
}
