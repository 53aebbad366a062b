//! Image creation from the stopped server.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{WaitPolicy, halt, wait_until};
use crate::api::{CreateImageRequest, ProvisioningApi, ResourceStatus, ServerImage};
use crate::error::Result;
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

/// Creates the server image from the stopped build server and waits until it
/// can be used. The image is the build's output and is never rolled back.
pub struct StepCreateServerImage {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
    name: String,
    description: String,
    policy: WaitPolicy,
}

impl StepCreateServerImage {
    pub fn new(
        api: Arc<dyn ProvisioningApi>,
        ui: Arc<dyn Ui>,
        name: impl Into<String>,
        description: impl Into<String>,
        policy: WaitPolicy,
    ) -> Self {
        Self {
            api,
            ui,
            name: name.into(),
            description: description.into(),
            policy,
        }
    }

    fn create(&self, state: &StateBag) -> Result<ServerImage> {
        let instance_no = state.require(keys::SERVER_INSTANCE)?.instance_no.clone();
        let image = self.api.create_server_image(&CreateImageRequest {
            instance_no,
            name: self.name.clone(),
            description: self.description.clone(),
        })?;
        self.ui
            .message(&format!("Server image {} ({}) requested", image.name, image.image_no));

        let cancel = state.cancel_token();
        let ready = wait_until(
            &format!("server image {} to be created", image.image_no),
            &self.policy,
            Some(&cancel),
            || {
                let current = self.api.get_server_image(&image.image_no)?;
                debug!("server image {} is {}", current.image_no, current.status);
                Ok((current.status == ResourceStatus::Ready).then_some(current))
            },
        );

        ready.map_err(|err| {
            warn!("Server image {} not ready ({}), deleting it", image.image_no, err);
            if let Err(delete_err) = self.api.delete_server_image(&image.image_no) {
                self.ui.error(&format!(
                    "Error deleting incomplete server image {}: {}",
                    image.image_no, delete_err
                ));
            }
            err.into()
        })
    }
}

impl Step for StepCreateServerImage {
    fn name(&self) -> &'static str {
        "create_server_image"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.ui
            .say(&format!("Creating server image {} ...", self.name));
        match self.create(state) {
            Ok(image) => {
                info!("Server image {} ({}) created", image.name, image.image_no);
                self.ui.message(&format!("Server image: {}", image.image_no));
                state.put(keys::SERVER_IMAGE, image);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Operation, SimulatedApi};
    use crate::steps::StepStopServerInstance;
    use crate::steps::testing::{bag_with_running_server, fast_policy, simulated};
    use crate::ui::RecordingUi;

    fn stopped_server(api: &Arc<SimulatedApi>) -> StateBag {
        let mut state = bag_with_running_server(api);
        StepStopServerInstance::new(api.clone(), Arc::new(RecordingUi::new()), fast_policy())
            .run(&mut state);
        state
    }

    #[test]
    fn test_image_is_created_and_published() {
        let api = simulated();
        let mut state = stopped_server(&api);
        let mut step = StepCreateServerImage::new(
            api.clone(),
            Arc::new(RecordingUi::new()),
            "golden-image",
            "built by test",
            fast_policy(),
        );

        assert_eq!(step.run(&mut state), StepAction::Continue);
        let image = state.get(keys::SERVER_IMAGE).unwrap();
        assert_eq!(image.name, "golden-image");
        assert_eq!(image.status, ResourceStatus::Ready);

        step.cleanup(&mut state).unwrap();
        assert_eq!(api.live_resources().images.len(), 1);
    }

    #[test]
    fn test_running_server_is_rejected() {
        let api = simulated();
        let mut state = bag_with_running_server(&api);

        let action = StepCreateServerImage::new(
            api.clone(),
            Arc::new(RecordingUi::new()),
            "golden-image",
            "",
            fast_policy(),
        )
        .run(&mut state);

        assert_eq!(action, StepAction::Halt);
        assert!(api.live_resources().images.is_empty());
    }

    #[test]
    fn test_failed_wait_deletes_incomplete_image() {
        let api = simulated();
        let mut state = stopped_server(&api);
        api.fail_on(Operation::GetServerImage, "describe failed");

        let action = StepCreateServerImage::new(
            api.clone(),
            Arc::new(RecordingUi::new()),
            "golden-image",
            "",
            fast_policy(),
        )
        .run(&mut state);

        assert_eq!(action, StepAction::Halt);
        assert!(!state.contains(keys::SERVER_IMAGE));
        assert!(api.live_resources().images.is_empty());
    }
}
