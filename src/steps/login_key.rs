//! Login key lifecycle. The key authenticates SSH and decrypts the root
//! password.

use std::sync::Arc;

use tracing::{info, warn};

use super::{halt, unique_suffix};
use crate::api::{ApiError, ProvisioningApi};
use crate::error::{BuilderError, Result};
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

/// Creates the login key the server instance is launched with.
pub struct StepCreateLoginKey {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
}

impl StepCreateLoginKey {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>) -> Self {
        Self { api, ui }
    }
}

impl Step for StepCreateLoginKey {
    fn name(&self) -> &'static str {
        "create_login_key"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let key_name = format!("packer-{}", unique_suffix());
        self.ui.say(&format!("Creating login key {} ...", key_name));

        match self.api.create_login_key(&key_name) {
            Ok(key) => {
                info!("Login key {} created", key.key_name);
                state.put(keys::LOGIN_KEY, key);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), BuilderError::Api(err)),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<()> {
        let Some(key) = state.get(keys::LOGIN_KEY).cloned() else {
            return Ok(());
        };
        self.ui.say(&format!("Deleting login key {} ...", key.key_name));
        match self.api.delete_login_key(&key.key_name) {
            Ok(()) | Err(ApiError::NotFound { .. }) => {
                state.remove(keys::LOGIN_KEY);
                Ok(())
            }
            Err(err) => {
                self.ui.error(&format!("Error deleting login key: {}", err));
                Err(err.into())
            }
        }
    }
}

/// Forward teardown of the login key once the image exists.
pub struct StepDeleteLoginKey {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
}

impl StepDeleteLoginKey {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>) -> Self {
        Self { api, ui }
    }
}

impl Step for StepDeleteLoginKey {
    fn name(&self) -> &'static str {
        "delete_login_key"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let Some(key_name) = state.get(keys::LOGIN_KEY).map(|k| k.key_name.clone()) else {
            warn!("No login key in state, nothing to delete");
            return StepAction::Continue;
        };
        self.ui.say(&format!("Deleting login key {} ...", key_name));

        match self.api.delete_login_key(&key_name) {
            Ok(()) | Err(ApiError::NotFound { .. }) => {
                state.remove(keys::LOGIN_KEY);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), BuilderError::Api(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Operation;
    use crate::steps::testing::simulated;
    use crate::ui::RecordingUi;

    #[test]
    fn test_create_then_cleanup_releases_key() {
        let api = simulated();
        let ui = Arc::new(RecordingUi::new());
        let mut state = StateBag::new();
        let mut step = StepCreateLoginKey::new(api.clone(), ui);

        assert_eq!(step.run(&mut state), StepAction::Continue);
        assert_eq!(api.live_resources().login_keys.len(), 1);
        assert!(state.contains(keys::LOGIN_KEY));

        step.cleanup(&mut state).unwrap();
        step.cleanup(&mut state).unwrap();
        assert!(api.live_resources().login_keys.is_empty());
        assert_eq!(api.call_count(Operation::DeleteLoginKey), 1);
    }

    #[test]
    fn test_create_failure_halts() {
        let api = simulated();
        api.fail_on(Operation::CreateLoginKey, "quota exceeded");
        let ui = Arc::new(RecordingUi::new());
        let mut state = StateBag::new();

        let action = StepCreateLoginKey::new(api, ui.clone()).run(&mut state);

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuilderError::Api(_))));
        assert!(ui.errors()[0].contains("quota exceeded"));
    }

    #[test]
    fn test_forward_delete_removes_state() {
        let api = simulated();
        let ui = Arc::new(RecordingUi::new());
        let mut state = StateBag::new();
        let mut create = StepCreateLoginKey::new(api.clone(), ui.clone());
        create.run(&mut state);

        assert_eq!(
            StepDeleteLoginKey::new(api.clone(), ui).run(&mut state),
            StepAction::Continue
        );
        assert!(!state.contains(keys::LOGIN_KEY));

        create.cleanup(&mut state).unwrap();
        assert_eq!(api.call_count(Operation::DeleteLoginKey), 1);
    }

    #[test]
    fn test_cleanup_failure_is_returned() {
        let api = simulated();
        let ui = Arc::new(RecordingUi::new());
        let mut state = StateBag::new();
        let mut step = StepCreateLoginKey::new(api.clone(), ui);
        step.run(&mut state);
        api.fail_on(Operation::DeleteLoginKey, "api down");

        assert!(step.cleanup(&mut state).is_err());
        assert!(state.contains(keys::LOGIN_KEY));
    }
}
