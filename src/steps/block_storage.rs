//! Extra block storage for the build server: attach and wait, delete on
//! teardown.

use std::sync::Arc;

use tracing::{debug, info};

use super::{WaitPolicy, halt, unique_suffix, wait_until};
use crate::api::{ApiError, BlockStorage, ProvisioningApi, ResourceStatus};
use crate::error::{BuilderError, Result};
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

fn delete_storage(api: &dyn ProvisioningApi, storage_no: &str) -> std::result::Result<(), ApiError> {
    match api.delete_block_storage(storage_no) {
        Ok(()) | Err(ApiError::NotFound { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Attaches additional block storage to the build server. Does nothing when
/// no size is configured.
pub struct StepCreateBlockStorage {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
    size_gb: Option<u32>,
    policy: WaitPolicy,
}

impl StepCreateBlockStorage {
    pub fn new(
        api: Arc<dyn ProvisioningApi>,
        ui: Arc<dyn Ui>,
        size_gb: Option<u32>,
        policy: WaitPolicy,
    ) -> Self {
        Self {
            api,
            ui,
            size_gb,
            policy,
        }
    }

    fn create(&self, state: &StateBag, size_gb: u32) -> Result<BlockStorage> {
        let instance_no = state.require(keys::SERVER_INSTANCE)?.instance_no.clone();
        let name = format!("packer-{}", unique_suffix());
        let storage = self
            .api
            .create_block_storage(&instance_no, size_gb, &name)?;
        self.ui.message(&format!(
            "Block storage {} ({} GB) created",
            storage.storage_no, size_gb
        ));

        let cancel = state.cancel_token();
        let attached = wait_until(
            &format!("block storage {} to attach", storage.storage_no),
            &self.policy,
            Some(&cancel),
            || {
                let current = self.api.get_block_storage(&storage.storage_no)?;
                debug!("block storage {} is {}", current.storage_no, current.status);
                Ok((current.status == ResourceStatus::Attached).then_some(current))
            },
        );

        match attached {
            Ok(storage) => Ok(storage),
            Err(err) => {
                if let Err(delete_err) = delete_storage(self.api.as_ref(), &storage.storage_no) {
                    self.ui.error(&format!(
                        "Error deleting block storage {}: {}",
                        storage.storage_no, delete_err
                    ));
                }
                Err(err.into())
            }
        }
    }
}

impl Step for StepCreateBlockStorage {
    fn name(&self) -> &'static str {
        "create_block_storage"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let Some(size_gb) = self.size_gb else {
            return StepAction::Continue;
        };
        self.ui.say("Creating block storage ...");

        match self.create(state, size_gb) {
            Ok(storage) => {
                info!("Block storage {} attached", storage.storage_no);
                state.put(keys::BLOCK_STORAGE, storage);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<()> {
        let Some(storage_no) = state
            .get(keys::BLOCK_STORAGE)
            .map(|s| s.storage_no.clone())
        else {
            return Ok(());
        };
        self.ui
            .say(&format!("Deleting block storage {} ...", storage_no));
        delete_storage(self.api.as_ref(), &storage_no).map_err(|err| {
            self.ui.error(&format!("Error deleting block storage: {}", err));
            BuilderError::from(err)
        })?;
        state.remove(keys::BLOCK_STORAGE);
        Ok(())
    }
}

/// Forward teardown of the additional block storage.
pub struct StepDeleteBlockStorage {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
}

impl StepDeleteBlockStorage {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>) -> Self {
        Self { api, ui }
    }
}

impl Step for StepDeleteBlockStorage {
    fn name(&self) -> &'static str {
        "delete_block_storage"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let Some(storage_no) = state
            .get(keys::BLOCK_STORAGE)
            .map(|s| s.storage_no.clone())
        else {
            return StepAction::Continue;
        };
        self.ui
            .say(&format!("Deleting block storage {} ...", storage_no));

        match delete_storage(self.api.as_ref(), &storage_no) {
            Ok(()) => {
                state.remove(keys::BLOCK_STORAGE);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err.into()),
        }
    }
}
