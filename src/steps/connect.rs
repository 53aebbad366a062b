//! Guest connectivity: wait for SSH or WinRM to answer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{WaitPolicy, halt, wait_until};
use crate::api::ApiError;
use crate::comm::{ConnectTarget, GuestConnector, GuestOs, resolve_target};
use crate::config::CommConfig;
use crate::error::{BuilderError, Result};
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

/// Waits until the guest accepts connections over the protocol of its OS
/// family, then publishes the resolved target.
pub struct StepConnect {
    ui: Arc<dyn Ui>,
    connector: Arc<dyn GuestConnector>,
    comm: CommConfig,
    os: GuestOs,
    interval: Duration,
}

impl StepConnect {
    pub fn new(
        ui: Arc<dyn Ui>,
        connector: Arc<dyn GuestConnector>,
        comm: CommConfig,
        os: GuestOs,
        interval: Duration,
    ) -> Self {
        Self {
            ui,
            connector,
            comm,
            os,
            interval,
        }
    }

    fn connect(&self, state: &StateBag) -> Result<ConnectTarget> {
        let target = resolve_target(state, &self.comm, self.os)?;
        self.ui
            .message(&format!("Waiting for {} to become available ...", target));

        let policy = WaitPolicy::new(
            Duration::from_secs(self.comm.connect_timeout_secs),
            self.interval,
        );
        let cancel = state.cancel_token();
        let reached = wait_until(&target.to_string(), &policy, Some(&cancel), || {
            match self.connector.probe(&target) {
                Ok(()) => Ok(Some(())),
                Err(e) => {
                    debug!("{} not reachable yet: {}", target, e);
                    Ok(None)
                }
            }
        });

        match reached {
            Ok(()) => Ok(target),
            Err(ApiError::Cancelled) => Err(BuilderError::Cancelled),
            Err(err) => Err(BuilderError::step(self.name(), err.to_string())),
        }
    }
}

impl Step for StepConnect {
    fn name(&self) -> &'static str {
        match self.os {
            GuestOs::Linux => "connect_ssh",
            GuestOs::Windows => "connect_winrm",
        }
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.ui
            .say(&format!("Connecting to the guest over {} ...", self.os.protocol()));
        match self.connect(state) {
            Ok(target) => {
                info!("Connected to {}", target);
                state.put(keys::CONNECT_TARGET, target);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }
}
