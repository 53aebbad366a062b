//! Server instance lifecycle: create and wait for RUN, stop and wait for
//! NSTOP, terminate and wait until it is gone.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{WaitPolicy, halt, wait_until};
use crate::api::{ApiError, CreateServerRequest, ProvisioningApi, ServerInstance, ServerStatus};
use crate::config::Config;
use crate::error::{BuilderError, Result};
use crate::state::{CancelToken, StateBag, keys};
use crate::step::{Step, StepAction};
use crate::ui::Ui;

/// Wait until the instance reports `status`.
fn wait_for_status(
    api: &dyn ProvisioningApi,
    instance_no: &str,
    status: ServerStatus,
    policy: &WaitPolicy,
    cancel: Option<&CancelToken>,
) -> std::result::Result<ServerInstance, ApiError> {
    let what = format!("server instance {} to reach {}", instance_no, status);
    wait_until(&what, policy, cancel, || {
        let server = api.get_server_instance(instance_no)?;
        debug!("server instance {} is {}", instance_no, server.status);
        Ok((server.status == status).then_some(server))
    })
}

/// Stop the instance if it runs, terminate it and wait until it disappears.
///
/// Never observes cancellation: it runs on rollback paths.
fn release_server(
    api: &dyn ProvisioningApi,
    ui: &dyn Ui,
    instance_no: &str,
    policy: &WaitPolicy,
) -> std::result::Result<(), ApiError> {
    let status = match api.get_server_instance(instance_no) {
        Ok(server) => server.status,
        Err(ApiError::NotFound { .. }) => return Ok(()),
        Err(err) => return Err(err),
    };

    if status == ServerStatus::Running {
        ui.message(&format!("Stopping server instance {} ...", instance_no));
        api.stop_server_instance(instance_no)?;
        wait_for_status(api, instance_no, ServerStatus::Stopped, policy, None)?;
    }

    if status != ServerStatus::Terminating {
        ui.message(&format!("Terminating server instance {} ...", instance_no));
        match api.terminate_server_instance(instance_no) {
            Ok(()) | Err(ApiError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
    }

    wait_until(
        &format!("server instance {} to be terminated", instance_no),
        policy,
        None,
        || match api.get_server_instance(instance_no) {
            Ok(_) => Ok(None),
            Err(ApiError::NotFound { .. }) => Ok(Some(())),
            Err(err) => Err(err),
        },
    )?;
    info!("Server instance {} terminated", instance_no);
    Ok(())
}

/// Launches the build server and waits until it runs.
pub struct StepCreateServerInstance {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
    template: CreateServerRequest,
    policy: WaitPolicy,
}

impl StepCreateServerInstance {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>, config: &Config) -> Self {
        let template = CreateServerRequest {
            server_image_product_code: config.server_image_product_code.clone(),
            member_server_image_no: config.member_server_image_no.clone(),
            server_product_code: config.server_product_code.clone(),
            login_key_name: String::new(),
            user_data: config.user_data.clone(),
            access_control_group_configuration_no: config
                .access_control_group_configuration_no
                .clone(),
            region: config.region.clone(),
        };
        Self {
            api,
            ui,
            template,
            policy: WaitPolicy::new(config.state_timeout(), config.poll_interval()),
        }
    }

    fn create(&self, state: &StateBag) -> Result<ServerInstance> {
        let key = state.require(keys::LOGIN_KEY)?;
        let request = CreateServerRequest {
            login_key_name: key.key_name.clone(),
            ..self.template.clone()
        };

        let server = self.api.create_server_instance(&request)?;
        self.ui
            .message(&format!("Server instance {} created", server.instance_no));

        let cancel = state.cancel_token();
        match wait_for_status(
            self.api.as_ref(),
            &server.instance_no,
            ServerStatus::Running,
            &self.policy,
            Some(&cancel),
        ) {
            Ok(running) => Ok(running),
            Err(err) => {
                warn!(
                    "Server instance {} did not reach RUN ({}), releasing it",
                    server.instance_no, err
                );
                if let Err(release_err) = release_server(
                    self.api.as_ref(),
                    self.ui.as_ref(),
                    &server.instance_no,
                    &self.policy,
                ) {
                    self.ui.error(&format!(
                        "Error releasing server instance {}: {}",
                        server.instance_no, release_err
                    ));
                }
                Err(err.into())
            }
        }
    }
}

impl Step for StepCreateServerInstance {
    fn name(&self) -> &'static str {
        "create_server_instance"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.ui.say("Creating server instance ...");
        match self.create(state) {
            Ok(server) => {
                info!("Server instance {} is running", server.instance_no);
                state.put(keys::SERVER_INSTANCE, server);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<()> {
        let Some(instance_no) = state
            .get(keys::SERVER_INSTANCE)
            .map(|s| s.instance_no.clone())
        else {
            return Ok(());
        };
        self.ui
            .say(&format!("Releasing server instance {} ...", instance_no));
        release_server(
            self.api.as_ref(),
            self.ui.as_ref(),
            &instance_no,
            &self.policy,
        )
        .map_err(|err| {
            self.ui
                .error(&format!("Error releasing server instance: {}", err));
            BuilderError::from(err)
        })?;
        state.remove(keys::SERVER_INSTANCE);
        Ok(())
    }
}

/// Stops the server so an image can be taken.
pub struct StepStopServerInstance {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
    policy: WaitPolicy,
}

impl StepStopServerInstance {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>, policy: WaitPolicy) -> Self {
        Self { api, ui, policy }
    }

    fn stop(&self, state: &StateBag) -> Result<ServerInstance> {
        let instance_no = state.require(keys::SERVER_INSTANCE)?.instance_no.clone();
        self.api.stop_server_instance(&instance_no)?;
        let cancel = state.cancel_token();
        let stopped = wait_for_status(
            self.api.as_ref(),
            &instance_no,
            ServerStatus::Stopped,
            &self.policy,
            Some(&cancel),
        )?;
        Ok(stopped)
    }
}

impl Step for StepStopServerInstance {
    fn name(&self) -> &'static str {
        "stop_server_instance"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        self.ui.say("Stopping server instance ...");
        match self.stop(state) {
            Ok(server) => {
                state.put(keys::SERVER_INSTANCE, server);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err),
        }
    }
}

/// Forward teardown of the build server once the image exists.
pub struct StepTerminateServerInstance {
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
    policy: WaitPolicy,
}

impl StepTerminateServerInstance {
    pub fn new(api: Arc<dyn ProvisioningApi>, ui: Arc<dyn Ui>, policy: WaitPolicy) -> Self {
        Self { api, ui, policy }
    }
}

impl Step for StepTerminateServerInstance {
    fn name(&self) -> &'static str {
        "terminate_server_instance"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let Some(instance_no) = state
            .get(keys::SERVER_INSTANCE)
            .map(|s| s.instance_no.clone())
        else {
            warn!("No server instance in state, nothing to terminate");
            return StepAction::Continue;
        };
        self.ui
            .say(&format!("Terminating server instance {} ...", instance_no));

        match release_server(
            self.api.as_ref(),
            self.ui.as_ref(),
            &instance_no,
            &self.policy,
        ) {
            Ok(()) => {
                state.remove(keys::SERVER_INSTANCE);
                StepAction::Continue
            }
            Err(err) => halt(state, self.ui.as_ref(), err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Operation, SimulatedApi};
    use crate::steps::testing::{bag_with_running_server, fast_policy, simulated};
    use crate::ui::RecordingUi;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            server_image_product_code: Some("SPSW0LINUX000046".to_string()),
            server_product_code: "SPSVRSSD00000003".to_string(),
            state_timeout_secs: 1,
            poll_interval_ms: 1,
            ..Config::default()
        }
    }

    fn bag_with_key(api: &SimulatedApi) -> StateBag {
        let mut state = StateBag::new();
        state.put(keys::LOGIN_KEY, api.create_login_key("k").unwrap());
        state
    }

    #[test]
    fn test_create_waits_for_running() {
        let api = Arc::new(SimulatedApi::new().with_poll_delay(3));
        let mut state = bag_with_key(&api);
        let mut step = StepCreateServerInstance::new(api.clone(), Arc::new(RecordingUi::new()), &config());

        assert_eq!(step.run(&mut state), StepAction::Continue);
        let server = state.get(keys::SERVER_INSTANCE).unwrap();
        assert_eq!(server.status, ServerStatus::Running);
        assert!(api.call_count(Operation::GetServerInstance) >= 4);
    }

    #[test]
    fn test_create_without_login_key_halts() {
        let api = simulated();
        let mut state = StateBag::new();

        let action = StepCreateServerInstance::new(api.clone(), Arc::new(RecordingUi::new()), &config())
            .run(&mut state);

        assert_eq!(action, StepAction::Halt);
        assert!(matches!(state.error(), Some(BuilderError::State(_))));
        assert_eq!(api.call_count(Operation::CreateServerInstance), 0);
    }

    #[test]
    fn test_timed_out_wait_releases_instance_inline() {
        let api = Arc::new(SimulatedApi::new().with_poll_delay(100_000));
        let mut state = bag_with_key(&api);
        let mut step = StepCreateServerInstance::new(api.clone(), Arc::new(RecordingUi::new()), &config());
        step.policy = WaitPolicy::new(Duration::from_millis(20), Duration::from_millis(1));

        assert_eq!(step.run(&mut state), StepAction::Halt);
        assert!(matches!(
            state.error(),
            Some(BuilderError::Api(ApiError::Timeout { .. }))
        ));
        assert!(!state.contains(keys::SERVER_INSTANCE));
        assert!(api.live_resources().servers.is_empty());
    }

    #[test]
    fn test_cancel_during_wait_releases_instance() {
        let api = Arc::new(SimulatedApi::new().with_poll_delay(5));
        let mut state = bag_with_key(&api);
        state.cancel_token().cancel();
        let mut step = StepCreateServerInstance::new(api.clone(), Arc::new(RecordingUi::new()), &config());

        assert_eq!(step.run(&mut state), StepAction::Halt);
        assert!(state.error().unwrap().is_cancelled());
        assert!(api.live_resources().servers.is_empty());
    }

    #[test]
    fn test_cleanup_stops_and_terminates_running_server() {
        let api = simulated();
        let mut state = bag_with_running_server(&api);
        let mut step = StepCreateServerInstance::new(api.clone(), Arc::new(RecordingUi::new()), &config());

        step.cleanup(&mut state).unwrap();

        assert!(!state.contains(keys::SERVER_INSTANCE));
        assert!(api.live_resources().servers.is_empty());
        assert_eq!(api.call_count(Operation::StopServerInstance), 1);

        step.cleanup(&mut state).unwrap();
        assert_eq!(api.call_count(Operation::TerminateServerInstance), 1);
    }

    #[test]
    fn test_stop_then_terminate() {
        let api = simulated();
        let ui = Arc::new(RecordingUi::new());
        let mut state = bag_with_running_server(&api);

        let mut stop = StepStopServerInstance::new(api.clone(), ui.clone(), fast_policy());
        assert_eq!(stop.run(&mut state), StepAction::Continue);
        assert_eq!(
            state.get(keys::SERVER_INSTANCE).unwrap().status,
            ServerStatus::Stopped
        );

        let mut terminate = StepTerminateServerInstance::new(api.clone(), ui, fast_policy());
        assert_eq!(terminate.run(&mut state), StepAction::Continue);
        assert!(!state.contains(keys::SERVER_INSTANCE));
        assert!(api.live_resources().servers.is_empty());
        assert_eq!(api.call_count(Operation::StopServerInstance), 1);
    }

    #[test]
    fn test_stop_timeout_halts() {
        let slow = Arc::new(SimulatedApi::new().with_poll_delay(200));
        let mut state = bag_with_running_server(&slow);
        let policy = WaitPolicy::new(Duration::from_millis(20), Duration::from_millis(1));

        let mut stop = StepStopServerInstance::new(slow, Arc::new(RecordingUi::new()), policy);
        assert_eq!(stop.run(&mut state), StepAction::Halt);
        assert!(matches!(
            state.error(),
            Some(BuilderError::Api(ApiError::Timeout { .. }))
        ));
    }
}
