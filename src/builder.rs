//! Builder: configuration, step selection and run orchestration.
//!
//! # Lifecycle
//!
//! 1. `prepare` merges and validates raw configuration. No remote calls.
//! 2. `run` opens one API connection through the injected
//!    [`ConnectionFactory`], selects the step list for the guest OS, executes
//!    it with a [`Runner`] and turns the outcome into an [`Artifact`] or an
//!    error.
//! 3. `cancel` may be called from any thread at any time; it is permanent for
//!    the builder's lifetime.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::api::{AccessCredentials, ApiError, ProvisioningApi, SimulatedApi};
use crate::artifact::Artifact;
use crate::comm::GuestConnector;
use crate::config::{Config, ConfigError};
use crate::error::{BuilderError, Result};
use crate::hook::{NoopHook, ProvisionHook};
use crate::runner::{BoundaryHook, RunOutcome, RunReport, Runner};
use crate::state::{CancelToken, keys};
use crate::step::Step;
use crate::steps::{
    StepConnect, StepCreateBlockStorage, StepCreateLoginKey, StepCreatePublicIp,
    StepCreateServerImage, StepCreateServerInstance, StepDeleteBlockStorage, StepDeleteLoginKey,
    StepDeletePublicIp, StepGetRootPassword, StepProvision, StepStopServerInstance,
    StepTerminateServerInstance, StepValidateTemplate, WaitPolicy,
};
use crate::ui::{RecordingUi, Ui};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Opens a provisioning API connection from access credentials.
pub type ConnectionFactory =
    Box<dyn Fn(&AccessCredentials) -> std::result::Result<Arc<dyn ProvisioningApi>, ApiError> + Send + Sync>;

pub struct Builder {
    factory: ConnectionFactory,
    connector: Arc<dyn GuestConnector>,
    config: Option<Config>,
    cancel: CancelToken,
    boundary_hook: Option<BoundaryHook>,
    last_report: Option<RunReport>,
}

impl Builder {
    pub fn new(factory: ConnectionFactory, connector: Arc<dyn GuestConnector>) -> Self {
        Self {
            factory,
            connector,
            config: None,
            cancel: CancelToken::new(),
            boundary_hook: None,
            last_report: None,
        }
    }

    /// Builder whose every connection is `api`.
    pub fn with_api(api: Arc<dyn ProvisioningApi>, connector: Arc<dyn GuestConnector>) -> Self {
        let factory: ConnectionFactory = Box::new(
            move |_: &AccessCredentials| -> std::result::Result<Arc<dyn ProvisioningApi>, ApiError> {
                Ok(api.clone())
            },
        );
        Self::new(factory, connector)
    }

    /// Callback run after every completed step when `debug` is configured.
    pub fn with_boundary_hook(mut self, hook: BoundaryHook) -> Self {
        self.boundary_hook = Some(hook);
        self
    }

    /// Merge, decode and validate raw configuration. Returns warnings.
    ///
    /// A failed `prepare` discards any earlier configuration, so `run` refuses
    /// until a later `prepare` succeeds.
    pub fn prepare(&mut self, raws: &[Value]) -> std::result::Result<Vec<String>, ConfigError> {
        match Config::from_raws(raws) {
            Ok((config, warnings)) => {
                for warning in &warnings {
                    warn!("{}", warning);
                }
                info!(
                    "Prepared build of image '{}' (os_type {})",
                    config.image_name(),
                    config.os_type
                );
                self.config = Some(config);
                Ok(warnings)
            }
            Err(err) => {
                self.config = None;
                Err(err)
            }
        }
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    /// Names of the steps `run` would execute, in order.
    pub fn plan(&self) -> Result<Vec<&'static str>> {
        let config = self.prepared()?;
        // Constructing steps performs no API calls.
        let steps = steps_for(
            config,
            Arc::new(SimulatedApi::new()),
            Arc::new(RecordingUi::new()),
            self.connector.clone(),
            Arc::new(NoopHook),
        );
        Ok(steps.iter().map(|s| s.name()).collect())
    }

    /// Execute the build.
    ///
    /// # Errors
    ///
    /// - `State` if `prepare` has not succeeded
    /// - `Api` if the connection cannot be opened
    /// - `Cancelled` if cancellation was observed
    /// - the halting step's error otherwise
    pub fn run(&mut self, ui: Arc<dyn Ui>, hook: Arc<dyn ProvisionHook>) -> Result<Artifact> {
        let config = self.prepared()?.clone();
        let api = (self.factory)(&config.access_credentials())?;

        let steps = steps_for(&config, api, ui.clone(), self.connector.clone(), hook);
        if steps.is_empty() {
            warn!("os_type '{}' selects no steps", config.os_type);
        }

        let mut runner = Runner::with_cancel_token(steps, self.cancel.clone());
        if config.debug {
            if let Some(hook) = self.boundary_hook.take() {
                runner = runner.with_boundary_hook(hook);
            }
        }

        let mut state = runner.new_state();
        let report = runner
            .run(&mut state)
            .map_err(|e| BuilderError::state(e.to_string()))?;

        for failure in &report.cleanup_failures {
            ui.error(&format!("Resource may not have been released: {}", failure));
        }
        let outcome = report.outcome;
        self.last_report = Some(report);

        match outcome {
            RunOutcome::Completed => {
                let artifact = Artifact::new(config.region.clone(), state.take(keys::SERVER_IMAGE));
                info!("Build finished: {}", artifact);
                Ok(artifact)
            }
            RunOutcome::Cancelled => {
                ui.error("Build was cancelled");
                Err(BuilderError::Cancelled)
            }
            RunOutcome::Halted => {
                if let Some(image) = state.take(keys::SERVER_IMAGE) {
                    warn!("Server image {} outlives the failed build", image.image_no);
                    ui.error(&format!(
                        "Server image {} ({}) was created before the failure and has been kept",
                        image.image_no, image.name
                    ));
                }
                Err(state
                    .take_error()
                    .unwrap_or_else(|| BuilderError::state("run halted without an error")))
            }
        }
    }

    /// Report of the most recent `run`.
    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    /// Request cancellation of the current and every future run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn prepared(&self) -> Result<&Config> {
        self.config
            .as_ref()
            .ok_or_else(|| BuilderError::state("run requires a successful prepare"))
    }
}

/// The ordered step list for the configured guest OS. Empty for an
/// unrecognized OS type.
pub fn steps_for(
    config: &Config,
    api: Arc<dyn ProvisioningApi>,
    ui: Arc<dyn Ui>,
    connector: Arc<dyn GuestConnector>,
    hook: Arc<dyn ProvisionHook>,
) -> Vec<Box<dyn Step>> {
    let Some(os) = config.guest_os() else {
        return Vec::new();
    };
    let policy = WaitPolicy::new(config.state_timeout(), config.poll_interval());

    let mut steps: Vec<Box<dyn Step>> = Vec::with_capacity(14);
    steps.push(Box::new(StepValidateTemplate::new(api.clone(), ui.clone(), config)));
    steps.push(Box::new(StepCreateLoginKey::new(api.clone(), ui.clone())));
    steps.push(Box::new(StepCreateServerInstance::new(api.clone(), ui.clone(), config)));
    steps.push(Box::new(StepCreateBlockStorage::new(
        api.clone(),
        ui.clone(),
        config.block_storage_size,
        policy,
    )));
    steps.push(Box::new(StepGetRootPassword::new(api.clone(), ui.clone())));
    steps.push(Box::new(StepCreatePublicIp::new(api.clone(), ui.clone())));
    steps.push(Box::new(StepConnect::new(
        ui.clone(),
        connector,
        config.communicator.clone(),
        os,
        config.poll_interval(),
    )));
    steps.push(Box::new(StepProvision::new(ui.clone(), hook)));
    steps.push(Box::new(StepStopServerInstance::new(api.clone(), ui.clone(), policy)));
    steps.push(Box::new(StepCreateServerImage::new(
        api.clone(),
        ui.clone(),
        config.image_name(),
        config.server_image_description.clone().unwrap_or_default(),
        policy,
    )));
    steps.push(Box::new(StepDeleteBlockStorage::new(api.clone(), ui.clone())));
    steps.push(Box::new(StepTerminateServerInstance::new(api.clone(), ui.clone(), policy)));
    steps.push(Box::new(StepDeleteLoginKey::new(api.clone(), ui.clone())));
    steps.push(Box::new(StepDeletePublicIp::new(api, ui)));
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::AssumeReachable;
    use serde_json::json;

    fn raw(os_type: &str) -> Value {
        json!({
            "access_key": "AK",
            "secret_key": "SK",
            "os_type": os_type,
            "server_image_product_code": "SPSW0LINUX000046",
            "server_product_code": "SPSVRSSD00000003",
            "poll_interval_ms": 1
        })
    }

    fn builder() -> Builder {
        Builder::with_api(Arc::new(SimulatedApi::new()), Arc::new(AssumeReachable))
    }

    #[test]
    fn test_plan_follows_os() {
        let mut b = builder();
        b.prepare(&[raw("Linux")]).unwrap();
        let linux = b.plan().unwrap();
        assert_eq!(linux.first(), Some(&"validate_template"));
        assert!(linux.contains(&"connect_ssh"));
        assert_eq!(linux.last(), Some(&"delete_public_ip"));

        b.prepare(&[raw("Windows")]).unwrap();
        assert!(b.plan().unwrap().contains(&"connect_winrm"));

        b.prepare(&[raw("Plan9")]).unwrap();
        assert!(b.plan().unwrap().is_empty());
    }

    #[test]
    fn test_run_before_prepare_is_refused() {
        let mut b = builder();
        let err = b
            .run(Arc::new(RecordingUi::new()), Arc::new(NoopHook))
            .unwrap_err();
        assert!(matches!(err, BuilderError::State(_)));
        assert!(b.plan().is_err());
    }

    #[test]
    fn test_connection_failure_surfaces_as_api_error() {
        let factory: ConnectionFactory = Box::new(
            |_: &AccessCredentials| -> std::result::Result<Arc<dyn ProvisioningApi>, ApiError> {
                Err(ApiError::Transport {
                    operation: crate::api::Operation::ListServerImageProducts,
                    message: "authentication failed".to_string(),
                })
            },
        );
        let mut b = Builder::new(factory, Arc::new(AssumeReachable));
        b.prepare(&[raw("Linux")]).unwrap();

        let err = b
            .run(Arc::new(RecordingUi::new()), Arc::new(NoopHook))
            .unwrap_err();
        assert!(matches!(err, BuilderError::Api(ApiError::Transport { .. })));
    }
}
