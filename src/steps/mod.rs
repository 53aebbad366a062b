//! Concrete build steps and the helpers they share.
//!
//! Every step is constructed with exactly the collaborators it needs (API
//! handle, UI, the config values it reads) and exchanges data with other steps
//! only through the [`StateBag`].
//!
//! Resource-creating steps follow one pattern: announce, call the API, wait
//! for the resource to settle, publish it under its key. When the wait fails
//! after the resource already exists, the step releases it before halting,
//! because the runner never cleans up the step that halted.

mod block_storage;
mod connect;
mod login_key;
mod provision;
mod public_ip;
mod root_password;
mod server_image;
mod server_instance;
mod validate_template;

pub use block_storage::{StepCreateBlockStorage, StepDeleteBlockStorage};
pub use connect::StepConnect;
pub use login_key::{StepCreateLoginKey, StepDeleteLoginKey};
pub use provision::StepProvision;
pub use public_ip::{StepCreatePublicIp, StepDeletePublicIp};
pub use root_password::StepGetRootPassword;
pub use server_image::StepCreateServerImage;
pub use server_instance::{
    StepCreateServerInstance, StepStopServerInstance, StepTerminateServerInstance,
};
pub use validate_template::StepValidateTemplate;

use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::api::ApiError;
use crate::error::BuilderError;
use crate::state::{CancelToken, StateBag};
use crate::step::StepAction;
use crate::ui::Ui;

/// Report `err` to the UI, record it in the error slot and halt.
pub fn halt(state: &mut StateBag, ui: &dyn Ui, err: BuilderError) -> StepAction {
    ui.error(&err.to_string());
    state.put_error(err);
    StepAction::Halt
}

/// How long to wait for a resource to settle and how often to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Poll until `poll` yields a value, the timeout expires or `cancel` is set.
///
/// `poll` returns `Ok(None)` while the resource is still transitioning. API
/// errors end the wait immediately. Pass `None` for `cancel` when the wait must
/// run to completion even during cancellation (rollback paths).
pub fn wait_until<T, F>(
    what: &str,
    policy: &WaitPolicy,
    cancel: Option<&CancelToken>,
    mut poll: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Result<Option<T>, ApiError>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            debug!("wait for {} abandoned after {} poll(s)", what, attempts);
            return Err(ApiError::Cancelled);
        }

        attempts += 1;
        if let Some(value) = poll()? {
            debug!("{} after {} poll(s)", what, attempts);
            return Ok(value);
        }

        if start.elapsed() >= policy.timeout {
            return Err(ApiError::Timeout {
                what: what.to_string(),
                waited_secs: start.elapsed().as_secs(),
            });
        }
        thread::sleep(policy.interval);
    }
}

/// Millisecond timestamp used to make resource names unique per build.
pub fn unique_suffix() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
        .to_string()
}
