//! ncloud-imager library
//!
//! Builds reusable server images on Naver Cloud Platform by running an ordered
//! list of steps against a shared state bag, rolling back everything it created
//! when a step fails or the build is cancelled.

pub mod api;
pub mod artifact;
pub mod builder;
pub mod cli;
pub mod comm;
pub mod command_runner;
pub mod config;
pub mod error;
pub mod hook;
pub mod process_guard;
pub mod runner;
pub mod state;
pub mod step;
pub mod steps;
pub mod ui;

// Re-export main types for convenience
pub use api::{ApiError, Operation, ProvisioningApi, SimulatedApi};
pub use artifact::Artifact;
pub use builder::{Builder, ConnectionFactory, VERSION, steps_for};
pub use comm::{AssumeReachable, ConnectTarget, GuestConnector, GuestOs, TcpProbeConnector};
pub use command_runner::{CommandOutput, run_command_safe};
pub use config::{Config, ConfigError};
pub use error::{BuilderError, Result};
pub use hook::{NoopHook, ProvisionHook, ShellHook};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use runner::{RunOutcome, RunPhase, RunReport, RunTransitionError, Runner};
pub use state::{CancelToken, StateBag, StateKey, keys};
pub use step::{Step, StepAction};
pub use ui::{RecordingUi, TracingUi, Ui};
