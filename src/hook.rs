//! Provisioning hook, invoked once the guest accepts connections.
//!
//! What a hook does inside the guest is opaque to the build: it receives the
//! resolved [`ConnectTarget`] and reports success or failure.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::command_runner::run_command_safe;
use crate::comm::{ConnectTarget, Credentials};
use crate::error::{BuilderError, Result};
use crate::ui::Ui;

pub trait ProvisionHook: Send + Sync {
    fn provision(&self, target: &ConnectTarget, ui: &dyn Ui) -> Result<()>;
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl ProvisionHook for NoopHook {
    fn provision(&self, _target: &ConnectTarget, _ui: &dyn Ui) -> Result<()> {
        Ok(())
    }
}

/// Runs local shell commands in order, with the target exported as
/// `NCLOUD_GUEST_HOST`, `NCLOUD_GUEST_PORT`, `NCLOUD_GUEST_USER` and
/// `NCLOUD_GUEST_PROTOCOL`. Stops at the first failing command.
///
/// Credentials are exported too: `NCLOUD_GUEST_KEY_FILE` names a private key
/// file (mode 0600, deleted once the hook returns) for SSH targets, and
/// `NCLOUD_GUEST_PASSWORD` carries the password for WinRM targets.
#[derive(Debug, Clone, Default)]
pub struct ShellHook {
    commands: Vec<String>,
}

impl ShellHook {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    /// The command environment, plus the key file that must outlive the
    /// commands.
    fn environment(target: &ConnectTarget) -> Result<(Vec<(String, String)>, Option<NamedTempFile>)> {
        let mut env = vec![
            ("NCLOUD_GUEST_HOST".to_string(), target.host.clone()),
            ("NCLOUD_GUEST_PORT".to_string(), target.port.to_string()),
            (
                "NCLOUD_GUEST_USER".to_string(),
                target.credentials.username().to_string(),
            ),
            ("NCLOUD_GUEST_PROTOCOL".to_string(), target.protocol.to_string()),
        ];

        let key_file = match &target.credentials {
            Credentials::PrivateKey { private_key, .. } => {
                let file = write_key_file(private_key)?;
                env.push((
                    "NCLOUD_GUEST_KEY_FILE".to_string(),
                    file.path().display().to_string(),
                ));
                Some(file)
            }
            Credentials::Password { password, .. } => {
                env.push(("NCLOUD_GUEST_PASSWORD".to_string(), password.clone()));
                None
            }
        };
        Ok((env, key_file))
    }
}

fn write_key_file(private_key: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("ncloud-guest-key-")
        .tempfile()?;
    file.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(private_key.as_bytes())?;
    file.flush()?;
    debug!("Guest private key written to {}", file.path().display());
    Ok(file)
}

impl ProvisionHook for ShellHook {
    fn provision(&self, target: &ConnectTarget, ui: &dyn Ui) -> Result<()> {
        let (env, _key_file) = Self::environment(target)?;
        for command in &self.commands {
            ui.message(&format!("Provisioning with local command: {}", command));
            let output = run_command_safe(command, &env)
                .map_err(|e| BuilderError::Io(format!("{:#}", e)))?;
            for line in output.stdout.lines() {
                ui.message(line);
            }
            output
                .ensure_success(command)
                .map_err(|e| BuilderError::step("provision", e.to_string()))?;
        }
        Ok(())
    }
}
