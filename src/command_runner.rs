//! Local command execution for provisioning hooks.
//!
//! Every hook command goes through [`run_command_safe`]:
//!
//! - it runs in its own process group (see [`crate::process_guard`]),
//! - its PID is registered so a forced exit terminates it,
//! - stdout/stderr are captured for the build log.

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::info;

use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// Output from a hook command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Return an error describing the failure if the command did not succeed
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }
}

/// Run `command` through `bash -c` with the given environment.
///
/// Environment values are never logged; only the variable names are.
pub fn run_command_safe(command: &str, env: &[(String, String)]) -> Result<CommandOutput> {
    let env_names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
    info!("run_command_safe: {:?} env={:?}", command, env_names);

    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn hook command: {}", command))?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let output = child.wait_with_output();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let output = output.with_context(|| format!("Failed waiting for hook command: {}", command))?;

    let exit_code = output.status.code();
    if !output.status.success() {
        info!(
            "Hook command failed with exit code {}",
            exit_code.unwrap_or(-1)
        );
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code,
        success: output.status.success(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output_and_environment() {
        let env = vec![("GUEST_HOST".to_string(), "203.0.113.7".to_string())];
        let output = run_command_safe("echo host=$GUEST_HOST", &env).unwrap();

        assert!(output.success);
        assert_eq!(output.stdout.trim(), "host=203.0.113.7");
        assert!(output.ensure_success("echo").is_ok());
    }

    #[test]
    fn test_failure_is_reported() {
        let output = run_command_safe("echo broken >&2; exit 3", &[]).unwrap();

        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        let err = output.ensure_success("provisioner").unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
        assert!(err.to_string().contains("broken"));
    }
}
