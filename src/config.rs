//! Builder configuration: decoding, defaults and validation.
//!
//! Raw configuration arrives as one or more JSON objects (template, variable
//! overrides, CLI overrides). They are merged left to right, decoded into
//! [`Config`], completed from the environment and validated. Validation collects
//! every problem instead of stopping at the first one, so a user fixes a template
//! in one pass.
//!
//! Nothing here talks to the remote API.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::api::AccessCredentials;
use crate::comm::GuestOs;

/// Environment fallback for `access_key`
pub const ACCESS_KEY_ENV: &str = "NCLOUD_ACCESS_KEY";
/// Environment fallback for `secret_key`
pub const SECRET_KEY_ENV: &str = "NCLOUD_SECRET_KEY";

/// Largest user data payload the API accepts, in bytes
pub const MAX_USER_DATA_BYTES: usize = 21847;

const MAX_IMAGE_DESCRIPTION: usize = 1000;

/// Configuration problems reported by [`Config::from_raws`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
    /// Warnings gathered before the configuration was rejected
    pub warnings: Vec<String>,
}

impl ConfigError {
    fn single(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
            warnings: Vec::new(),
        }
    }
}

/// Guest connectivity settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    pub ssh_username: String,
    pub ssh_port: u16,
    pub winrm_username: String,
    pub winrm_port: u16,
    /// How long to wait for the guest to accept connections
    pub connect_timeout_secs: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            ssh_username: "root".to_string(),
            ssh_port: 22,
            winrm_username: "Administrator".to_string(),
            winrm_port: 5985,
            connect_timeout_secs: 300,
        }
    }
}

/// Complete builder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Credentials
    pub access_key: String,
    pub secret_key: String,

    /// Guest OS family discriminator ("Linux" or "Windows")
    pub os_type: String,
    pub region: String,

    // Source image (exactly one)
    pub server_image_product_code: Option<String>,
    pub member_server_image_no: Option<String>,

    pub server_product_code: String,

    // Produced image
    pub server_image_name: Option<String>,
    pub server_image_description: Option<String>,

    // Instance bootstrap
    pub user_data: Option<String>,
    pub user_data_file: Option<PathBuf>,
    pub block_storage_size: Option<u32>,
    pub access_control_group_configuration_no: Option<String>,

    // Polling
    pub state_timeout_secs: u64,
    pub poll_interval_ms: u64,

    /// Step-by-step mode
    pub debug: bool,

    pub communicator: CommConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            os_type: String::new(),
            region: "Korea".to_string(),
            server_image_product_code: None,
            member_server_image_no: None,
            server_product_code: String::new(),
            server_image_name: None,
            server_image_description: None,
            user_data: None,
            user_data_file: None,
            block_storage_size: None,
            access_control_group_configuration_no: None,
            state_timeout_secs: 3600,
            poll_interval_ms: 2000,
            debug: false,
            communicator: CommConfig::default(),
        }
    }
}

impl Config {
    /// Read one raw configuration object from a JSON file
    pub fn load_raw<P: AsRef<Path>>(path: P) -> anyhow::Result<Value> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let raw: Value =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(raw)
    }

    /// Merge, decode, complete and validate raw configuration objects.
    ///
    /// Returns the configuration and any warnings.
    pub fn from_raws(raws: &[Value]) -> Result<(Self, Vec<String>), ConfigError> {
        let merged = merge_raws(raws)?;
        let mut config: Config = serde_json::from_value(merged)
            .map_err(|e| ConfigError::single(format!("failed to decode configuration: {}", e)))?;

        config.apply_environment();
        let warnings = config.apply_defaults();

        let mut problems = config.validate();
        if problems.is_empty() {
            if let Err(problem) = config.load_user_data_file() {
                problems.push(problem);
            }
        }

        if problems.is_empty() {
            Ok((config, warnings))
        } else {
            Err(ConfigError { problems, warnings })
        }
    }

    fn apply_environment(&mut self) {
        if self.access_key.trim().is_empty() {
            if let Ok(value) = std::env::var(ACCESS_KEY_ENV) {
                self.access_key = value;
            }
        }
        if self.secret_key.trim().is_empty() {
            if let Ok(value) = std::env::var(SECRET_KEY_ENV) {
                self.secret_key = value;
            }
        }
    }

    fn apply_defaults(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        // Blank optional strings mean "not set"
        for field in [
            &mut self.server_image_product_code,
            &mut self.member_server_image_no,
            &mut self.user_data,
            &mut self.access_control_group_configuration_no,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }

        if self.server_image_name.is_none() {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            self.server_image_name = Some(format!("packer-{}", secs));
        }

        if !self.os_type.is_empty() && self.guest_os().is_none() {
            warnings.push(format!(
                "os_type '{}' is neither \"Linux\" nor \"Windows\": no build steps will run and no image will be produced",
                self.os_type
            ));
        }

        if self.block_storage_size.is_some() && self.guest_os() == Some(GuestOs::Windows) {
            warnings.push(
                "additional block storage on Windows must be initialized by a provisioner"
                    .to_string(),
            );
        }

        warnings
    }

    /// Check every field, collecting all problems
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.access_key.trim().is_empty() {
            problems.push(format!("access_key is required (or set {})", ACCESS_KEY_ENV));
        }
        if self.secret_key.trim().is_empty() {
            problems.push(format!("secret_key is required (or set {})", SECRET_KEY_ENV));
        }
        if self.os_type.trim().is_empty() {
            problems.push("os_type is required".to_string());
        }
        if self.region.trim().is_empty() {
            problems.push("region must not be empty".to_string());
        }

        let product = non_empty(&self.server_image_product_code);
        let member = non_empty(&self.member_server_image_no);
        match (product, member) {
            (None, None) => problems.push(
                "server_image_product_code or member_server_image_no is required".to_string(),
            ),
            (Some(_), Some(_)) => problems.push(
                "only one of server_image_product_code and member_server_image_no may be set"
                    .to_string(),
            ),
            _ => {}
        }

        if self.server_product_code.trim().is_empty() {
            problems.push("server_product_code is required".to_string());
        }

        if let Some(name) = &self.server_image_name {
            if let Err(problem) = validate_image_name(name) {
                problems.push(problem);
            }
        }

        if let Some(description) = &self.server_image_description {
            if description.chars().count() > MAX_IMAGE_DESCRIPTION {
                problems.push(format!(
                    "server_image_description must be at most {} characters",
                    MAX_IMAGE_DESCRIPTION
                ));
            }
        }

        if self.user_data.is_some() && self.user_data_file.is_some() {
            problems.push("only one of user_data and user_data_file may be set".to_string());
        }
        if let Some(data) = &self.user_data {
            if data.len() > MAX_USER_DATA_BYTES {
                problems.push(format!(
                    "user_data must be at most {} bytes",
                    MAX_USER_DATA_BYTES
                ));
            }
        }

        if let Some(size) = self.block_storage_size {
            if !(10..=2000).contains(&size) || size % 10 != 0 {
                problems.push(
                    "block_storage_size must be a multiple of 10 between 10 and 2000 (GB)"
                        .to_string(),
                );
            }
        }

        if self.state_timeout_secs == 0 {
            problems.push("state_timeout_secs must be greater than zero".to_string());
        }
        if self.poll_interval_ms == 0 {
            problems.push("poll_interval_ms must be greater than zero".to_string());
        }

        let comm = &self.communicator;
        if comm.ssh_username.trim().is_empty() {
            problems.push("communicator.ssh_username must not be empty".to_string());
        }
        if comm.winrm_username.trim().is_empty() {
            problems.push("communicator.winrm_username must not be empty".to_string());
        }
        if comm.ssh_port == 0 || comm.winrm_port == 0 {
            problems.push("communicator ports must be non-zero".to_string());
        }
        if comm.connect_timeout_secs == 0 {
            problems.push("communicator.connect_timeout_secs must be greater than zero".to_string());
        }

        problems
    }

    /// Inline the contents of `user_data_file` into `user_data`
    fn load_user_data_file(&mut self) -> Result<(), String> {
        let Some(path) = &self.user_data_file else {
            return Ok(());
        };
        let content = fs::read_to_string(path)
            .map_err(|e| format!("user_data_file {:?} could not be read: {}", path, e))?;
        if content.len() > MAX_USER_DATA_BYTES {
            return Err(format!(
                "user_data_file {:?} exceeds {} bytes",
                path, MAX_USER_DATA_BYTES
            ));
        }
        self.user_data = Some(content);
        Ok(())
    }

    /// The guest OS family, or `None` for an unrecognized discriminator
    pub fn guest_os(&self) -> Option<GuestOs> {
        GuestOs::from_os_type(&self.os_type)
    }

    pub fn access_credentials(&self) -> AccessCredentials {
        AccessCredentials {
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
        }
    }

    pub fn image_name(&self) -> &str {
        self.server_image_name.as_deref().unwrap_or_default()
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_secs(self.state_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Image names: 3-30 chars, lowercase letters, digits and '-', starting with a letter
fn validate_image_name(name: &str) -> Result<(), String> {
    let len = name.chars().count();
    if !(3..=30).contains(&len) {
        return Err("server_image_name must be 3-30 characters long".to_string());
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err("server_image_name must start with a lowercase letter".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(
            "server_image_name can only contain lowercase letters, digits and '-'".to_string(),
        );
    }
    Ok(())
}

/// Merge raw objects left to right; nested objects merge key by key.
fn merge_raws(raws: &[Value]) -> Result<Value, ConfigError> {
    let mut merged = Map::new();
    for (index, raw) in raws.iter().enumerate() {
        match raw {
            Value::Object(map) => merge_object(&mut merged, map),
            Value::Null => {}
            _ => {
                return Err(ConfigError::single(format!(
                    "raw configuration #{} is not a JSON object",
                    index + 1
                )));
            }
        }
    }
    Ok(Value::Object(merged))
}

fn merge_object(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        match (into.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_object(existing, incoming);
            }
            _ => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}
