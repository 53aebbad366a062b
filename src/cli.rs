use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::api::Operation;

/// ncloud-imager - Build server images on Naver Cloud Platform
#[derive(Parser)]
#[command(name = "ncloud-imager")]
#[command(about = "Builds reusable server images on Naver Cloud Platform")]
#[command(version)]
pub struct Cli {
    /// Pause after every completed step and log verbosely.
    ///
    /// At each pause, press Enter to continue or type `cancel` to roll the
    /// build back.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to the JSON configuration file
        config: PathBuf,

        /// Override a configuration value (KEY=VALUE, VALUE parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Print the steps a build would execute
    Plan {
        /// Path to the JSON configuration file
        config: PathBuf,

        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Run the full build against the in-memory simulator
    Rehearse {
        /// Path to the JSON configuration file
        config: PathBuf,

        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Make an API operation fail (e.g., create_public_ip)
        #[arg(long)]
        fail_at: Option<Operation>,

        /// Local command to run as the provisioning hook (repeatable)
        #[arg(long = "exec", value_name = "COMMAND")]
        exec: Vec<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Turn `KEY=VALUE` pairs into one raw configuration layer.
///
/// Dotted keys address nested objects (`communicator.ssh_port=2222`).
pub fn overrides_layer(pairs: &[String]) -> anyhow::Result<Value> {
    let mut root = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            anyhow::bail!("override '{}' is not of the form KEY=VALUE", pair);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

        let mut segments: Vec<&str> = key.split('.').collect();
        let Some(leaf) = segments.pop() else {
            anyhow::bail!("override '{}' has an empty key", pair);
        };
        let mut node = &mut root;
        for segment in segments {
            let entry = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            match entry {
                Value::Object(map) => node = map,
                _ => anyhow::bail!("override '{}' conflicts with a non-object value", pair),
            }
        }
        node.insert(leaf.to_string(), value);
    }
    Ok(Value::Object(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rehearse_parses_failure_injection() {
        let cli = Cli::try_parse_from([
            "ncloud-imager",
            "--debug",
            "rehearse",
            "build.json",
            "--fail-at",
            "create_public_ip",
            "--exec",
            "echo hi",
        ])
        .unwrap();

        assert!(cli.debug);
        match cli.command {
            Commands::Rehearse { fail_at, exec, .. } => {
                assert_eq!(fail_at, Some(Operation::CreatePublicIp));
                assert_eq!(exec, vec!["echo hi".to_string()]);
            }
            _ => panic!("expected rehearse"),
        }
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        assert!(
            Cli::try_parse_from(["ncloud-imager", "rehearse", "b.json", "--fail-at", "nope"])
                .is_err()
        );
    }

    #[test]
    fn test_overrides_layer_nests_and_types() {
        let layer = overrides_layer(&[
            "os_type=Linux".to_string(),
            "block_storage_size=100".to_string(),
            "communicator.ssh_port=2222".to_string(),
        ])
        .unwrap();

        assert_eq!(
            layer,
            json!({
                "os_type": "Linux",
                "block_storage_size": 100,
                "communicator": { "ssh_port": 2222 }
            })
        );
        assert!(overrides_layer(&["novalue".to_string()]).is_err());
    }
}
