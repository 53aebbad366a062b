//! Guest connectivity: which host to dial, with which credentials, and whether
//! the guest answers yet.
//!
//! Linux guests are reached over SSH with the build's login key; Windows guests
//! over WinRM with the decrypted administrator password.

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::config::CommConfig;
use crate::error::{BuilderError, Result};
use crate::state::{StateBag, keys};

/// Guest OS family. Selects the step list and the connection protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum GuestOs {
    #[strum(serialize = "Linux")]
    Linux,
    #[strum(serialize = "Windows")]
    Windows,
}

impl GuestOs {
    /// Exact, case-sensitive match on the configured discriminator
    pub fn from_os_type(os_type: &str) -> Option<Self> {
        os_type.parse().ok()
    }

    pub const fn protocol(self) -> Protocol {
        match self {
            Self::Linux => Protocol::Ssh,
            Self::Windows => Protocol::WinRm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display)]
pub enum Protocol {
    #[strum(serialize = "ssh")]
    Ssh,
    #[strum(serialize = "winrm")]
    WinRm,
}

/// Credentials presented to the guest
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    PrivateKey { username: String, private_key: String },
    Password { username: String, password: String },
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Self::PrivateKey { username, .. } | Self::Password { username, .. } => username,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKey { username, .. } => f
                .debug_struct("PrivateKey")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Everything needed to open a provisioning channel to the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub credentials: Credentials,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}",
            self.protocol,
            self.credentials.username(),
            self.host,
            self.port
        )
    }
}

/// Address the guest is reached at
pub fn resolve_host(state: &StateBag) -> Result<String> {
    state.require(keys::CONNECT_HOST).cloned()
}

/// Credentials for the guest, by OS family
pub fn resolve_credentials(state: &StateBag, comm: &CommConfig, os: GuestOs) -> Result<Credentials> {
    match os {
        GuestOs::Linux => {
            let key = state.require(keys::LOGIN_KEY)?;
            Ok(Credentials::PrivateKey {
                username: comm.ssh_username.clone(),
                private_key: key.private_key.clone(),
            })
        }
        GuestOs::Windows => {
            let password = state.require(keys::ROOT_PASSWORD)?;
            Ok(Credentials::Password {
                username: comm.winrm_username.clone(),
                password: password.clone(),
            })
        }
    }
}

pub fn resolve_target(state: &StateBag, comm: &CommConfig, os: GuestOs) -> Result<ConnectTarget> {
    let host = resolve_host(state)?;
    let credentials = resolve_credentials(state, comm, os)?;
    let port = match os.protocol() {
        Protocol::Ssh => comm.ssh_port,
        Protocol::WinRm => comm.winrm_port,
    };
    if host.trim().is_empty() {
        return Err(BuilderError::state("connect host is empty"));
    }
    Ok(ConnectTarget {
        host,
        port,
        protocol: os.protocol(),
        credentials,
    })
}

/// Probes whether a guest accepts connections.
pub trait GuestConnector: Send + Sync {
    fn probe(&self, target: &ConnectTarget) -> io::Result<()>;
}

/// Opens (and immediately drops) a TCP connection to the target port.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbeConnector {
    timeout: Duration,
}

impl TcpProbeConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbeConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl GuestConnector for TcpProbeConnector {
    fn probe(&self, target: &ConnectTarget) -> io::Result<()> {
        let addrs = (target.host.as_str(), target.port).to_socket_addrs()?;
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host resolved to no address");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/// Treats every guest as reachable. Used with the simulated API, where no
/// guest exists to dial.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeReachable;

impl GuestConnector for AssumeReachable {
    fn probe(&self, _target: &ConnectTarget) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LoginKey;
    use std::net::TcpListener;

    fn bag_with_host() -> StateBag {
        let mut state = StateBag::new();
        state.put(keys::CONNECT_HOST, "127.0.0.1".to_string());
        state.put(
            keys::LOGIN_KEY,
            LoginKey {
                key_name: "k".to_string(),
                private_key: "PRIVATE".to_string(),
            },
        );
        state.put(keys::ROOT_PASSWORD, "Pw!1".to_string());
        state
    }

    #[test]
    fn test_os_type_is_case_sensitive() {
        assert_eq!(GuestOs::from_os_type("Linux"), Some(GuestOs::Linux));
        assert_eq!(GuestOs::from_os_type("Windows"), Some(GuestOs::Windows));
        assert_eq!(GuestOs::from_os_type("linux"), None);
        assert_eq!(GuestOs::from_os_type(""), None);
    }

    #[test]
    fn test_linux_uses_ssh_key() {
        let state = bag_with_host();
        let target = resolve_target(&state, &CommConfig::default(), GuestOs::Linux).unwrap();
        assert_eq!(target.port, 22);
        assert_eq!(target.protocol, Protocol::Ssh);
        assert!(matches!(
            target.credentials,
            Credentials::PrivateKey { ref private_key, .. } if private_key == "PRIVATE"
        ));
        assert_eq!(target.to_string(), "ssh://root@127.0.0.1:22");
    }

    #[test]
    fn test_windows_uses_password() {
        let state = bag_with_host();
        let target = resolve_target(&state, &CommConfig::default(), GuestOs::Windows).unwrap();
        assert_eq!(target.port, 5985);
        assert_eq!(target.credentials.username(), "Administrator");
        assert!(!format!("{:?}", target).contains("Pw!1"));
    }

    #[test]
    fn test_missing_password_is_reported() {
        let mut state = bag_with_host();
        state.remove(keys::ROOT_PASSWORD);
        let err = resolve_target(&state, &CommConfig::default(), GuestOs::Windows).unwrap_err();
        assert!(err.to_string().contains("root_password"));
    }

    #[test]
    fn test_tcp_probe_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut state = bag_with_host();
        state.put(keys::CONNECT_HOST, "127.0.0.1".to_string());
        let comm = CommConfig {
            ssh_port: port,
            ..CommConfig::default()
        };
        let target = resolve_target(&state, &comm, GuestOs::Linux).unwrap();

        assert!(TcpProbeConnector::new(Duration::from_secs(1)).probe(&target).is_ok());
    }
}
