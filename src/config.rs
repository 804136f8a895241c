//! Session configuration passed explicitly into server and client.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IpcError;
use crate::types::PeerId;

/// Rendezvous name used when none is given.
pub const DEFAULT_ADDRESS: &str = "CatPipe";

/// Well-known name both sides of a session agree on.
///
/// A bare name such as `CatPipe` lives in the system temp directory as
/// `CatPipe.sock`; anything containing a path separator is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointAddress(String);

impl EndpointAddress {
    pub fn new(name: impl Into<String>) -> Result<Self, IpcError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(IpcError::InvalidAddress("address is empty".to_string()));
        }
        if name.contains('\0') {
            return Err(IpcError::InvalidAddress(format!(
                "{name:?} contains a NUL byte"
            )));
        }
        Ok(Self(name))
    }

    /// Address for a socket file at an explicit path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        Self::new(path.as_ref().to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn socket_path(&self) -> PathBuf {
        if self.0.contains(std::path::MAIN_SEPARATOR) || self.0.contains('/') {
            PathBuf::from(&self.0)
        } else {
            std::env::temp_dir().join(format!("{}.sock", self.0))
        }
    }
}

impl Default for EndpointAddress {
    fn default() -> Self {
        Self(DEFAULT_ADDRESS.to_string())
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EndpointAddress {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EndpointAddress {
    type Error = IpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EndpointAddress> for String {
    fn from(value: EndpointAddress) -> Self {
        value.0
    }
}

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: EndpointAddress,
    /// How long a freshly connected peer may take to send its auth line
    pub handshake_timeout: Duration,
    /// Bound on waiting for a loop thread to stop during dispose
    pub join_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: EndpointAddress::default(),
            handshake_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    pub fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: EndpointAddress,
    /// Identifier announced in the `auth_<id>` line
    pub peer_id: PeerId,
    /// Pause between attempts while the server socket does not exist yet
    pub connect_retry_interval: Duration,
    /// Give up connecting after this long; `None` waits until cancelled
    pub connect_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: EndpointAddress::default(),
            peer_id: PeerId::from(std::process::id()),
            connect_retry_interval: Duration::from_millis(100),
            connect_timeout: None,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(address: EndpointAddress, peer_id: PeerId) -> Self {
        Self {
            address,
            peer_id,
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_resolves_into_temp_dir() {
        let address = EndpointAddress::new("CatPipe").unwrap();
        assert_eq!(
            address.socket_path(),
            std::env::temp_dir().join("CatPipe.sock")
        );
    }

    #[test]
    fn path_is_used_verbatim() {
        let address = EndpointAddress::new("/run/user/1000/cat.sock").unwrap();
        assert_eq!(address.socket_path(), PathBuf::from("/run/user/1000/cat.sock"));
    }

    #[test]
    fn empty_and_nul_addresses_are_invalid() {
        assert!(matches!(
            EndpointAddress::new("  "),
            Err(IpcError::InvalidAddress(_))
        ));
        assert!(matches!(
            "cat\0pipe".parse::<EndpointAddress>(),
            Err(IpcError::InvalidAddress(_))
        ));
    }

    #[test]
    fn address_serializes_as_plain_string() {
        let address = EndpointAddress::new("CatPipe").unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"CatPipe\"");
        let back: EndpointAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
        assert!(serde_json::from_str::<EndpointAddress>("\"\"").is_err());
    }

    #[test]
    fn client_defaults_to_own_pid() {
        let config = ClientConfig::default();
        assert_eq!(config.peer_id, PeerId::from(std::process::id()));
        assert_eq!(config.address.as_str(), DEFAULT_ADDRESS);
    }
}
