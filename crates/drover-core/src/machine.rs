use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier for a remote machine.
///
/// Derived from hardware identity (`{mac}_{hostname}_{hash8}`) rather than
/// generated, so the same host always produces the same id and
/// re-registration is idempotent.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derive the canonical id from the host's identity.
    pub fn derive(hostname: &str, mac_address: &str) -> Self {
        let digest = Sha256::digest(format!("{hostname}_{mac_address}_salt_2024").as_bytes());
        let hash8 = &hex::encode(digest)[..8];
        let clean_mac: String = mac_address.chars().filter(|c| *c != ':').collect();
        Self(format!("{clean_mac}_{hostname}_{hash8}"))
    }

    /// Whether the id has the expected `{mac}_{hostname}_{hash}` shape.
    /// Handshakes presenting anything else are rejected before registration.
    pub fn is_well_formed(&self) -> bool {
        let parts: Vec<&str> = self.0.split('_').collect();
        parts.len() >= 2
            && parts.iter().all(|p| !p.is_empty())
            && self.0.chars().all(|c| c.is_ascii_graphic())
    }

    /// The hostname segment, when the id is well-formed.
    pub fn hostname(&self) -> Option<&str> {
        self.0.split('_').nth(1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MachineId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Host facts announced by the agent on connect and refreshed thereafter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub hostname: String,
}

/// Persisted record of a known machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineRecord {
    pub machine_id: MachineId,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub last_seen: String,
    pub is_active: bool,
}
