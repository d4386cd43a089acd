//! Stable machine identity, derived from host facts and cached to disk so
//! every reconnect presents the same id.

use std::fs;
use std::io;
use std::path::Path;

use drover_core::machine::{MachineId, SystemInfo};

/// Load the cached machine id, deriving and persisting it on first run.
pub fn machine_identity(state_dir: &Path) -> io::Result<MachineId> {
    let path = state_dir.join("machine_id");

    if let Ok(existing) = fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(MachineId::from_raw(existing));
        }
    }

    let id = MachineId::derive(&read_hostname(), &read_mac_address());
    fs::create_dir_all(state_dir)?;
    fs::write(&path, id.as_str())?;
    Ok(id)
}

pub fn read_hostname() -> String {
    if let Ok(hostname) = fs::read_to_string("/etc/hostname") {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_owned();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}

/// MAC address of the first real network interface, via sysfs.
pub fn read_mac_address() -> String {
    const FALLBACK: &str = "00:00:00:00:00:00";

    let Ok(entries) = fs::read_dir("/sys/class/net") else {
        return FALLBACK.to_owned();
    };

    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    for name in names {
        if let Ok(address) = fs::read_to_string(format!("/sys/class/net/{name}/address")) {
            let address = address.trim();
            if !address.is_empty() && address != FALLBACK {
                return address.to_owned();
            }
        }
    }
    FALLBACK.to_owned()
}

/// Host facts announced to the server on connect.
pub fn system_info() -> SystemInfo {
    SystemInfo {
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        hostname: read_hostname(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("drover-agent-test-{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn identity_is_cached_across_calls() {
        let dir = temp_dir();
        let first = machine_identity(&dir).unwrap();
        let second = machine_identity(&dir).unwrap();
        assert_eq!(first, second);
        assert!(first.is_well_formed(), "derived id must pass the handshake check: {first}");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cached_file_wins_over_derivation() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("machine_id"), "aabb_pinned_12ab34cd\n").unwrap();

        let id = machine_identity(&dir).unwrap();
        assert_eq!(id.as_str(), "aabb_pinned_12ab34cd");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn system_info_is_populated() {
        let info = system_info();
        assert!(!info.os.is_empty());
        assert!(!info.arch.is_empty());
        assert!(!info.hostname.is_empty());
    }
}
