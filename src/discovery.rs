//! Peer discovery records.
//!
//! A discovery record names one reachable data server. Records are compared
//! and hashed on `(host, port)` only: the persistent flag and the auxiliary
//! stream list are presentation details that may differ between sightings of
//! the same server.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, StreamError};

/// One known data server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub host: String,
    pub port: u16,
    /// Whether this entry survives restarts (static host list) or was
    /// observed transiently.
    #[serde(default)]
    pub persistent: bool,
    /// Identifiers of auxiliary streams available next to the variable data,
    /// e.g. attached camera names.
    #[serde(default)]
    pub streams: Vec<String>,
}

impl DiscoveryRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, persistent: false, streams: Vec::new() }
    }
}

impl PartialEq for DiscoveryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for DiscoveryRecord {}

impl Hash for DiscoveryRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for DiscoveryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Load the static host list from a YAML file.
///
/// Duplicate `(host, port)` entries are collapsed, keeping the first.
pub fn load_host_list(path: impl AsRef<Path>) -> Result<Vec<DiscoveryRecord>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).map_err(|e| StreamError::file(path.to_path_buf(), e))?;
    let records: Vec<DiscoveryRecord> = serde_yaml_ng::from_str(&text)
        .map_err(|e| StreamError::configuration(format!("host list {}: {e}", path.display())))?;

    let mut seen = HashSet::new();
    Ok(records.into_iter().filter(|r| seen.insert((r.host.clone(), r.port))).collect())
}

/// Save the static host list as YAML, persistent entries only.
pub fn save_host_list(path: impl AsRef<Path>, records: &[DiscoveryRecord]) -> Result<()> {
    let path = path.as_ref();
    let persistent: Vec<&DiscoveryRecord> = records.iter().filter(|r| r.persistent).collect();
    let text = serde_yaml_ng::to_string(&persistent)
        .map_err(|e| StreamError::configuration(format!("host list serialization: {e}")))?;
    std::fs::write(path, text).map_err(|e| StreamError::file(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_flags_and_streams() {
        let mut a = DiscoveryRecord::new("robot1.local", 8008);
        let mut b = DiscoveryRecord::new("robot1.local", 8008);
        a.persistent = true;
        b.streams.push("head_camera".into());
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn different_port_is_a_different_server() {
        let a = DiscoveryRecord::new("robot1.local", 8008);
        let b = DiscoveryRecord::new("robot1.local", 8009);
        assert_ne!(a, b);
    }

    #[test]
    fn host_list_round_trips_persistent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.yaml");

        let mut kept = DiscoveryRecord::new("robot1.local", 8008);
        kept.persistent = true;
        kept.streams.push("head_camera".into());
        let transient = DiscoveryRecord::new("sim.local", 9000);

        save_host_list(&path, &[kept.clone(), transient]).unwrap();
        let loaded = load_host_list(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], kept);
        assert_eq!(loaded[0].streams, vec!["head_camera".to_string()]);
    }

    #[test]
    fn duplicate_hosts_collapse_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.yaml");
        std::fs::write(
            &path,
            "- host: robot1.local\n  port: 8008\n  persistent: true\n\
             - host: robot1.local\n  port: 8008\n",
        )
        .unwrap();
        let loaded = load_host_list(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].persistent);
    }
}
