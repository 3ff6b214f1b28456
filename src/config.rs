//! Store configuration.
//!
//! Callers hand the engine a fully-resolved [`StoreOptions`]; discovering
//! and merging distro configuration files is their business, not ours. For
//! convenience a `storage.conf`-style TOML fragment can be parsed with
//! [`StoreOptions::from_toml`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::errors::{Result, StoreError};
use crate::idset::IdMap;

/// A contiguous range of subordinate host IDs usable for automatic user
/// namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct IdRange {
    pub start: u32,
    pub length: u32,
}

/// Everything needed to open a [`Store`](crate::store::Store).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreOptions {
    /// Root for volatile state (mount bookkeeping). Cleared by reboot.
    #[serde(default)]
    pub run_root: PathBuf,

    /// Root for persistent state (records, big data, layer content).
    #[serde(default)]
    pub graph_root: PathBuf,

    /// Optional separate directory for the writable image store; the graph
    /// root's image store then becomes an additional read-only one.
    #[serde(default)]
    pub image_store: Option<PathBuf>,

    /// Differencing driver name; empty means the built-in `dir` driver.
    #[serde(default)]
    pub graph_driver_name: String,

    /// Driver-specific options, as `key=value` strings.
    #[serde(default)]
    pub graph_driver_options: Vec<String>,

    /// Default ID mappings for layers created without explicit ones.
    #[serde(default)]
    pub uid_map: Vec<IdMap>,
    #[serde(default)]
    pub gid_map: Vec<IdMap>,

    /// Bounds for automatically allocated user namespaces.
    #[serde(default)]
    pub auto_ns_min_size: Option<u32>,
    #[serde(default)]
    pub auto_ns_max_size: Option<u32>,

    /// Subordinate host UID/GID ranges to allocate namespaces from.
    #[serde(default)]
    pub auto_userns_uids: Vec<IdRange>,
    #[serde(default)]
    pub auto_userns_gids: Vec<IdRange>,

    /// Free-form options recorded for image-pulling tooling.
    #[serde(default)]
    pub pull_options: HashMap<String, String>,

    /// Ignore per-container volatile requests.
    #[serde(default)]
    pub disable_volatile: bool,

    /// Keep container records in the run root so they vanish on reboot.
    #[serde(default)]
    pub transient_store: bool,
}

impl StoreOptions {
    /// Options rooted at explicit run/graph directories, with defaults for
    /// everything else.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(run_root: P, graph_root: Q) -> Self {
        Self {
            run_root: run_root.into(),
            graph_root: graph_root.into(),
            ..Default::default()
        }
    }

    /// Parse options from a `storage.conf`-style TOML fragment.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::IncompleteOptions`] if the content is not
    /// valid TOML for this structure.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| StoreError::IncompleteOptions(format!("parsing options: {e}")))
    }

    /// The effective driver name (`dir` when unset).
    pub fn driver_name(&self) -> &str {
        if self.graph_driver_name.is_empty() {
            "dir"
        } else {
            &self.graph_driver_name
        }
    }

    /// Reject option sets the engine cannot start from.
    pub fn validate(&self) -> Result<()> {
        if self.graph_root.as_os_str().is_empty() {
            return Err(StoreError::IncompleteOptions(
                "no storage root specified".into(),
            ));
        }
        if self.run_root.as_os_str().is_empty() {
            return Err(StoreError::IncompleteOptions(
                "no run root specified".into(),
            ));
        }
        crate::idset::has_overlapping_ranges(&self.uid_map, &self.gid_map)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_options() {
        let options = StoreOptions::from_toml(
            r#"
run_root = "/run/containers/storage"
graph_root = "/var/lib/containers/storage"
graph_driver_name = "dir"
auto_userns_uids = [{ start = 100000, length = 65536 }]
"#,
        )
        .unwrap();
        assert_eq!(options.run_root, PathBuf::from("/run/containers/storage"));
        assert_eq!(options.driver_name(), "dir");
        assert_eq!(options.auto_userns_uids[0].start, 100000);
        options.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_roots() {
        let options = StoreOptions::default();
        assert!(matches!(
            options.validate(),
            Err(StoreError::IncompleteOptions(_))
        ));
    }

    #[test]
    fn test_default_driver_name() {
        let options = StoreOptions::new("/tmp/run", "/tmp/graph");
        assert_eq!(options.driver_name(), "dir");
    }
}
