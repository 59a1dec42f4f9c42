/// Configuration loading for the kernel interface roots
use crate::config::types::{ArmorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a JSON configuration file
pub const CONFIG_ENV_VAR: &str = "AABRIDGE_CONFIG";

/// Filesystem roots consulted by every component.
///
/// Production code uses [`BridgeConfig::default`]; tests point these at a
/// scratch directory laid out like the real pseudo filesystems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Root of the proc filesystem (`/proc/<tid>/attr/...`)
    pub proc_root: PathBuf,
    /// Module parameter directory holding `enabled` and `available`
    pub sysfs_params: PathBuf,
    /// Mount table scanned for securityfs
    pub mounts_file: PathBuf,
    /// Interface directory used when the mount table has no securityfs entry
    pub securityfs_fallback: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sysfs_params: PathBuf::from("/sys/module/apparmor/parameters"),
            mounts_file: PathBuf::from("/proc/mounts"),
            securityfs_fallback: PathBuf::from("/sys/kernel/security/apparmor"),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArmorError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: BridgeConfig = serde_json::from_str(&content)
            .map_err(|e| ArmorError::Config(format!("Failed to parse config JSON: {}", e)))?;

        Ok(config)
    }

    /// Load from `$AABRIDGE_CONFIG` when set, otherwise the system defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load_from_file(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Same layout rooted under `base`, used to build fake kernel trees.
    pub fn rooted_at<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        Self {
            proc_root: base.join("proc"),
            sysfs_params: base.join("sys/module/apparmor/parameters"),
            mounts_file: base.join("proc/mounts"),
            securityfs_fallback: base.join("sys/kernel/security/apparmor"),
        }
    }

    /// Path of a single module parameter file
    pub fn param_path(&self, name: &str) -> PathBuf {
        self.sysfs_params.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_system_layout() {
        let config = BridgeConfig::default();
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert_eq!(
            config.param_path("enabled"),
            PathBuf::from("/sys/module/apparmor/parameters/enabled")
        );
    }

    #[test]
    fn test_load_partial_json_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "proc_root": "/tmp/fakeproc" }}"#).unwrap();

        let config = BridgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.proc_root, PathBuf::from("/tmp/fakeproc"));
        assert_eq!(config.mounts_file, PathBuf::from("/proc/mounts"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "proc_rot": "/tmp" }}"#).unwrap();

        let err = BridgeConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ArmorError::Config(_)));
    }

    #[test]
    fn test_rooted_layout() {
        let config = BridgeConfig::rooted_at("/tmp/x");
        assert_eq!(config.mounts_file, PathBuf::from("/tmp/x/proc/mounts"));
        assert_eq!(
            config.securityfs_fallback,
            PathBuf::from("/tmp/x/sys/kernel/security/apparmor")
        );
    }
}
