//! Policy load interface (`.load`, `.replace`, `.remove`)

use crate::config::types::{ArmorError, Result};
use crate::kernel::probe::Prober;
use crate::policy::features::FeatureSet;
use crate::utils::io::write_once;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Marker at the start of every compiled profile in a blob
pub const PROFILE_HEADER: &[u8] = b"\x04\x08\x00version\x00";

/// Feature that lets the kernel take a whole profile set in one write
pub const SET_LOAD_FEATURE: &str = "policy/set_load";

/// Something that can push compiled policy into the kernel
pub trait KernelInterface {
    fn load_policy(&self, blob: &[u8]) -> Result<()>;

    fn replace_policy(&self, blob: &[u8]) -> Result<()>;

    /// Remove the profile with fully qualified name `fqname`.
    fn remove_policy(&self, fqname: &str) -> Result<()>;

    fn load_policy_from_file(&self, path: &Path) -> Result<()> {
        let blob = fs::read(path).map_err(|e| ArmorError::at_path(path, e))?;
        self.load_policy(&blob)
    }

    fn replace_policy_from_file(&self, path: &Path) -> Result<()> {
        let blob = fs::read(path).map_err(|e| ArmorError::at_path(path, e))?;
        self.replace_policy(&blob)
    }
}

/// Writes to the securityfs policy files
#[derive(Debug, Clone)]
pub struct SecurityfsInterface {
    dir: PathBuf,
    supports_setload: bool,
}

impl SecurityfsInterface {
    /// Interface rooted at `dir`, an apparmorfs directory.
    pub fn new(dir: impl Into<PathBuf>, features: Option<&FeatureSet>) -> Self {
        Self {
            dir: dir.into(),
            supports_setload: features.map_or(false, |f| f.supports(SET_LOAD_FEATURE)),
        }
    }

    /// Interface discovered through `prober`, with kernel features when none are given.
    pub fn from_prober(prober: &Prober, features: Option<&FeatureSet>) -> Result<Self> {
        let dir = prober.interface_dir()?;
        match features {
            Some(features) => Ok(Self::new(dir, Some(features))),
            None => {
                let kernel = FeatureSet::from_kernel(prober)?;
                Ok(Self::new(dir, Some(&kernel)))
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn supports_setload(&self) -> bool {
        self.supports_setload
    }

    fn open(&self, name: &str) -> Result<File> {
        let path = self.dir.join(name);
        OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| ArmorError::at_path(&path, e))
    }

    fn write_policy(&self, name: &str, blob: &[u8]) -> Result<()> {
        let mut file = self.open(name)?;

        if self.supports_setload {
            return write_once(&mut file, blob);
        }

        for profile in split_profiles(blob) {
            write_once(&mut file, profile)?;
        }
        Ok(())
    }
}

impl KernelInterface for SecurityfsInterface {
    fn load_policy(&self, blob: &[u8]) -> Result<()> {
        self.write_policy(".load", blob)
    }

    fn replace_policy(&self, blob: &[u8]) -> Result<()> {
        self.write_policy(".replace", blob)
    }

    fn remove_policy(&self, fqname: &str) -> Result<()> {
        let mut command = Vec::with_capacity(fqname.len() + 1);
        command.extend_from_slice(fqname.as_bytes());
        command.push(0);
        write_once(&mut self.open(".remove")?, &command)
    }
}

/// Split a blob into single profiles for kernels without set loads.
pub fn split_profiles(blob: &[u8]) -> Vec<&[u8]> {
    let mut profiles = Vec::new();
    let mut start = 0;

    while start < blob.len() {
        let search_from = start + PROFILE_HEADER.len();
        let next = blob
            .get(search_from..)
            .and_then(|rest| {
                rest.windows(PROFILE_HEADER.len())
                    .position(|w| w == PROFILE_HEADER)
            })
            .map(|offset| search_from + offset);

        match next {
            Some(end) => {
                profiles.push(&blob[start..end]);
                start = end;
            }
            None => {
                profiles.push(&blob[start..]);
                break;
            }
        }
    }
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(body: &[u8]) -> Vec<u8> {
        let mut p = PROFILE_HEADER.to_vec();
        p.extend_from_slice(body);
        p
    }

    #[test]
    fn test_split_profiles_on_header() {
        let mut blob = profile(b"one");
        blob.extend(profile(b"two"));
        blob.extend(profile(b"three"));

        let parts = split_profiles(&blob);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], profile(b"two").as_slice());
        assert!(split_profiles(&[]).is_empty());
    }

    #[test]
    fn test_replace_without_set_load_writes_each_profile() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".replace"), b"").unwrap();
        let iface = SecurityfsInterface::new(tmp.path(), None);
        assert!(!iface.supports_setload());

        let mut blob = profile(b"a");
        blob.extend(profile(b"b"));
        iface.replace_policy(&blob).unwrap();

        // Regular files accumulate successive writes.
        assert_eq!(fs::read(tmp.path().join(".replace")).unwrap(), blob);
    }

    #[test]
    fn test_set_load_feature_detected() {
        let features = FeatureSet::from_string("policy {set_load {yes\n}\n}\n");
        let iface = SecurityfsInterface::new("/nonexistent", Some(&features));
        assert!(iface.supports_setload());
    }

    #[test]
    fn test_remove_writes_nul_terminated_name() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".remove"), b"").unwrap();
        let iface = SecurityfsInterface::new(tmp.path(), None);

        iface.remove_policy("/usr/bin/foo").unwrap();
        assert_eq!(fs::read(tmp.path().join(".remove")).unwrap(), b"/usr/bin/foo\0");
    }

    #[test]
    fn test_missing_interface_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let iface = SecurityfsInterface::new(tmp.path(), None);
        let err = iface.load_policy(b"x").unwrap_err();
        assert!(err.is_not_found());
    }
}
