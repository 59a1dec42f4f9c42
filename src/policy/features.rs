//! Kernel feature sets
//!
//! A feature set is the flattened text form of `<apparmorfs>/features`: each
//! entry becomes `name {contents}\n`, directories nesting their children.
//! Compiled policy is only valid for the feature set it was built against,
//! so the policy cache keys its directories on [`FeatureSet::id`].

use crate::config::types::{ArmorError, Result};
use crate::kernel::probe::Prober;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Hex digits of the digest kept in a feature set id
pub const FEATURES_ID_LEN: usize = 8;

struct FeatureData {
    text: String,
    id: String,
}

/// Shared, immutable feature set
///
/// Cloning takes another reference; equality compares the text.
#[derive(Clone)]
pub struct FeatureSet {
    inner: Arc<FeatureData>,
}

impl FeatureSet {
    pub fn from_string(text: impl Into<String>) -> Self {
        let text = text.into();
        let digest = Sha256::digest(text.as_bytes());
        let id = digest
            .iter()
            .take(FEATURES_ID_LEN / 2)
            .map(|b| format!("{:02x}", b))
            .collect();
        Self {
            inner: Arc::new(FeatureData { text, id }),
        }
    }

    /// Load from a flattened file or walk a features directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(|e| ArmorError::at_path(path, e))?;

        let text = if meta.is_dir() {
            let mut text = String::new();
            flatten_dir(path, &mut text)?;
            text
        } else {
            let bytes = fs::read(path).map_err(|e| ArmorError::at_path(path, e))?;
            String::from_utf8(bytes).map_err(|_| {
                ArmorError::Protocol(format!("feature file {} is not UTF-8", path.display()))
            })?
        };

        Ok(Self::from_string(text))
    }

    /// Features advertised by the running kernel
    pub fn from_kernel(prober: &Prober) -> Result<Self> {
        let dir = prober.interface_dir()?.join("features");
        log::debug!("Loading kernel features from {}", dir.display());
        Self::from_path(dir)
    }

    pub fn as_str(&self) -> &str {
        &self.inner.text
    }

    /// Short digest naming cache directories
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Live references to this feature set
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether a slash separated feature path such as `policy/set_load` is present.
    pub fn supports(&self, feature: &str) -> bool {
        let mut scope = self.as_str();
        for component in feature.split('/').filter(|c| !c.is_empty()) {
            match child_body(scope, component) {
                Some(body) => scope = body,
                None => return false,
            }
        }
        true
    }

    /// Persist the text to `path` atomically (temp file then rename).
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArmorError::InvalidArgument(format!("{} has no file name", path.display())))?;
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name.trim_start_matches('.'), std::process::id()));

        let result = (|| -> Result<()> {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)
                .map_err(|e| ArmorError::at_path(&tmp, e))?;
            file.write_all(self.as_str().as_bytes())
                .map_err(|e| ArmorError::at_path(&tmp, e))?;
            file.sync_all().map_err(|e| ArmorError::at_path(&tmp, e))?;
            fs::rename(&tmp, path).map_err(|e| ArmorError::at_path(path, e))
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl PartialEq for FeatureSet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.text == other.inner.text
    }
}

impl Eq for FeatureSet {}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSet")
            .field("id", &self.id())
            .field("len", &self.inner.text.len())
            .finish()
    }
}

/// Append `name {contents}\n` for every visible entry under `dir`, sorted by name.
fn flatten_dir(dir: &Path, out: &mut String) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| ArmorError::at_path(dir, e))? {
        let entry = entry.map_err(|e| ArmorError::at_path(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.is_empty() || name.starts_with('.') {
            continue;
        }
        entries.push((name, entry.path()));
    }
    entries.sort();

    for (name, path) in entries {
        let meta = fs::metadata(&path).map_err(|e| ArmorError::at_path(&path, e))?;
        out.push_str(&name);
        out.push_str(" {");
        if meta.is_dir() {
            flatten_dir(&path, out)?;
        } else if meta.is_file() {
            let bytes = fs::read(&path).map_err(|e| ArmorError::at_path(&path, e))?;
            out.push_str(&String::from_utf8_lossy(&bytes));
        }
        out.push_str("}\n");
    }
    Ok(())
}

/// Body of the top level `name { ... }` block in `scope`.
fn child_body<'a>(scope: &'a str, name: &str) -> Option<&'a str> {
    let bytes = scope.as_bytes();
    let open = format!("{} {{", name);
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let at_boundary = i == 0 || matches!(bytes[i - 1], b'\n' | b' ' | b'{' | b'}');
        if depth == 0 && at_boundary && bytes[i..].starts_with(open.as_bytes()) {
            let start = i + open.len();
            let mut nested = 1usize;
            for (j, b) in bytes.iter().enumerate().skip(start) {
                match b {
                    b'{' => nested += 1,
                    b'}' => {
                        nested -= 1;
                        if nested == 0 {
                            return scope.get(start..j);
                        }
                    }
                    _ => {}
                }
            }
            return None;
        }
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("policy/versions")).unwrap();
        fs::create_dir_all(root.join("file")).unwrap();
        fs::write(root.join("policy/set_load"), "yes\n").unwrap();
        fs::write(root.join("policy/versions/v8"), "yes\n").unwrap();
        fs::write(root.join("file/mask"), "create read write exec append\n").unwrap();
        fs::write(root.join(".hidden"), "x").unwrap();
    }

    #[test]
    fn test_directory_is_flattened_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        sample_tree(tmp.path());

        let features = FeatureSet::from_path(tmp.path()).unwrap();
        assert_eq!(
            features.as_str(),
            "file {mask {create read write exec append\n}\n}\n\
             policy {set_load {yes\n}\nversions {v8 {yes\n}\n}\n}\n"
        );
    }

    #[test]
    fn test_supports_nested_paths() {
        let tmp = tempfile::tempdir().unwrap();
        sample_tree(tmp.path());
        let features = FeatureSet::from_path(tmp.path()).unwrap();

        assert!(features.supports("policy/set_load"));
        assert!(features.supports("policy/versions/v8"));
        assert!(features.supports("file"));
        assert!(!features.supports("policy/versions/v9"));
        assert!(!features.supports("set_load"));
        assert!(!features.supports("mask"));
    }

    #[test]
    fn test_id_is_stable_and_short() {
        let a = FeatureSet::from_string("caps {mask {chown}\n}\n");
        let b = FeatureSet::from_string("caps {mask {chown}\n}\n");
        let c = FeatureSet::from_string("caps {mask {chown dac}\n}\n");

        assert_eq!(a.id().len(), FEATURES_ID_LEN);
        assert!(a.id().chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(a.id(), b.id());
        assert_eq!(a, b);
        assert_ne!(a.id(), c.id());
        assert_ne!(a, c);
    }

    #[test]
    fn test_write_then_load_file() {
        let tmp = tempfile::tempdir().unwrap();
        let features = FeatureSet::from_string("policy {set_load {yes\n}\n}\n");
        let path = tmp.path().join(".features");

        features.write_to_file(&path).unwrap();
        assert_eq!(FeatureSet::from_path(&path).unwrap(), features);

        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FeatureSet::from_path(tmp.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_clone_shares_storage() {
        let a = FeatureSet::from_string("x {}\n");
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        drop(b);
        assert_eq!(a.ref_count(), 1);
    }
}
