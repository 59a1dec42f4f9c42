/// Fake kernel trees for exercising the bridge without AppArmor
///
/// Lays out `proc/`, `sys/module/apparmor/parameters/` and a securityfs
/// directory under a caller supplied scratch directory, mirroring the real
/// pseudo filesystems closely enough for every client to run against it.
/// Attribute files are regular files, so a write is observable afterwards.
use crate::config::config::BridgeConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Handle on a fake kernel tree rooted at `base`
#[derive(Debug, Clone)]
pub struct FakeKernel {
    base: PathBuf,
    config: BridgeConfig,
}

impl FakeKernel {
    /// Create an empty tree: no module parameters, no securityfs mount.
    pub fn new<P: AsRef<Path>>(base: P) -> io::Result<Self> {
        let base = base.as_ref().to_path_buf();
        let config = BridgeConfig::rooted_at(&base);
        fs::create_dir_all(&config.proc_root)?;
        fs::write(&config.mounts_file, b"proc /proc proc rw,nosuid,nodev,noexec 0 0\n")?;
        Ok(Self { base, config })
    }

    pub fn config(&self) -> BridgeConfig {
        self.config.clone()
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory exposed as `<securityfs>/apparmor` once mounted
    pub fn apparmorfs(&self) -> PathBuf {
        self.config.securityfs_fallback.clone()
    }

    fn set_param(&self, name: &str, value: bool) -> io::Result<()> {
        fs::create_dir_all(&self.config.sysfs_params)?;
        let byte: &[u8] = if value { b"Y\n" } else { b"N\n" };
        fs::write(self.config.param_path(name), byte)
    }

    pub fn set_enabled(&self, value: bool) -> io::Result<()> {
        self.set_param("enabled", value)
    }

    pub fn set_available(&self, value: bool) -> io::Result<()> {
        self.set_param("available", value)
    }

    /// Create the securityfs apparmor directory and list it in the mount table.
    pub fn mount_securityfs(&self) -> io::Result<PathBuf> {
        let dir = self.apparmorfs();
        fs::create_dir_all(&dir)?;

        let target = dir.parent().unwrap_or(&dir);
        let line = format!(
            "securityfs {} securityfs rw,nosuid,nodev,noexec,relatime 0 0\n",
            target.display().to_string().replace(' ', "\\040")
        );
        let mut table = fs::read_to_string(&self.config.mounts_file).unwrap_or_default();
        table.push_str(&line);
        fs::write(&self.config.mounts_file, table)?;
        Ok(dir)
    }

    /// Attribute directory of `tid`, stacking or legacy layout
    pub fn attr_dir(&self, tid: i32, stacking: bool) -> PathBuf {
        let dir = self.config.proc_root.join(tid.to_string()).join("attr");
        if stacking {
            dir.join("apparmor")
        } else {
            dir
        }
    }

    /// Create `current` and `exec` attribute files for `tid`.
    pub fn add_task(&self, tid: i32, stacking: bool) -> io::Result<PathBuf> {
        let dir = self.attr_dir(tid, stacking);
        fs::create_dir_all(&dir)?;
        for attr in ["current", "exec"] {
            let path = dir.join(attr);
            if !path.exists() {
                fs::write(&path, b"")?;
            }
        }
        Ok(dir)
    }

    /// Overwrite an attribute file with `contents`.
    pub fn set_attr(&self, tid: i32, stacking: bool, attr: &str, contents: &[u8]) -> io::Result<()> {
        let dir = self.add_task(tid, stacking)?;
        fs::write(dir.join(attr), contents)
    }

    /// Read back whatever was last written to an attribute file.
    pub fn read_attr(&self, tid: i32, stacking: bool, attr: &str) -> io::Result<Vec<u8>> {
        fs::read(self.attr_dir(tid, stacking).join(attr))
    }

    /// Populate `<apparmorfs>/features` from `(relative path, contents)` pairs.
    pub fn write_features(&self, entries: &[(&str, &str)]) -> io::Result<PathBuf> {
        let root = self.apparmorfs().join("features");
        for (rel, contents) in entries {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tree_has_no_module() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new(tmp.path()).unwrap();
        let config = kernel.config();

        assert!(config.proc_root.is_dir());
        assert!(!config.param_path("enabled").exists());
        assert!(!kernel.apparmorfs().exists());
    }

    #[test]
    fn test_mount_adds_securityfs_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new(tmp.path()).unwrap();
        let dir = kernel.mount_securityfs().unwrap();

        assert!(dir.is_dir());
        let table = fs::read_to_string(kernel.config().mounts_file).unwrap();
        assert!(table.lines().any(|l| l.starts_with("securityfs ")));
    }

    #[test]
    fn test_attr_files_are_created_per_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new(tmp.path()).unwrap();

        kernel.set_attr(10, true, "current", b"foo (enforce)\n").unwrap();
        assert_eq!(kernel.read_attr(10, true, "current").unwrap(), b"foo (enforce)\n");
        assert!(kernel.attr_dir(10, true).join("exec").exists());
        assert!(!kernel.attr_dir(10, false).join("current").exists());
    }
}
