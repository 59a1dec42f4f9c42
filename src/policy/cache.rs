//! Compiled policy cache
//!
//! A cache root holds one directory per kernel feature set, named
//! `<features id>.<n>`. Each directory carries a `.features` file recording
//! the set its blobs were compiled for, plus the blobs themselves. The
//! numeric suffix only separates feature sets whose short ids collide.
//!
//! Handles are reference counted: cloning takes a reference and dropping
//! releases it; the directory descriptor closes with the last reference.
//! Mutating operations on one cache from several threads must be serialized
//! by the caller.

use crate::config::types::{ArmorError, Result};
use crate::kernel::interface::{KernelInterface, SecurityfsInterface};
use crate::kernel::probe;
use crate::policy::blacklist::is_blacklisted;
use crate::policy::features::FeatureSet;
use crate::safety::cleanup::{clear_dir_contents, clear_open_dir};
use crate::utils::io::{last_errno, restore_errno};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem::ManuallyDrop;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the feature record inside a cache directory
pub const FEATURES_FILE: &str = ".features";

/// Most cache generations kept per root
pub const MAX_CACHES_SUPPORTED: u16 = 1;

/// How a cache directory relates to a live feature set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    /// Recorded features equal the live set
    Match,
    /// No feature record yet; free to take
    Absent,
    /// Recorded for a different feature set
    Mismatch,
}

/// Where a feature set's cache lives under a root
#[derive(Debug, Clone)]
struct Resolution {
    path: PathBuf,
    state: CandidateState,
    /// The first candidate belonged to another feature set
    collided: bool,
}

fn candidate_state(dir: &Path, features: &FeatureSet) -> Result<CandidateState> {
    match FeatureSet::from_path(dir.join(FEATURES_FILE)) {
        Ok(stored) if stored == *features => Ok(CandidateState::Match),
        Ok(_) => Ok(CandidateState::Mismatch),
        Err(err) if err.is_not_found() => Ok(CandidateState::Absent),
        Err(err) => Err(err),
    }
}

/// Numeric suffixes of `<id>.<n>` entries under `root`.
fn existing_suffixes(root: &Path, id: &str) -> Result<Vec<u64>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ArmorError::at_path(root, err)),
    };

    let prefix = format!("{}.", id);
    let mut suffixes = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ArmorError::at_path(root, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(n) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
            suffixes.push(n);
        }
    }
    suffixes.sort_unstable();
    Ok(suffixes)
}

/// First `<id>.<n>` directory under `root` that holds a feature record,
/// whatever feature set it was built for.
fn find_any_generation(root: &Path) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ArmorError::at_path(root, err)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ArmorError::at_path(root, e))?;
        names.push(entry.file_name());
    }
    names.sort();

    for name in names {
        let Some(text) = name.to_str() else { continue };
        let is_generation = text
            .rsplit_once('.')
            .map_or(false, |(id, n)| !id.is_empty() && n.parse::<u64>().is_ok());
        if !is_generation {
            continue;
        }
        let dir = root.join(&name);
        if dir.join(FEATURES_FILE).is_file() {
            return Ok(Some(dir));
        }
    }
    Ok(None)
}

fn cache_dir_name(id: &str, n: u64) -> String {
    format!("{}.{}", id, n)
}

fn resolve_cache_dir(root: &Path, features: &FeatureSet) -> Result<Resolution> {
    let id = features.id();
    let first = root.join(cache_dir_name(id, 0));

    match candidate_state(&first, features)? {
        CandidateState::Mismatch => {}
        state => {
            return Ok(Resolution {
                path: first,
                state,
                collided: false,
            })
        }
    }

    log::warn!(
        "Cache {} belongs to a different feature set, scanning for id {}",
        first.display(),
        id
    );

    let suffixes = existing_suffixes(root, id)?;
    for n in suffixes.iter().copied().filter(|n| *n != 0) {
        let path = root.join(cache_dir_name(id, n));
        match candidate_state(&path, features)? {
            CandidateState::Mismatch => continue,
            state => {
                return Ok(Resolution {
                    path,
                    state,
                    collided: true,
                })
            }
        }
    }

    let next = suffixes
        .last()
        .copied()
        .unwrap_or(0)
        .checked_add(1)
        .ok_or_else(|| ArmorError::NotSupported(format!("cache suffixes for {} exhausted", id)))?;
    Ok(Resolution {
        path: root.join(cache_dir_name(id, next)),
        state: CandidateState::Absent,
        collided: true,
    })
}

fn resolve_root(root_dir: Option<&Path>, path: &Path) -> PathBuf {
    match root_dir {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}

fn open_dir(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open(path)
}

/// Create a private (0700) directory; an existing one is fine.
fn create_dir_tolerant(path: &Path) -> Result<()> {
    match nix::unistd::mkdir(path, Mode::S_IRWXU) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(ArmorError::at_path(
            path,
            io::Error::from_raw_os_error(errno as i32),
        )),
    }
}

struct CacheInner {
    dir: ManuallyDrop<File>,
    path: PathBuf,
    features: FeatureSet,
    kernel_features: FeatureSet,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let saved = last_errno();
        // SAFETY: dir is never touched again after this point.
        unsafe { ManuallyDrop::drop(&mut self.dir) };
        restore_errno(saved);
    }
}

/// Open handle on one cache directory
#[derive(Clone)]
pub struct PolicyCache {
    inner: Arc<CacheInner>,
}

impl PolicyCache {
    /// Open the cache for `features` (kernel features when `None`) under
    /// `path`, relative to `root_dir` when given.
    ///
    /// `max_caches` of 0 only opens an existing matching cache; 1 creates or
    /// rebuilds it as needed. Larger values are not supported.
    pub fn new(
        features: Option<&FeatureSet>,
        root_dir: Option<&Path>,
        path: &Path,
        max_caches: u16,
    ) -> Result<Self> {
        if max_caches > MAX_CACHES_SUPPORTED {
            return Err(ArmorError::NotSupported(format!(
                "max_caches {} (at most {} supported)",
                max_caches, MAX_CACHES_SUPPORTED
            )));
        }
        let create = max_caches > 0;

        let kernel_features = match features {
            Some(features) => features.clone(),
            None => FeatureSet::from_kernel(probe::system())?,
        };

        let root = resolve_root(root_dir, path);
        let resolution = resolve_cache_dir(&root, &kernel_features)?;
        let dir_path = resolution.path;

        let dir = match open_dir(&dir_path) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if !create {
                    if resolution.collided {
                        return Err(ArmorError::AlreadyExists(
                            root.join(cache_dir_name(kernel_features.id(), 0)),
                        ));
                    }
                    if let Some(stale) = find_any_generation(&root)? {
                        log::warn!(
                            "Policy cache {} was built for other features, not creating {}",
                            stale.display(),
                            dir_path.display()
                        );
                        return Err(ArmorError::AlreadyExists(stale));
                    }
                    return Err(ArmorError::at_path(&dir_path, err));
                }
                log::info!("Creating policy cache {}", dir_path.display());
                create_dir_tolerant(&root)?;
                create_dir_tolerant(&dir_path)?;
                open_dir(&dir_path).map_err(|e| ArmorError::at_path(&dir_path, e))?
            }
            Err(err) => return Err(ArmorError::at_path(&dir_path, err)),
        };

        let features = init_cache_features(&dir, &dir_path, &kernel_features, create)?;
        log::debug!(
            "Opened policy cache {} ({:?})",
            dir_path.display(),
            resolution.state
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                dir: ManuallyDrop::new(dir),
                path: dir_path,
                features,
                kernel_features,
            }),
        })
    }

    /// Directory `new` would use for these arguments, without touching disk
    /// beyond reading existing feature records.
    pub fn dir_path_preview(
        features: Option<&FeatureSet>,
        root_dir: Option<&Path>,
        path: &Path,
    ) -> Result<PathBuf> {
        let kernel_features = match features {
            Some(features) => features.clone(),
            None => FeatureSet::from_kernel(probe::system())?,
        };
        let root = resolve_root(root_dir, path);
        Ok(resolve_cache_dir(&root, &kernel_features)?.path)
    }

    /// Empty the directory at `path`, keeping the directory itself.
    pub fn remove(root_dir: Option<&Path>, path: &Path) -> Result<()> {
        clear_dir_contents(&resolve_root(root_dir, path))
    }

    /// Release a handle; `None` is accepted and ignored.
    pub fn unref(cache: Option<PolicyCache>) {
        drop(cache);
    }

    /// Live references to this cache
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Path the cache was opened at
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Resolve the open directory back to a filesystem path.
    pub fn dir_path(&self) -> Result<PathBuf> {
        let link = PathBuf::from(format!("/proc/self/fd/{}", self.inner.dir.as_raw_fd()));
        fs::read_link(&link).map_err(|e| ArmorError::at_path(&link, e))
    }

    /// Directory levels below the cache root
    pub fn dir_levels(&self) -> usize {
        1
    }

    /// Features recorded in the cache
    pub fn features(&self) -> &FeatureSet {
        &self.inner.features
    }

    /// Features the cache was opened for
    pub fn kernel_features(&self) -> &FeatureSet {
        &self.inner.kernel_features
    }

    /// Wipe the cache and record the live feature set again.
    pub fn rebuild(&self) -> Result<()> {
        create_cache(&self.inner.dir, &self.inner.path, &self.inner.kernel_features)
    }

    /// Replace kernel policy with every blob in the cache.
    ///
    /// Subdirectories and blacklisted names are skipped. Stops at the first
    /// failure. Without an interface one is built from the kernel features.
    pub fn replace_all(&self, kernel_interface: Option<&dyn KernelInterface>) -> Result<()> {
        let owned;
        let iface: &dyn KernelInterface = match kernel_interface {
            Some(iface) => iface,
            None => {
                owned = SecurityfsInterface::from_prober(
                    probe::system(),
                    Some(&self.inner.kernel_features),
                )?;
                &owned
            }
        };

        let path = &self.inner.path;
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| ArmorError::at_path(path, e))? {
            let entry = entry.map_err(|e| ArmorError::at_path(path, e))?;
            entries.push(entry.file_name());
        }
        entries.sort();

        let mut replaced = 0usize;
        for name in entries {
            let file = path.join(&name);
            let meta = fs::metadata(&file).map_err(|e| ArmorError::at_path(&file, e))?;
            if meta.is_dir() || is_blacklisted(&name.to_string_lossy()) {
                continue;
            }
            iface.replace_policy_from_file(&file)?;
            replaced += 1;
        }

        log::info!("Replaced {} policies from {}", replaced, path.display());
        Ok(())
    }
}

impl std::fmt::Debug for PolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCache")
            .field("path", &self.inner.path)
            .field("features", &self.inner.features.id())
            .finish()
    }
}

/// Clear the directory and write a fresh feature record.
fn create_cache(dir: &File, dir_path: &Path, features: &FeatureSet) -> Result<()> {
    clear_open_dir(dir)?;
    features.write_to_file(dir_path.join(FEATURES_FILE))
}

/// Check the feature record of an opened cache, rebuilding it when allowed.
fn init_cache_features(
    dir: &File,
    dir_path: &Path,
    kernel_features: &FeatureSet,
    create: bool,
) -> Result<FeatureSet> {
    match FeatureSet::from_path(dir_path.join(FEATURES_FILE)) {
        Ok(stored) if stored == *kernel_features => return Ok(stored),
        Ok(_) if !create => return Err(ArmorError::AlreadyExists(dir_path.to_path_buf())),
        Ok(_) => log::info!("Feature set changed, rebuilding {}", dir_path.display()),
        Err(err) if err.is_not_found() && create => {}
        Err(err) => return Err(err),
    }

    create_cache(dir, dir_path, kernel_features)?;
    Ok(kernel_features.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(text: &str) -> FeatureSet {
        FeatureSet::from_string(text)
    }

    #[test]
    fn test_max_caches_above_one_not_supported() {
        let tmp = tempfile::tempdir().unwrap();
        let err = PolicyCache::new(Some(&features("a {}\n")), None, tmp.path(), 2).unwrap_err();
        assert!(matches!(err, ArmorError::NotSupported(_)));
    }

    #[test]
    fn test_create_names_dir_after_feature_id() {
        let tmp = tempfile::tempdir().unwrap();
        let fs_a = features("a {}\n");
        let root = tmp.path().join("cache");

        let cache = PolicyCache::new(Some(&fs_a), None, &root, 1).unwrap();
        assert_eq!(cache.path(), root.join(format!("{}.0", fs_a.id())));
        assert_eq!(
            FeatureSet::from_path(cache.path().join(FEATURES_FILE)).unwrap(),
            fs_a
        );
        assert_eq!(cache.features(), &fs_a);
        assert_eq!(cache.dir_levels(), 1);
    }

    #[test]
    fn test_relative_path_joins_root_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let fs_a = features("a {}\n");
        let cache = PolicyCache::new(Some(&fs_a), Some(tmp.path()), Path::new("sub"), 1).unwrap();
        assert!(cache.path().starts_with(tmp.path().join("sub")));
    }

    #[test]
    fn test_missing_cache_without_creation_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = PolicyCache::new(Some(&features("a {}\n")), None, tmp.path(), 0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_stale_record_without_creation_is_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let fs_a = features("a {}\n");
        let dir = tmp.path().join(format!("{}.0", fs_a.id()));
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join(FEATURES_FILE), "something else").unwrap();

        let err = PolicyCache::new(Some(&fs_a), None, tmp.path(), 0).unwrap_err();
        assert!(matches!(err, ArmorError::AlreadyExists(_)));
    }

    #[test]
    fn test_changed_features_without_creation_report_existing_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let fs_a = features("a {}\n");
        let fs_b = features("b {}\n");
        let old = PolicyCache::new(Some(&fs_a), None, tmp.path(), 1).unwrap();
        let old_path = old.path().to_path_buf();
        drop(old);

        let err = PolicyCache::new(Some(&fs_b), None, tmp.path(), 0).unwrap_err();
        match err {
            ArmorError::AlreadyExists(path) => assert_eq!(path, old_path),
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
        assert!(!tmp.path().join(format!("{}.0", fs_b.id())).exists());
    }

    #[test]
    fn test_unrelated_entries_do_not_count_as_cache() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("notes")).unwrap();
        fs::create_dir(tmp.path().join("abcd.1")).unwrap();

        let err = PolicyCache::new(Some(&features("a {}\n")), None, tmp.path(), 0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rebuild_clears_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let fs_a = features("a {}\n");
        let cache = PolicyCache::new(Some(&fs_a), None, tmp.path(), 1).unwrap();
        fs::write(cache.path().join("a.bin"), b"blob").unwrap();

        cache.rebuild().unwrap();
        let names: Vec<_> = fs::read_dir(cache.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(FEATURES_FILE)]);
    }

    #[test]
    fn test_created_dirs_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let cache = PolicyCache::new(Some(&features("a {}\n")), None, &root, 1).unwrap();

        let mode = fs::metadata(cache.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_drop_preserves_errno() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = PolicyCache::new(Some(&features("a {}\n")), None, tmp.path(), 1).unwrap();

        restore_errno(libc::EPROTO);
        PolicyCache::unref(Some(cache));
        assert_eq!(last_errno(), libc::EPROTO);
        PolicyCache::unref(None);
    }
}
