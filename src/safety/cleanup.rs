/// Directory content removal for policy cache resets
///
/// Walks with openat/fstatat/unlinkat relative to already opened directory
/// descriptors so a rename of the cache root mid-walk cannot redirect the
/// removal elsewhere. Symlinks are never followed.
use crate::config::types::{ArmorError, Result};
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct FdGuard(RawFd);

impl FdGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            // SAFETY: the guard owns this descriptor and closes it once.
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

struct DirStream(*mut libc::DIR);

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: the stream came from a successful fdopendir and is closed once.
        unsafe {
            libc::closedir(self.0);
        }
    }
}

fn os_error(context: &str) -> ArmorError {
    let err = std::io::Error::last_os_error();
    log::debug!("{} failed: {}", context, err);
    ArmorError::Io(err)
}

fn open_dir_nofollow(path: &Path) -> Result<FdGuard> {
    let path_c = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ArmorError::InvalidArgument(format!("path contains NUL byte: {}", path.display()))
    })?;

    // SAFETY: path_c is a valid NUL terminated string for the duration of the call.
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if fd < 0 {
        return Err(ArmorError::at_path(path, std::io::Error::last_os_error()));
    }

    Ok(FdGuard(fd))
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: name is NUL terminated and st points to writable stat storage.
    let rc = unsafe {
        libc::fstatat(
            parent_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(os_error("fstatat"));
    }

    // SAFETY: fstatat returned 0, so the kernel filled the struct (it was zeroed anyway).
    Ok(unsafe { st.assume_init() })
}

fn remove_entry_at(parent_fd: RawFd, name: &CStr, flags: i32) -> Result<()> {
    // SAFETY: name is NUL terminated; parent_fd is checked by the kernel.
    let rc = unsafe { libc::unlinkat(parent_fd, name.as_ptr(), flags) };
    if rc != 0 {
        return Err(os_error("unlinkat"));
    }
    Ok(())
}

fn recurse_remove_dir(parent_fd: RawFd, name: &CStr) -> Result<()> {
    // SAFETY: name is NUL terminated; parent_fd is checked by the kernel.
    let child_fd = unsafe {
        libc::openat(
            parent_fd,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if child_fd < 0 {
        return Err(os_error("openat"));
    }
    let child = FdGuard(child_fd);

    clear_dir_contents_fd(child.as_raw_fd())?;
    remove_entry_at(parent_fd, name, libc::AT_REMOVEDIR)
}

/// Collect entry names first so unlinking never races the readdir cursor.
fn entry_names(dir_fd: RawFd) -> Result<Vec<CString>> {
    // SAFETY: dup only reads the descriptor number; a bad fd yields -1.
    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(os_error("dup"));
    }

    // SAFETY: iter_fd is a fresh descriptor we own; on success the stream takes it over.
    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        // SAFETY: fdopendir failed, so iter_fd is still ours to close.
        unsafe {
            libc::close(iter_fd);
        }
        return Err(os_error("fdopendir"));
    }
    let stream = DirStream(dir);
    // SAFETY: stream holds a live DIR pointer.
    unsafe { libc::rewinddir(stream.0) };

    let mut names = Vec::new();
    loop {
        crate::utils::io::restore_errno(0);
        // SAFETY: stream holds a live DIR pointer used from this thread only.
        let entry = unsafe { libc::readdir(stream.0) };
        if entry.is_null() {
            let errno = crate::utils::io::last_errno();
            if errno != 0 {
                return Err(ArmorError::Io(std::io::Error::from_raw_os_error(errno)));
            }
            break;
        }

        // SAFETY: entry is non-null and d_name is NUL terminated; it stays valid
        // until the next readdir, and the name is copied before that.
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(name.to_owned());
    }

    Ok(names)
}

/// Remove every regular file and subdirectory below an open directory.
///
/// The directory itself is kept. Entries that are neither regular files nor
/// directories are left in place.
pub fn clear_dir_contents_fd(dir_fd: RawFd) -> Result<()> {
    for name in entry_names(dir_fd)? {
        let st = fstatat_nofollow(dir_fd, &name)?;
        match st.st_mode & libc::S_IFMT {
            libc::S_IFREG => remove_entry_at(dir_fd, &name, 0)?,
            libc::S_IFDIR => recurse_remove_dir(dir_fd, &name)?,
            _ => log::debug!("Leaving non-regular cache entry {:?} in place", name),
        }
    }

    Ok(())
}

/// Remove every regular file and subdirectory below `path`, keeping `path`.
pub fn clear_dir_contents(path: &Path) -> Result<()> {
    let dir = open_dir_nofollow(path)?;
    clear_dir_contents_fd(dir.as_raw_fd())
}

/// Same as [`clear_dir_contents`] for a directory held open by the caller.
pub fn clear_open_dir<D: AsRawFd>(dir: &D) -> Result<()> {
    clear_dir_contents_fd(dir.as_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_clear_keeps_root_and_removes_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("a.bin"), b"blob").unwrap();
        fs::write(root.join(".features"), b"caps {}").unwrap();
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("sub/deeper/b.bin"), b"blob").unwrap();

        clear_dir_contents(root).unwrap();

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(root).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_does_not_follow_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("outside");
        let cache = tmp.path().join("cache");
        fs::create_dir(&outside).unwrap();
        fs::create_dir(&cache).unwrap();
        fs::write(outside.join("keep.bin"), b"x").unwrap();
        std::os::unix::fs::symlink(&outside, cache.join("link")).unwrap();

        clear_dir_contents(&cache).unwrap();

        assert!(outside.join("keep.bin").exists());
    }

    #[test]
    fn test_clear_missing_dir_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = clear_dir_contents(&tmp.path().join("missing")).unwrap_err();
        assert!(err.is_not_found());
    }
}
