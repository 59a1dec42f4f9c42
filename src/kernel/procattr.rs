//! Confinement transitions and task confinement queries
//!
//! Every operation is one round trip against a `/proc/<tid>/attr` file
//! selected by the [`Prober`]: a single write for transitions, a bounded
//! read loop for queries. Descriptors never outlive the call.

use crate::config::types::{ArmorError, ConfinementTarget, Result};
use crate::kernel::confinement::ConfinementContext;
use crate::kernel::probe::{self, ProcAttrTemplate, Prober};
use crate::safety::secret::SecretBuffer;
use crate::utils::io::{fill_from, gettid, write_once, FillOutcome};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Longest hat or profile name accepted, mirroring PATH_MAX
pub const MAX_NAME_LEN: usize = libc::PATH_MAX as usize;

/// First read attempt when fetching an attribute
pub const INITIAL_ATTR_BUF: usize = 64;

/// Attribute reads give up past this size
pub const MAX_ATTR_BUF: usize = 1 << 20;

const CHANGEHAT_PREFIX: &[u8] = b"changehat ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Client for the per-task attribute interface
#[derive(Clone, Copy)]
pub struct ProcAttrClient<'a> {
    prober: &'a Prober,
}

impl ProcAttrClient<'static> {
    /// Client bound to the process-wide prober
    pub fn system() -> Self {
        Self::new(probe::system())
    }
}

impl<'a> ProcAttrClient<'a> {
    pub fn new(prober: &'a Prober) -> Self {
        Self { prober }
    }

    fn open_at(path: &Path, access: Access) -> std::io::Result<File> {
        match access {
            Access::Read => File::open(path),
            Access::Write => OpenOptions::new().write(true).open(path),
        }
    }

    /// Open `attr` for `tid`, retrying on the shared layout when the
    /// selected one fails and AppArmor is not definitely disabled.
    fn open_attr(&self, tid: i32, attr: &str, access: Access) -> Result<File> {
        let template = self.prober.proc_attr_template();
        let path = template.attr_path(&self.prober.config().proc_root, tid, attr);

        match Self::open_at(&path, access) {
            Ok(file) => Ok(file),
            Err(err) => {
                if template != ProcAttrTemplate::Legacy && self.prober.legacy_fallback_allowed() {
                    let legacy = self.prober.legacy_attr_path(tid, attr);
                    log::debug!(
                        "Open of {} failed ({}), trying {}",
                        path.display(),
                        err,
                        legacy.display()
                    );
                    return Self::open_at(&legacy, access)
                        .map_err(|e| ArmorError::at_path(&legacy, e));
                }
                Err(ArmorError::at_path(&path, err))
            }
        }
    }

    fn resolve_tid(target: ConfinementTarget) -> i32 {
        match target {
            ConfinementTarget::Current => gettid(),
            ConfinementTarget::Tid(tid) => tid,
        }
    }

    /// Write `command` to `attr` of `tid` in a single call.
    pub fn set_proc_attr(&self, target: ConfinementTarget, attr: &str, command: &[u8]) -> Result<()> {
        let tid = Self::resolve_tid(target);
        let mut file = self.open_attr(tid, attr, Access::Write)?;
        write_once(&mut file, command)
    }

    /// Write a command holding a magic token, then zero it whatever the outcome.
    fn send_secret(&self, command: &mut SecretBuffer) -> Result<()> {
        let result = self.set_proc_attr(ConfinementTarget::Current, "current", command.as_bytes());
        command.scrub();
        result
    }

    /// Read `attr` into a buffer of exactly `size` bytes.
    ///
    /// `Ok(None)` means the buffer filled before EOF and a larger one is needed.
    fn read_attr_raw(&self, tid: i32, attr: &str, size: usize) -> Result<Option<Vec<u8>>> {
        let mut file = self.open_attr(tid, attr, Access::Read)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(size)?;
        buf.resize(size, 0);

        match fill_from(&mut file, &mut buf)? {
            FillOutcome::Exhausted => Ok(None),
            FillOutcome::Complete(len) => {
                buf.truncate(len);
                if let Some(nul) = buf.iter().position(|b| *b == 0) {
                    buf.truncate(nul);
                }
                Ok(Some(buf))
            }
        }
    }

    /// Fetch and split the confinement stored in `attr` of `target`.
    pub fn get_proc_attr(&self, target: ConfinementTarget, attr: &str) -> Result<ConfinementContext> {
        let tid = Self::resolve_tid(target);
        let mut size = INITIAL_ATTR_BUF;

        loop {
            if let Some(content) = self.read_attr_raw(tid, attr, size)? {
                return Ok(ConfinementContext::parse(content, true));
            }

            let next = size * 2;
            if next > MAX_ATTR_BUF {
                return Err(ArmorError::Protocol(format!(
                    "attribute {} of task {} exceeds {} bytes",
                    attr, tid, MAX_ATTR_BUF
                )));
            }
            log::trace!("Attribute {} did not fit in {} bytes, retrying", attr, size);
            size = next;
        }
    }

    /// Confinement of the calling thread
    pub fn get_confinement(&self) -> Result<ConfinementContext> {
        self.get_proc_attr(ConfinementTarget::Current, "current")
    }

    /// Confinement of another task
    pub fn get_task_confinement(&self, tid: i32) -> Result<ConfinementContext> {
        self.get_proc_attr(ConfinementTarget::Tid(tid), "current")
    }

    /// Enter (`Some`) or leave (`None` with the original token) a hat.
    pub fn change_hat(&self, subprofile: Option<&str>, token: u64) -> Result<()> {
        let subprofile = subprofile.unwrap_or("");
        if token == 0 && subprofile.is_empty() {
            return Err(ArmorError::InvalidArgument(
                "change_hat needs a subprofile or a token".to_string(),
            ));
        }
        check_name(subprofile)?;

        let mut command =
            SecretBuffer::with_capacity(CHANGEHAT_PREFIX.len() + 16 + 1 + subprofile.len())?;
        command.extend_from_slice(CHANGEHAT_PREFIX)?;
        command.push_hex_u64(token)?;
        command.push(b'^')?;
        command.extend_from_slice(subprofile.as_bytes())?;

        self.send_secret(&mut command)
    }

    /// Like [`change_hat`](Self::change_hat) but lets the kernel pick the
    /// first hat in `subprofiles` that exists.
    pub fn change_hat_vector(&self, subprofiles: &[&str], token: u64) -> Result<()> {
        if token == 0 && subprofiles.iter().all(|name| name.is_empty()) {
            return Err(ArmorError::InvalidArgument(
                "change_hat needs a subprofile or a token".to_string(),
            ));
        }

        let mut names_len = 0usize;
        for name in subprofiles {
            check_name(name)?;
            names_len += name.len() + 1;
        }
        if subprofiles.is_empty() {
            names_len = 1;
        }

        let mut command = SecretBuffer::with_capacity(CHANGEHAT_PREFIX.len() + 16 + 1 + names_len)?;
        command.extend_from_slice(CHANGEHAT_PREFIX)?;
        command.push_hex_u64(token)?;
        command.push(b'^')?;
        for name in subprofiles {
            command.extend_from_slice(name.as_bytes())?;
            command.push(0)?;
        }
        if subprofiles.is_empty() {
            command.push(0)?;
        }

        self.send_secret(&mut command)
    }

    fn send_profile_command(&self, attr: &str, verb: &str, profile: &str) -> Result<()> {
        if profile.is_empty() {
            return Err(ArmorError::InvalidArgument("empty profile name".to_string()));
        }
        check_name(profile)?;

        let command = format!("{} {}", verb, profile);
        log::debug!("Writing '{}' to {} attribute", command, attr);
        self.set_proc_attr(ConfinementTarget::Current, attr, command.as_bytes())
    }

    /// Switch the calling task to `profile` immediately.
    pub fn change_profile(&self, profile: &str) -> Result<()> {
        self.send_profile_command("current", "changeprofile", profile)
    }

    /// Switch to `profile` at the next exec.
    pub fn change_onexec(&self, profile: &str) -> Result<()> {
        self.send_profile_command("exec", "exec", profile)
    }

    /// Stack `profile` on the current confinement immediately.
    pub fn stack_profile(&self, profile: &str) -> Result<()> {
        self.send_profile_command("current", "stack", profile)
    }

    /// Stack `profile` at the next exec.
    pub fn stack_onexec(&self, profile: &str) -> Result<()> {
        self.send_profile_command("exec", "stack", profile)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(ArmorError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    if name.as_bytes().contains(&0) {
        return Err(ArmorError::InvalidArgument(format!(
            "name contains a NUL byte: {:?}",
            name
        )));
    }
    Ok(())
}
