// AppArmor capability prober
//
// Answers "is AppArmor usable" and selects which /proc/<tid>/attr layout the
// transition and query clients talk to. The layout choice is made once per
// Prober and never revisited after a definitive answer; a live policy reload
// that flips availability is not observed.

use crate::config::config::BridgeConfig;
use crate::config::types::{ArmorError, Result};
use crate::utils::io::gettid;
use once_cell::sync::{Lazy, OnceCell};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Availability reported by [`Prober::is_enabled`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Public securityfs interface is mounted
    Enabled,
    /// Only the private (stacking) interfaces are available; callers that
    /// need the shared public interface should treat this as busy (EBUSY)
    PrivateOnly,
}

/// Layout of the per-task attribute files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcAttrTemplate {
    /// `/proc/<tid>/attr/<attr>`, shared between LSMs
    Legacy,
    /// `/proc/<tid>/attr/apparmor/<attr>`
    Stacking,
    /// Stacking directory exists but was unreadable when probed
    StackingDenied,
    /// AppArmor is definitely off; paths point at a location that never exists
    Unavailable,
}

impl ProcAttrTemplate {
    /// Build the attribute path for `tid` under `proc_root`.
    pub fn attr_path(&self, proc_root: &Path, tid: i32, attr: &str) -> PathBuf {
        let base = proc_root.join(tid.to_string()).join("attr");
        match self {
            ProcAttrTemplate::Legacy => base.join(attr),
            ProcAttrTemplate::Stacking | ProcAttrTemplate::StackingDenied => {
                base.join("apparmor").join(attr)
            }
            ProcAttrTemplate::Unavailable => base.join("apparmor").join("unavailable").join(attr),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcAttrTemplate::Legacy => "legacy",
            ProcAttrTemplate::Stacking => "stacking",
            ProcAttrTemplate::StackingDenied => "stacking_denied",
            ProcAttrTemplate::Unavailable => "unavailable",
        }
    }
}

/// Probe outcome that could not be settled; carries the layout to use for
/// this call while leaving the latch open for a later retry.
#[derive(Debug, Clone, Copy)]
struct Unresolved {
    fallback: ProcAttrTemplate,
}

/// One-shot capability prober
///
/// Every latch here follows the same rule: a successful determination is
/// permanent, a failed one is not stored and the next caller probes again.
pub struct Prober {
    config: BridgeConfig,
    enabled_param: OnceCell<bool>,
    available_param: OnceCell<bool>,
    template: OnceCell<ProcAttrTemplate>,
}

static SYSTEM: Lazy<Prober> = Lazy::new(|| {
    let config = BridgeConfig::from_env().unwrap_or_else(|e| {
        log::warn!("Ignoring bridge configuration: {}", e);
        BridgeConfig::default()
    });
    Prober::new(config)
});

/// Process-wide prober bound to the real kernel interfaces
pub fn system() -> &'static Prober {
    &SYSTEM
}

impl Prober {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            enabled_param: OnceCell::new(),
            available_param: OnceCell::new(),
            template: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Read a boolean module parameter (`Y`/`N`).
    fn read_param(&self, name: &str) -> Result<bool> {
        let path = self.config.param_path(name);
        let mut file = File::open(&path).map_err(|e| ArmorError::at_path(&path, e))?;
        let mut buffer = [0u8; 2];
        let size = file
            .read(&mut buffer)
            .map_err(|e| ArmorError::at_path(&path, e))?;
        if size == 0 {
            return Err(ArmorError::Protocol(format!(
                "empty module parameter {}",
                path.display()
            )));
        }
        Ok(buffer[0] == b'Y')
    }

    /// Boot-time enablement flag (`parameters/enabled`)
    pub fn param_enabled(&self) -> Result<bool> {
        self.enabled_param
            .get_or_try_init(|| self.read_param("enabled"))
            .copied()
    }

    /// Private interface availability flag (`parameters/available`)
    pub fn param_available(&self) -> Result<bool> {
        self.available_param
            .get_or_try_init(|| self.read_param("available"))
            .copied()
    }

    /// Locate `<securityfs>/apparmor` through the mount table.
    ///
    /// Not cached: mounts can change while the process runs.
    pub fn find_mountpoint(&self) -> Result<PathBuf> {
        let mounts = fs::read_to_string(&self.config.mounts_file)
            .map_err(|e| ArmorError::at_path(&self.config.mounts_file, e))?;

        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_source), Some(target), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if fstype != "securityfs" {
                continue;
            }

            let candidate = PathBuf::from(unescape_mount_field(target)).join("apparmor");
            if fs::metadata(&candidate).is_ok() {
                return Ok(candidate);
            }
        }

        Err(ArmorError::NotMounted)
    }

    /// AppArmor interface directory, falling back to the conventional
    /// securityfs location when the mount table does not list it.
    pub fn interface_dir(&self) -> Result<PathBuf> {
        match self.find_mountpoint() {
            Ok(dir) => Ok(dir),
            Err(err) => {
                if fs::metadata(&self.config.securityfs_fallback).is_ok() {
                    log::debug!(
                        "Mount table lookup failed ({}), using {}",
                        err,
                        self.config.securityfs_fallback.display()
                    );
                    Ok(self.config.securityfs_fallback.clone())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Determine whether AppArmor is enabled.
    pub fn is_enabled(&self) -> Result<ModuleStatus> {
        match self.find_mountpoint() {
            Ok(_) => return Ok(ModuleStatus::Enabled),
            Err(err) => log::debug!("No AppArmor securityfs mount: {}", err),
        }

        let enabled = self.param_enabled();
        if !matches!(enabled, Ok(true)) && matches!(self.param_available(), Ok(true)) {
            return Ok(ModuleStatus::PrivateOnly);
        }

        match enabled {
            Ok(true) => Err(ArmorError::NotMounted),
            Ok(false) => Err(ArmorError::DisabledAtBoot),
            Err(err) if err.is_not_found() => Err(ArmorError::NotPresent),
            Err(err) => Err(err),
        }
    }

    fn resolve_template(&self) -> std::result::Result<ProcAttrTemplate, Unresolved> {
        let new_dir = self
            .config
            .proc_root
            .join(gettid().to_string())
            .join("attr")
            .join("apparmor");

        match fs::metadata(&new_dir) {
            Ok(_) => return Ok(ProcAttrTemplate::Stacking),
            Err(e) if e.raw_os_error() == Some(libc::EACCES) => {
                return Ok(ProcAttrTemplate::StackingDenied)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::debug!("Probe of {} failed: {}", new_dir.display(), e),
        }
        let fallback = ProcAttrTemplate::Legacy;

        match self.param_enabled() {
            // A definite "N": never touch the shared interface.
            Ok(false) => match self.param_available() {
                Ok(true) => Ok(ProcAttrTemplate::Stacking),
                Ok(false) => Ok(ProcAttrTemplate::Unavailable),
                Err(_) => Err(Unresolved { fallback }),
            },
            Ok(true) => Ok(ProcAttrTemplate::Legacy),
            Err(ArmorError::NoAccess { .. }) => Err(Unresolved { fallback }),
            Err(_) => Ok(ProcAttrTemplate::Unavailable),
        }
    }

    /// Attribute layout in use, resolving it on first call.
    pub fn proc_attr_template(&self) -> ProcAttrTemplate {
        match self.template.get_or_try_init(|| self.resolve_template()) {
            Ok(template) => *template,
            Err(unresolved) => {
                log::debug!(
                    "Proc attr layout undetermined, using {} for now",
                    unresolved.fallback.name()
                );
                unresolved.fallback
            }
        }
    }

    /// Layout if a definitive answer has been latched.
    pub fn resolved_template(&self) -> Option<ProcAttrTemplate> {
        self.template.get().copied()
    }

    /// Path of `attr` for `tid` under the selected layout
    pub fn proc_attr_path(&self, tid: i32, attr: &str) -> PathBuf {
        self.proc_attr_template()
            .attr_path(&self.config.proc_root, tid, attr)
    }

    /// Path of `attr` for `tid` under the shared legacy layout
    pub fn legacy_attr_path(&self, tid: i32, attr: &str) -> PathBuf {
        ProcAttrTemplate::Legacy.attr_path(&self.config.proc_root, tid, attr)
    }

    /// Whether falling back to the shared interface is acceptable: anything
    /// but a definite "disabled" answer.
    pub fn legacy_fallback_allowed(&self) -> bool {
        !matches!(self.param_enabled(), Ok(false))
    }
}

/// Undo the octal escapes the kernel applies to mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{race_first_callers, FakeKernel, RaceProofConfig};

    fn fake(tmp: &tempfile::TempDir) -> FakeKernel {
        FakeKernel::new(tmp.path()).unwrap()
    }

    #[test]
    fn test_mountpoint_found_means_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(true).unwrap();
        kernel.mount_securityfs().unwrap();
        let prober = Prober::new(kernel.config());

        assert_eq!(prober.is_enabled().unwrap(), ModuleStatus::Enabled);
        assert_eq!(prober.find_mountpoint().unwrap(), kernel.apparmorfs());
        assert_eq!(prober.interface_dir().unwrap(), kernel.apparmorfs());
    }

    #[test]
    fn test_missing_module_is_not_present() {
        let tmp = tempfile::tempdir().unwrap();
        let prober = Prober::new(fake(&tmp).config());

        assert!(matches!(prober.is_enabled(), Err(ArmorError::NotPresent)));
        assert!(prober.interface_dir().is_err());
    }

    #[test]
    fn test_disabled_at_boot() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(false).unwrap();
        let prober = Prober::new(kernel.config());

        assert!(matches!(prober.is_enabled(), Err(ArmorError::DisabledAtBoot)));
    }

    #[test]
    fn test_enabled_but_unmounted() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(true).unwrap();
        let prober = Prober::new(kernel.config());

        assert!(matches!(prober.is_enabled(), Err(ArmorError::NotMounted)));
    }

    #[test]
    fn test_private_only_reports_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(false).unwrap();
        kernel.set_available(true).unwrap();
        let prober = Prober::new(kernel.config());

        assert_eq!(prober.is_enabled().unwrap(), ModuleStatus::PrivateOnly);
    }

    #[test]
    fn test_mount_check_is_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(true).unwrap();
        let prober = Prober::new(kernel.config());
        assert!(prober.is_enabled().is_err());

        kernel.mount_securityfs().unwrap();
        assert_eq!(prober.is_enabled().unwrap(), ModuleStatus::Enabled);
    }

    #[test]
    fn test_interface_dir_falls_back_without_mount_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        std::fs::create_dir_all(kernel.apparmorfs()).unwrap();
        let prober = Prober::new(kernel.config());

        assert!(prober.find_mountpoint().is_err());
        assert_eq!(prober.interface_dir().unwrap(), kernel.apparmorfs());
    }

    #[test]
    fn test_stacking_dir_selects_stacking() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(true).unwrap();
        kernel.add_task(gettid(), true).unwrap();
        let prober = Prober::new(kernel.config());

        assert_eq!(prober.proc_attr_template(), ProcAttrTemplate::Stacking);
        assert_eq!(
            prober.proc_attr_path(42, "current"),
            kernel.config().proc_root.join("42/attr/apparmor/current")
        );
    }

    #[test]
    fn test_enabled_without_stacking_selects_legacy() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(true).unwrap();
        let prober = Prober::new(kernel.config());

        assert_eq!(prober.proc_attr_template(), ProcAttrTemplate::Legacy);
        assert_eq!(prober.resolved_template(), Some(ProcAttrTemplate::Legacy));
    }

    #[test]
    fn test_disabled_without_stacking_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(false).unwrap();
        kernel.set_available(false).unwrap();
        let prober = Prober::new(kernel.config());

        assert_eq!(prober.proc_attr_template(), ProcAttrTemplate::Unavailable);
        assert_eq!(
            prober.proc_attr_path(7, "exec"),
            kernel.config().proc_root.join("7/attr/apparmor/unavailable/exec")
        );
        assert!(!prober.legacy_fallback_allowed());
    }

    #[test]
    fn test_disabled_with_private_interface_keeps_stacking() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(false).unwrap();
        kernel.set_available(true).unwrap();
        let prober = Prober::new(kernel.config());

        assert_eq!(prober.proc_attr_template(), ProcAttrTemplate::Stacking);
    }

    #[test]
    fn test_template_is_latched() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(true).unwrap();
        let prober = Prober::new(kernel.config());
        assert_eq!(prober.proc_attr_template(), ProcAttrTemplate::Legacy);

        // Stacking appearing later is not observed.
        kernel.add_task(gettid(), true).unwrap();
        assert_eq!(prober.proc_attr_template(), ProcAttrTemplate::Legacy);
    }

    #[test]
    fn test_concurrent_first_callers_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = fake(&tmp);
        kernel.set_enabled(true).unwrap();
        let prober = Prober::new(kernel.config());

        let result = race_first_callers(&RaceProofConfig::default(), || {
            prober.proc_attr_template()
        });
        assert!(result.is_pass());
        assert_eq!(result.first(), Some(&ProcAttrTemplate::Legacy));
        assert_eq!(prober.proc_attr_template(), ProcAttrTemplate::Legacy);
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/sys/kernel/security"), "/sys/kernel/security");
        assert_eq!(unescape_mount_field("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_mount_field("/trailing\\04"), "/trailing\\04");
    }
}
