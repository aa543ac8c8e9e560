//! Host and compartment context threaded through setup.
//!
//! `/dev/mapper/control`, `/tmp/<uuid>` and the overlay scratch tree
//! are process-wide kernel and filesystem state; instead of ambient
//! singletons, every setup function receives the context explicitly.

use std::io;
use std::path::{Path, PathBuf};

/// Host-global paths and policy.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Directory holding the guest OS images (`<name>.img`,
    /// `<name>.hash.img`).
    pub guestos_dir: PathBuf,
    /// Base directory for host-side persistent state; the shared-files
    /// store lives under it.
    pub base_dir: PathBuf,
    /// Scratch root for per-compartment mount trees, normally `/tmp`.
    pub tmp_dir: PathBuf,
    /// Hosted compartments switch root via `pivot_root`; non-hosted
    /// setups overmount `/` instead.
    pub hosted: bool,
}

impl HostContext {
    pub fn new(guestos_dir: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        HostContext {
            guestos_dir: guestos_dir.into(),
            base_dir: base_dir.into(),
            tmp_dir: PathBuf::from("/tmp"),
            hosted: true,
        }
    }

    /// Backing store directory for `BindFile*` mounts.
    pub fn shared_files_dir(&self) -> PathBuf {
        self.base_dir.join("files_shared")
    }

    /// Scratch root for one compartment's mount tree.
    pub fn compartment_root(&self, uuid: &str) -> PathBuf {
        self.tmp_dir.join(uuid)
    }

    /// Scratch root for one compartment's overlay mounts.
    pub fn overlay_dir(&self, uuid: &str) -> PathBuf {
        self.tmp_dir.join("overlayfs").join(uuid)
    }
}

/// Audit events emitted by the volume layer, keyed by compartment UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent<'a> {
    SetupCryptedVolume { label: &'a str, ok: bool },
    SetupCryptedVolumeNoKey { label: &'a str },
    VerifyImage { img: &'a str, ok: bool },
}

/// Sink for audit events. The embedding daemon forwards these to its
/// audit subsystem; the default discards them.
pub trait AuditSink {
    fn record(&self, compartment_uuid: &str, event: AuditEvent<'_>);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn record(&self, _compartment_uuid: &str, _event: AuditEvent<'_>) {}
}

/// Everything the volume layer needs to know about one compartment.
///
/// The compartment lifecycle framework implements this; defaults keep
/// the optional collaborations (id shifting, child tracking, device
/// filtering) inert.
pub trait Compartment {
    /// Stable unique id; dm labels and scratch paths embed it.
    fn uuid(&self) -> &str;

    /// Setup mode mounts the images under `<root>/setup` and provides
    /// a toolbox shell environment.
    fn has_setup_mode(&self) -> bool;

    fn has_userns(&self) -> bool;

    fn has_netns(&self) -> bool;

    /// Directory holding this compartment's writable images.
    fn images_dir(&self) -> &Path;

    /// Hex volume key, if the key provider released one.
    fn key(&self) -> Option<&str>;

    /// Register a mount for an idmapped-mount binding so UIDs in the
    /// image map into the compartment's user namespace. `lower` is the
    /// prepared overlay lower dir when the registration covers an
    /// overlay composition.
    fn shift_ids(&self, _path: &Path, _target: &Path, _lower: Option<&Path>) -> io::Result<()> {
        Ok(())
    }

    /// Whether a device node may be exposed inside the compartment.
    fn is_device_allowed(&self, _dev_type: char, _major: u32, _minor: u32) -> bool {
        true
    }

    /// Track a forked helper child so the lifecycle framework can reap
    /// it and react to its exit status.
    fn watch_child(&self, _tag: &'static str, _pid: libc::pid_t) {}
}

/// Minimal concrete compartment for embedders and tests.
#[derive(Debug, Clone, Default)]
pub struct CompartmentSpec {
    pub uuid: String,
    pub images_dir: PathBuf,
    pub setup_mode: bool,
    pub userns: bool,
    pub netns: bool,
    pub key: Option<String>,
}

impl Compartment for CompartmentSpec {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn has_setup_mode(&self) -> bool {
        self.setup_mode
    }

    fn has_userns(&self) -> bool {
        self.userns
    }

    fn has_netns(&self) -> bool {
        self.netns
    }

    fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// The privileged management compartment c0 has the nil UUID.
pub(crate) fn is_c0(uuid: &str) -> bool {
    uuid == "00000000-0000-0000-0000-000000000000"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths() {
        let host = HostContext::new("/guestos", "/data/compartments");
        assert_eq!(host.shared_files_dir(), Path::new("/data/compartments/files_shared"));
        assert_eq!(host.compartment_root("u1"), Path::new("/tmp/u1"));
        assert_eq!(host.overlay_dir("u1"), Path::new("/tmp/overlayfs/u1"));
    }

    #[test]
    fn c0_is_the_nil_uuid() {
        assert!(is_c0("00000000-0000-0000-0000-000000000000"));
        assert!(!is_c0("7d9e2f64-0000-0000-0000-000000000000"));
        assert!(!is_c0(""));
    }

    #[test]
    fn spec_defaults_are_inert() {
        let c = CompartmentSpec { uuid: "u".into(), ..Default::default() };
        assert!(c.key().is_none());
        assert!(c.is_device_allowed('b', 7, 0));
        assert!(c.shift_ids(Path::new("/a"), Path::new("/a"), None).is_ok());
    }
}
