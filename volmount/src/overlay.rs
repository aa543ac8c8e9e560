//! Overlayfs composition for read-write-over-read-only mounts.
//!
//! The upper backing filesystem (a tmpfs, or an image-backed device)
//! is mounted at a per-compartment scratch directory, `upper/` and
//! `work/` are created inside it, and the overlay is assembled at the
//! target. Lower layers either come from a separate read-only mount or
//! are whatever is already visible at the target directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::context::Compartment;
use crate::error::Error;
use crate::sys;

/// How long to wait for a lower device node that udev still has to
/// create.
const LOWER_DEV_TIMEOUT: Duration = Duration::from_secs(10);

/// Inputs for one overlay composition.
pub(crate) struct OverlaySpec<'a> {
    pub target_dir: &'a Path,
    pub upper_fstype: &'a str,
    pub lower_fstype: Option<&'a str>,
    pub mount_flags: libc::c_ulong,
    pub mount_data: Option<&'a str>,
    /// None mounts a tmpfs as upper backing.
    pub upper_dev: Option<&'a Path>,
    pub lower_dev: Option<&'a Path>,
    pub scratch_dir: &'a Path,
}

/// `lowerdir=..,upperdir=..,workdir=..` for the overlay mount.
pub(crate) fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    )
}

fn scratch_lower_dir(scratch: &Path) -> PathBuf {
    let mut s = scratch.as_os_str().to_os_string();
    s.push("-lower");
    PathBuf::from(s)
}

pub(crate) fn mount_overlay(
    compartment: &dyn Compartment,
    spec: &OverlaySpec<'_>,
) -> Result<(), Error> {
    debug!("creating overlayfs scratch directory {}", spec.scratch_dir.display());
    std::fs::create_dir_all(spec.scratch_dir)
        .map_err(|source| Error::OverlayAssemblyFailed { step: "mkdir scratch", source })?;

    let upper_dir = spec.scratch_dir.join("upper");
    let work_dir = spec.scratch_dir.join("work");

    // upper and work must live on the same filesystem, so the backing
    // device (or a tmpfs) is mounted over the whole scratch dir first
    let upper_src = spec
        .upper_dev
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "tmpfs".to_string());
    sys::mount(
        Some(&upper_src),
        spec.scratch_dir,
        Some(spec.upper_fstype),
        spec.mount_flags,
        spec.mount_data,
    )
    .map_err(|source| Error::MountFailed {
        src: upper_src.clone(),
        dst: spec.scratch_dir.to_path_buf(),
        fs: spec.upper_fstype.to_string(),
        source,
    })?;
    debug!("mounted {} to {}", upper_src, spec.scratch_dir.display());

    std::fs::create_dir_all(&upper_dir)
        .map_err(|source| Error::OverlayAssemblyFailed { step: "mkdir upper", source })?;
    std::fs::create_dir_all(&work_dir)
        .map_err(|source| Error::OverlayAssemblyFailed { step: "mkdir work", source })?;

    let lower_dir = match spec.lower_dev {
        Some(lower_dev) => {
            let lower_dir = scratch_lower_dir(spec.scratch_dir);
            std::fs::create_dir_all(&lower_dir)
                .map_err(|source| Error::OverlayAssemblyFailed { step: "mkdir lower", source })?;

            if !sys::wait_for_path(lower_dev, LOWER_DEV_TIMEOUT) {
                return Err(Error::Cryptfs(cryptfs::Error::DeviceNodeTimeout {
                    path: lower_dev.to_path_buf(),
                }));
            }

            let lower_src = lower_dev.display().to_string();
            sys::mount(
                Some(&lower_src),
                &lower_dir,
                spec.lower_fstype,
                spec.mount_flags | libc::MS_RDONLY,
                spec.mount_data,
            )
            .map_err(|source| Error::MountFailed {
                src: lower_src,
                dst: lower_dir.clone(),
                fs: spec.lower_fstype.unwrap_or("").to_string(),
                source,
            })?;
            lower_dir
        }
        // without a dedicated lower device the current content of the
        // target directory provides the read-only base
        None => spec.target_dir.to_path_buf(),
    };

    let options = overlay_options(&lower_dir, &upper_dir, &work_dir);
    sys::mount(
        Some("overlay"),
        spec.target_dir,
        Some("overlay"),
        spec.mount_flags & libc::MS_RDONLY,
        Some(&options),
    )
    .map_err(|source| Error::MountFailed {
        src: "overlay".to_string(),
        dst: spec.target_dir.to_path_buf(),
        fs: "overlay".to_string(),
        source,
    })?;

    compartment
        .shift_ids(spec.scratch_dir, spec.target_dir, Some(&lower_dir))
        .map_err(|source| Error::OverlayAssemblyFailed { step: "shift ids", source })?;

    Ok(())
}

/// Release every overlay scratch mount of one compartment and remove
/// the directories. Errors are logged; teardown always visits every
/// entry.
pub(crate) fn cleanup_overlays(overlay_root: &Path) {
    let entries = match std::fs::read_dir(overlay_root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Err(e) = sys::umount_dir(&path) {
            warn!("could not release overlay {}: {e}", path.display());
        }
        let lower = scratch_lower_dir(&path);
        if lower.exists() {
            if let Err(e) = sys::umount_dir(&lower) {
                warn!("could not release overlay lower {}: {e}", lower.display());
            }
            let _ = std::fs::remove_dir(&lower);
        }
        if std::fs::remove_dir(&path).is_err() {
            debug!("unable to remove {}", path.display());
        }
    }
    if std::fs::remove_dir(overlay_root).is_err() {
        debug!("unable to remove {}", overlay_root.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_name_all_three_layers() {
        let opts = overlay_options(
            Path::new("/tmp/ovl-lower"),
            Path::new("/tmp/ovl/upper"),
            Path::new("/tmp/ovl/work"),
        );
        assert_eq!(
            opts,
            "lowerdir=/tmp/ovl-lower,upperdir=/tmp/ovl/upper,workdir=/tmp/ovl/work"
        );
    }

    #[test]
    fn lower_dir_is_a_sibling_of_the_scratch_dir() {
        assert_eq!(
            scratch_lower_dir(Path::new("/tmp/overlayfs/u1/3")),
            Path::new("/tmp/overlayfs/u1/3-lower")
        );
    }

    #[test]
    fn cleanup_tolerates_missing_root() {
        cleanup_overlays(Path::new("/nonexistent-overlay-root"));
    }

    #[test]
    fn cleanup_removes_plain_scratch_dirs() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("1");
        std::fs::create_dir_all(&scratch).unwrap();
        let inner = root.path().to_path_buf();
        cleanup_overlays(&inner);
        assert!(!scratch.exists());
    }
}
