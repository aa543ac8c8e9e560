//! The mount engine: turns one mount entry into live kernel state.
//!
//! Ordering per entry: provision image, attach loop or build verity,
//! optionally wrap in the cryptfs stack, mount (formatting fresh EMPTY
//! images on EINVAL), seal propagation, register id shifting. Bind and
//! tmpfs entries short-circuit most of that.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libc::{MS_BIND, MS_NOATIME, MS_NODEV, MS_PRIVATE, MS_RDONLY, MS_REC, MS_REMOUNT};
use log::{debug, info, warn};

use cryptfs::loopdev::LoopDevice;
use cryptfs::verity;

use crate::context::AuditEvent;
use crate::entry::{MountEntry, MountType};
use crate::error::Error;
use crate::image;
use crate::overlay::{self, OverlaySpec};
use crate::sys;
use crate::VolumeManager;

/// Bounded wait for /dev/mapper nodes created by udev.
pub(crate) const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

const BUSYBOX_PATH: &str = "/bin/busybox";

/// Default flags for image mounts. Setup mode needs device nodes
/// inside the tree, everything else gets nodev.
pub(crate) fn default_mount_flags(setup_mode: bool) -> libc::c_ulong {
    if setup_mode { MS_NOATIME } else { MS_NOATIME | MS_NODEV }
}

/// Absolute mount target below the compartment root.
pub(crate) fn target_dir(root: &Path, dir: &str) -> PathBuf {
    root.join(dir.trim_start_matches('/'))
}

/// Whether a mapper node already exists as (or links to) a block
/// device, i.e. the stack survived a previous run.
fn is_existing_blkdev(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.file_type().is_block_device(),
        Err(_) => false,
    }
}

// ============================================================================
// Bind mounts
// ============================================================================

/// Bind a single file. Both endpoints are created first; read-only
/// binds need the remount pass, see mount_namespaces(7).
fn mount_file_bind(src: &Path, dst: &Path, flags: libc::c_ulong) -> Result<(), Error> {
    if flags & MS_BIND == 0 {
        return Err(Error::MountFailed {
            src: src.display().to_string(),
            dst: dst.to_path_buf(),
            fs: "bind".to_string(),
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        });
    }
    sys::touch(src)?;
    sys::touch(dst)?;

    let src_str = src.display().to_string();
    let mount_err = |source| Error::MountFailed {
        src: src_str.clone(),
        dst: dst.to_path_buf(),
        fs: "bind".to_string(),
        source,
    };
    sys::mount(Some(&src_str), dst, Some("bind"), flags, None).map_err(mount_err)?;

    if flags & MS_RDONLY != 0 {
        if let Err(e) =
            sys::mount(Some("none"), dst, Some("bind"), flags | MS_RDONLY | MS_REMOUNT, None)
        {
            warn!("could not remount bind {} read-only: {e}", dst.display());
        }
    }
    debug!("bind mounted {} to {}", src.display(), dst.display());
    Ok(())
}

/// Bind a directory, with the same read-only remount pass.
fn mount_dir_bind(src: &Path, dst: &Path, flags: libc::c_ulong) -> Result<(), Error> {
    if flags & MS_BIND == 0 {
        return Err(Error::MountFailed {
            src: src.display().to_string(),
            dst: dst.to_path_buf(),
            fs: "bind".to_string(),
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        });
    }
    if let Err(e) = std::fs::create_dir_all(dst) {
        debug!("could not mkdir {}: {e}", dst.display());
    }

    let src_str = src.display().to_string();
    sys::mount(Some(&src_str), dst, None, flags, None).map_err(|source| Error::MountFailed {
        src: src_str.clone(),
        dst: dst.to_path_buf(),
        fs: "bind".to_string(),
        source,
    })?;

    if flags & MS_RDONLY != 0 {
        if let Err(source) =
            sys::mount(Some("none"), dst, Some("bind"), flags | MS_RDONLY | MS_REMOUNT, None)
        {
            if let Err(e) = sys::umount(dst) {
                warn!("could not umount writable bind mount: {e}");
            }
            return Err(Error::MountFailed {
                src: src_str,
                dst: dst.to_path_buf(),
                fs: "bind".to_string(),
                source,
            });
        }
    }
    debug!("bind mounted path {} to {}", src.display(), dst.display());
    Ok(())
}

/// Copy busybox into a setup-mode root so setup shells have tools.
pub(crate) fn setup_busybox_copy(target_base: &Path) -> Result<(), Error> {
    let target_bin = target_dir(target_base, BUSYBOX_PATH);
    if let Some(parent) = target_bin.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !Path::new(BUSYBOX_PATH).exists() {
        warn!("no {BUSYBOX_PATH} on the host, setup shell will lack tools");
        return Ok(());
    }
    std::fs::copy(BUSYBOX_PATH, &target_bin)?;
    sys::chmod(&target_bin, 0o755)?;
    info!("copied {} into compartment", target_bin.display());
    Ok(())
}

// ============================================================================
// Image mounts
// ============================================================================

/// Seal propagation and register id shifting after a successful mount.
fn finalize_mount(vol: &VolumeManager<'_>, dir: &Path, shiftids: bool) -> Result<(), Error> {
    sys::mount(None, dir, None, MS_REC | MS_PRIVATE, None).map_err(|source| Error::MountFailed {
        src: "none".to_string(),
        dst: dir.to_path_buf(),
        fs: "private".to_string(),
        source,
    })?;

    if shiftids {
        vol.compartment
            .shift_ids(dir, dir, None)
            .map_err(|source| Error::OverlayAssemblyFailed { step: "shift ids", source })?;
    }
    Ok(())
}

/// Mount one entry below `root`. This can block for a while (zero
/// formatting, mkfs), so it runs in the compartment start path, not in
/// a latency-sensitive context.
pub(crate) fn mount_image(
    vol: &mut VolumeManager<'_>,
    root: &Path,
    entry: &MountEntry,
) -> Result<(), Error> {
    let setup_mode = vol.compartment.has_setup_mode();
    let mut mountflags = default_mount_flags(setup_mode);
    let mut overlay = false;
    let mut shiftids = false;

    let dir = target_dir(root, entry.dir());
    let img = image::image_path(&vol.host, vol.compartment.images_dir(), entry)?;

    debug!("mount entry type {:?} for {}", entry.mount_type(), entry.img());

    match entry.mount_type() {
        MountType::Shared => {
            shiftids = true;
            mountflags |= MS_RDONLY;
        }
        MountType::Device => {
            mountflags |= MS_RDONLY;
        }
        MountType::OverlayRo => {
            mountflags |= MS_RDONLY;
            overlay = true;
        }
        MountType::SharedRw | MountType::OverlayRw => {
            overlay = true;
            shiftids = true;
        }
        MountType::DeviceRw | MountType::Empty => {
            shiftids = true;
        }
        MountType::Copy => {
            shiftids = true;
        }
        MountType::Flash => {
            debug!("skipping mount of FLASH type image {}", entry.img());
            return Ok(());
        }
        MountType::BindFile | MountType::BindFileRw => {
            if entry.mount_type() == MountType::BindFile {
                mountflags |= MS_RDONLY;
            }
            if vol.compartment.has_userns() {
                debug!("skipping file bind {} in user-namespaced compartment", entry.img());
                return Ok(());
            }
            mountflags |= MS_BIND;
            mount_file_bind(&img, &dir, mountflags)?;
            return finalize_mount(vol, &dir, false);
        }
        MountType::BindDir | MountType::BindDirRw => {
            if entry.mount_type() == MountType::BindDir {
                mountflags |= MS_RDONLY;
            }
            mountflags |= MS_BIND;
            shiftids = true;
            mount_dir_bind(&img, &dir, mountflags)?;
            return finalize_mount(vol, &dir, shiftids);
        }
    }

    if let Err(e) = sys::mkdir_p_mode(&dir, 0o777) {
        debug!("could not mkdir {}: {e}", dir.display());
    }

    if entry.fs() == "tmpfs" {
        sys::mount(Some("tmpfs"), &dir, Some("tmpfs"), mountflags, entry.mount_data()).map_err(
            |source| Error::MountFailed {
                src: "tmpfs".to_string(),
                dst: dir.clone(),
                fs: "tmpfs".to_string(),
                source,
            },
        )?;
        sys::chmod(&dir, 0o755)?;
        if entry.is_root() && setup_mode {
            if let Err(e) = setup_busybox_copy(&dir) {
                warn!("cannot copy busybox for setup mode: {e}");
            }
        }
        return finalize_mount(vol, &dir, shiftids);
    }

    let new_image = !img.exists();
    if new_image {
        let with_meta = entry.is_encrypted() && vol.mode.needs_meta_device();
        image::create_image(&vol.host, vol.compartment.images_dir(), &img, entry, with_meta)?;
    }

    // handles keeping loop associations alive until the mount (or the
    // dm table referencing them) exists
    let mut _verity_dev: Option<verity::VerityDevice> = None;
    let mut _loop_dev: Option<LoopDevice> = None;
    let mut _meta_loop: Option<LoopDevice> = None;

    let label = format!("{}-{}", vol.compartment.uuid(), entry.img());

    let mut dev: PathBuf = if let Some(root_hash) = entry.verity_root_hash() {
        let verity_node = cryptfs::device_path(&label);
        if is_existing_blkdev(&verity_node) {
            info!("using existing mapper device {}", verity_node.display());
            verity_node
        } else {
            let img_hash = image::hash_image_path(&vol.host, entry)?;
            let vd = verity::create_verity_blk_dev(
                &label,
                &img,
                &img_hash,
                root_hash,
                !vol.host.hosted,
            )?;
            let path = vd.path().to_path_buf();
            if let Ok(Some(ty)) = cryptfs::DmControl::open().and_then(|c| c.target_type(&label)) {
                debug!("target type of '{label}' is {ty}");
            }
            _verity_dev = Some(vd);
            cryptfs::wait_for_device(&path, DEVICE_WAIT_TIMEOUT)?;
            path
        }
    } else {
        let loop_dev = LoopDevice::attach(&img)?;
        let path = loop_dev.path().to_path_buf();
        _loop_dev = Some(loop_dev);
        path
    };

    if entry.is_encrypted() {
        let uuid = vol.compartment.uuid().to_string();
        let Some(key) = vol.compartment.key() else {
            vol.audit.record(&uuid, AuditEvent::SetupCryptedVolumeNoKey { label: &label });
            return Err(Error::MissingKey { label });
        };

        let crypt_node = cryptfs::device_path(&label);
        if is_existing_blkdev(&crypt_node) {
            info!("using existing mapper device {}", crypt_node.display());
            dev = crypt_node;
        } else {
            debug!("setting up cryptfs volume '{label}' for {} ({:?})", dev.display(), vol.mode);
            let img_meta = image::meta_image_path(vol.compartment.images_dir(), entry)?;
            let meta_loop = LoopDevice::attach(&img_meta)?;

            match cryptfs::setup_volume(&label, &dev, key, Some(meta_loop.path()), vol.mode) {
                Ok(crypt_dev) => {
                    vol.audit
                        .record(&uuid, AuditEvent::SetupCryptedVolume { label: &label, ok: true });
                    dev = crypt_dev;
                }
                Err(e) => {
                    vol.audit
                        .record(&uuid, AuditEvent::SetupCryptedVolume { label: &label, ok: false });
                    return Err(e.into());
                }
            }
            // the dm table now holds the backing files open
            _meta_loop = Some(meta_loop);
        }

        cryptfs::wait_for_device(&dev, DEVICE_WAIT_TIMEOUT)?;
    }

    if overlay {
        let (upper_fstype, lower_fstype, upper_dev, lower_dev) = match entry.mount_type() {
            MountType::OverlayRw => {
                if new_image {
                    image::format_image(&dev, entry.fs())?;
                    debug!("formatted new image {} using {}", img.display(), dev.display());
                }
                if entry.fs() == "btrfs" {
                    if let Some(data) = entry.mount_data() {
                        if data.starts_with("subvol") {
                            image::btrfs_ensure_subvol(&dev, data)?;
                        }
                    }
                }
                (entry.fs(), None, Some(dev.as_path()), None)
            }
            MountType::OverlayRo => {
                mountflags |= MS_RDONLY;
                (entry.fs(), None, Some(dev.as_path()), None)
            }
            MountType::SharedRw => ("tmpfs", Some(entry.fs()), None, Some(dev.as_path())),
            _ => return Err(Error::UnsupportedMountType { img: entry.img().to_string() }),
        };

        vol.overlay_count += 1;
        let scratch = vol
            .host
            .overlay_dir(vol.compartment.uuid())
            .join(vol.overlay_count.to_string());

        overlay::mount_overlay(
            vol.compartment,
            &OverlaySpec {
                target_dir: &dir,
                upper_fstype,
                lower_fstype,
                mount_flags: mountflags,
                mount_data: entry.mount_data(),
                upper_dev,
                lower_dev,
                scratch_dir: &scratch,
            },
        )?;
        debug!("mounted {} using overlay to {}", img.display(), dir.display());
        // the overlay path registers id shifting itself
        return Ok(());
    }

    debug!(
        "mounting image {} {} using {} to {}",
        img.display(),
        if mountflags & MS_RDONLY != 0 { "ro" } else { "rw" },
        dev.display(),
        dir.display()
    );

    let dev_str = dev.display().to_string();
    let fs = entry.fs();
    if sys::mount(Some(&dev_str), &dir, Some(fs), mountflags, entry.mount_data()).is_ok() {
        return finalize_mount(vol, &dir, shiftids);
    }
    // retry with default options before giving up on the data string
    let err = match sys::mount(Some(&dev_str), &dir, Some(fs), mountflags, None) {
        Ok(()) => return finalize_mount(vol, &dir, shiftids),
        Err(e) => e,
    };

    if err.raw_os_error() != Some(libc::EINVAL) {
        return Err(Error::MountFailed {
            src: dev_str,
            dst: dir,
            fs: fs.to_string(),
            source: err,
        });
    }

    info!(
        "no valid superblock on {} for {}, considering format",
        dev.display(),
        img.display()
    );

    if entry.mount_type() != MountType::Empty {
        return Err(Error::MountFailed { src: dev_str, dst: dir, fs: fs.to_string(), source: err });
    }
    if entry.is_encrypted() && !new_image {
        // an unreadable superblock on an existing encrypted volume
        // means the wrong key far more often than corruption
        warn!("possibly a wrong key was supplied, aborting start");
        return Err(Error::MountFailed { src: dev_str, dst: dir, fs: fs.to_string(), source: err });
    }

    info!("formatting image {} using {} as {}", img.display(), dev.display(), fs);
    image::format_image(&dev, fs)?;

    sys::mount(Some(&dev_str), &dir, Some(fs), mountflags, entry.mount_data()).map_err(
        |source| Error::MountFailed {
            src: dev_str.clone(),
            dst: dir.clone(),
            fs: fs.to_string(),
            source,
        },
    )?;
    debug!("mounted {} using {} to {}", img.display(), dev.display(), dir.display());

    finalize_mount(vol, &dir, shiftids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_depend_on_setup_mode() {
        assert_eq!(default_mount_flags(true), MS_NOATIME);
        assert_eq!(default_mount_flags(false), MS_NOATIME | MS_NODEV);
    }

    #[test]
    fn target_dir_handles_absolute_fragments() {
        let root = Path::new("/tmp/u1");
        assert_eq!(target_dir(root, "/data"), Path::new("/tmp/u1/data"));
        assert_eq!(target_dir(root, "data"), Path::new("/tmp/u1/data"));
        assert_eq!(target_dir(root, "/"), Path::new("/tmp/u1"));
    }

    #[test]
    fn file_bind_requires_bind_flag() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let err = mount_file_bind(&src, &dst, MS_RDONLY).unwrap_err();
        assert!(matches!(err, Error::MountFailed { .. }));
        // endpoints must not have been touched on the flag error
        assert!(!src.exists());
    }

    #[test]
    fn dir_bind_requires_bind_flag() {
        let dir = tempfile::tempdir().unwrap();
        let err = mount_dir_bind(dir.path(), &dir.path().join("x"), 0).unwrap_err();
        assert!(matches!(err, Error::MountFailed { .. }));
    }

    #[test]
    fn existing_blkdev_probe() {
        assert!(!is_existing_blkdev(Path::new("/nonexistent-node")));
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(!is_existing_blkdev(f.path()));
    }
}
