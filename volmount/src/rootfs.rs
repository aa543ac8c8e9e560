//! Compartment root assembly and the switch into it: `/dev` and its
//! population, `/proc`, `/sys`, `pivot_root` or move-mount, and the
//! runtime mounts a freshly pivoted compartment expects.

use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::Path;

use libc::{MS_BIND, MS_NODEV, MS_NOSUID, MS_RDONLY, MS_RELATIME, MS_REMOUNT, MS_SHARED};
use log::{debug, info, warn};

use crate::error::Error;
use crate::sys;
use crate::VolumeManager;

/// tmpfs for the compartment-manager control sockets.
const SOCKET_DIR: &str = "/run/socket";

const BUSYBOX_PATH: &str = "/bin/busybox";

/// Mount the compartment's `/dev` tmpfs under its root, shared so the
/// manager can inject nodes later, with the `pts` mountpoint prepared.
pub(crate) fn mount_dev(vol: &VolumeManager<'_>) -> Result<(), Error> {
    let dev_mnt = vol.root.join("dev");
    let pts_mnt = dev_mnt.join("pts");

    std::fs::create_dir_all(&dev_mnt)?;
    sys::mount(Some("tmpfs"), &dev_mnt, Some("tmpfs"), MS_RELATIME | MS_NOSUID, None).map_err(
        |source| Error::MountFailed {
            src: "tmpfs".to_string(),
            dst: dev_mnt.clone(),
            fs: "tmpfs".to_string(),
            source,
        },
    )?;

    match sys::mount(None, &dev_mnt, None, MS_SHARED, None) {
        Ok(()) => debug!("applied MS_SHARED to {}", dev_mnt.display()),
        Err(e) => warn!("could not apply MS_SHARED to {}: {e}", dev_mnt.display()),
    }

    vol.compartment
        .shift_ids(&dev_mnt, &dev_mnt, None)
        .map_err(|source| Error::OverlayAssemblyFailed { step: "shift ids for /dev", source })?;

    std::fs::create_dir_all(&pts_mnt)?;
    sys::chmod(&dev_mnt, 0o755)?;
    Ok(())
}

/// Copy the host's device nodes into the compartment `/dev`, filtered
/// through the compartment's device allowlist. Nested mountpoints
/// (e.g. `/dev/pts`) are private and never copied.
fn copy_dev_nodes(
    vol: &VolumeManager<'_>,
    src_dir: &Path,
    dst_dir: &Path,
) -> io::Result<()> {
    for entry in std::fs::read_dir(src_dir)? {
        let entry = entry?;
        let src = entry.path();
        let dst = dst_dir.join(entry.file_name());

        if sys::is_mountpoint(&src) {
            debug!("filtering mountpoint {}", src.display());
            continue;
        }
        let meta = match std::fs::symlink_metadata(&src) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let ftype = meta.file_type();

        if ftype.is_symlink() {
            if let Ok(target) = std::fs::read_link(&src) {
                let _ = std::os::unix::fs::symlink(target, &dst);
            }
            continue;
        }
        if ftype.is_dir() {
            std::fs::create_dir_all(&dst)?;
            copy_dev_nodes(vol, &src, &dst)?;
            continue;
        }

        let dev_type = if ftype.is_block_device() {
            'b'
        } else if ftype.is_char_device() {
            'c'
        } else {
            continue;
        };

        let rdev = meta.rdev();
        let major = libc::major(rdev);
        let minor = libc::minor(rdev);
        if !vol.compartment.is_device_allowed(dev_type, major, minor) {
            debug!("filtering device {} ({dev_type} {major}:{minor})", src.display());
            continue;
        }
        sys::mknod(&dst, meta.mode() as libc::mode_t, rdev as libc::dev_t)?;
    }
    Ok(())
}

/// First tty-ish node name in a populated /dev, for the console link.
fn find_tty(dev_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(dev_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.len() >= 4 && name.contains("tty") {
            return Some(name);
        }
    }
    None
}

/// Populate the compartment's `/dev` and link a console for systemd
/// style inits.
pub(crate) fn populate_dev(vol: &VolumeManager<'_>) -> Result<(), Error> {
    info!("populating compartment /dev");
    let dev_mnt = vol.root.join("dev");
    copy_dev_nodes(vol, Path::new("/dev"), &dev_mnt)?;

    if let Some(tty) = find_tty(&dev_mnt) {
        let console = dev_mnt.join("console");
        if !console.exists() {
            if let Err(e) = std::os::unix::fs::symlink(&tty, &console) {
                warn!("could not link {tty} to /dev/console: {e}");
            }
        }
    }

    if let Err(e) = vol.compartment.shift_ids(&dev_mnt, &dev_mnt, None) {
        warn!("failed to shift ids for {}: {e}", dev_mnt.display());
    }
    Ok(())
}

/// Mount proc and sysfs below `dir`. sysfs goes read-only for
/// user-namespaced compartments without their own network namespace,
/// since writable sysfs would reach host devices then.
fn mount_proc_and_sys(vol: &VolumeManager<'_>, dir: &Path) -> Result<(), Error> {
    let mnt_proc = dir.join("proc");
    let mnt_sys = dir.join("sys");

    debug!("mounting proc on {}", mnt_proc.display());
    std::fs::create_dir_all(&mnt_proc)?;
    sys::mount(Some("proc"), &mnt_proc, Some("proc"), 0, None).map_err(|source| {
        Error::MountFailed {
            src: "proc".to_string(),
            dst: mnt_proc.clone(),
            fs: "proc".to_string(),
            source,
        }
    })?;

    let mut sysopts = MS_RELATIME | MS_NOSUID;
    if vol.compartment.has_userns() && !vol.compartment.has_netns() {
        sysopts |= MS_RDONLY;
    }
    debug!("mounting sys on {}", mnt_sys.display());
    std::fs::create_dir_all(&mnt_sys)?;
    sys::mount(Some("sysfs"), &mnt_sys, Some("sysfs"), sysopts, None).map_err(|source| {
        Error::MountFailed {
            src: "sysfs".to_string(),
            dst: mnt_sys.clone(),
            fs: "sysfs".to_string(),
            source,
        }
    })?;
    Ok(())
}

fn open_dir_fd(path: &Path) -> io::Result<OwnedFd> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_DIRECTORY | libc::O_PATH) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn fchdir(fd: &OwnedFd) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    if unsafe { libc::fchdir(fd.as_raw_fd()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Hosted mode: `pivot_root` into the assembled tree and lazily detach
/// whatever the old root still references.
fn pivot_into_root(root: &Path) -> Result<(), Error> {
    let step = |step, source| Error::RootSwitch { step, source };

    let old_root = open_dir_fd(Path::new("/")).map_err(|e| step("open old root", e))?;
    let new_root = open_dir_fd(root).map_err(|e| step("open new root", e))?;

    fchdir(&new_root).map_err(|e| step("fchdir new root", e))?;
    sys::pivot_root(Path::new("."), Path::new(".")).map_err(|e| step("pivot_root", e))?;
    fchdir(&old_root).map_err(|e| step("fchdir old root", e))?;
    sys::umount_detach(Path::new(".")).map_err(|e| step("detach old root", e))?;
    fchdir(&new_root).map_err(|e| step("fchdir new root again", e))?;

    info!("switched to new root {} via pivot_root", root.display());
    Ok(())
}

/// Non-hosted mode: overmount `/` with the new tree. The mount
/// namespace takes care of chroot escapes.
fn move_into_root(root: &Path) -> Result<(), Error> {
    let step = |step, source| Error::RootSwitch { step, source };

    std::env::set_current_dir(root).map_err(|e| step("chdir new root", e))?;
    sys::mount(Some("."), Path::new("/"), None, libc::MS_MOVE, None)
        .map_err(|e| step("move mount", e))?;
    sys::chroot(Path::new(".")).map_err(|e| step("chroot", e))?;
    std::env::set_current_dir("/").map_err(|e| step("chdir /", e))?;

    info!("switched to new root {} via move mount", root.display());
    Ok(())
}

fn busybox_install() -> Result<(), Error> {
    if !Path::new(BUSYBOX_PATH).exists() {
        return Ok(());
    }
    std::fs::create_dir_all("/bin")?;
    std::fs::create_dir_all("/sbin")?;
    let status = std::process::Command::new(BUSYBOX_PATH)
        .args(["--install", "-s"])
        .status()
        .map_err(Error::Io)?;
    if !status.success() {
        return Err(Error::ToolFailed {
            tool: "busybox --install".to_string(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

fn mount_runtime_tmpfs(dir: &Path, flags: libc::c_ulong) -> Result<(), Error> {
    std::fs::create_dir_all(dir)?;
    sys::mount(Some("tmpfs"), dir, Some("tmpfs"), flags, None).map_err(|source| {
        Error::MountFailed {
            src: "tmpfs".to_string(),
            dst: dir.to_path_buf(),
            fs: "tmpfs".to_string(),
            source,
        }
    })?;
    sys::chmod(dir, 0o755)?;
    Ok(())
}

/// Runs in the compartment child after clone: remount proc for the new
/// pid namespace, assemble proc/sys under the new root, switch into
/// it, then provide the runtime mounts.
pub(crate) fn switch_root(vol: &VolumeManager<'_>) -> Result<(), Error> {
    // the old /proc shows the parent pid namespace
    if !vol.compartment.has_userns() {
        let proc = Path::new("/proc");
        if let Err(e) = sys::umount(proc) {
            if e.raw_os_error() != Some(libc::ENOENT) {
                sys::umount_detach(proc).map_err(|source| Error::UmountFailed {
                    dst: proc.to_path_buf(),
                    source,
                })?;
            }
        }
    }
    sys::mount(Some("proc"), Path::new("/proc"), Some("proc"), MS_RELATIME | MS_NOSUID, None)
        .map_err(|source| Error::MountFailed {
            src: "proc".to_string(),
            dst: "/proc".into(),
            fs: "proc".to_string(),
            source,
        })?;

    info!("switching to new rootfs in {}", vol.root.display());
    mount_proc_and_sys(vol, &vol.root)?;

    if vol.host.hosted {
        pivot_into_root(&vol.root)?;
    } else {
        move_into_root(&vol.root)?;
    }

    // without a user namespace, a writable sysrq trigger would reach
    // the host kernel
    if !vol.compartment.has_userns() && Path::new("/proc/sysrq-trigger").exists() {
        let trigger = Path::new("/proc/sysrq-trigger");
        sys::mount(Some("/proc/sysrq-trigger"), trigger, None, MS_BIND, None).map_err(
            |source| Error::MountFailed {
                src: "/proc/sysrq-trigger".to_string(),
                dst: trigger.to_path_buf(),
                fs: "bind".to_string(),
                source,
            },
        )?;
        sys::mount(None, trigger, None, MS_BIND | MS_RDONLY | MS_REMOUNT, None).map_err(
            |source| Error::MountFailed {
                src: "none".to_string(),
                dst: trigger.to_path_buf(),
                fs: "bind".to_string(),
                source,
            },
        )?;
    }

    debug!("mounting /dev/pts");
    sys::mount(
        Some("devpts"),
        Path::new("/dev/pts"),
        Some("devpts"),
        MS_RELATIME | MS_NOSUID,
        None,
    )
    .map_err(|source| Error::MountFailed {
        src: "devpts".to_string(),
        dst: "/dev/pts".into(),
        fs: "devpts".to_string(),
        source,
    })?;

    debug!("mounting /run");
    mount_runtime_tmpfs(Path::new("/run"), MS_RELATIME | MS_NOSUID | MS_NODEV)?;

    debug!("mounting {SOCKET_DIR}");
    mount_runtime_tmpfs(Path::new(SOCKET_DIR), MS_RELATIME | MS_NOSUID)?;

    if vol.compartment.has_setup_mode() {
        if let Err(e) = busybox_install() {
            warn!("cannot install busybox symlinks for setup mode: {e}");
        }
    }

    if let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") {
        info!("mounted filesystems:\n{mounts}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_tty_picks_tty_named_nodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("null"), b"").unwrap();
        std::fs::write(dir.path().join("ttyS0"), b"").unwrap();
        let tty = find_tty(dir.path()).unwrap();
        assert_eq!(tty, "ttyS0");
    }

    #[test]
    fn find_tty_ignores_short_and_unrelated_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tty"), b"").unwrap(); // too short
        std::fs::write(dir.path().join("zero"), b"").unwrap();
        assert_eq!(find_tty(dir.path()), None);
    }

    #[test]
    fn find_tty_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_tty(dir.path()), None);
    }

    #[test]
    fn open_dir_fd_on_missing_path_fails() {
        assert!(open_dir_fd(Path::new("/nonexistent-root-dir")).is_err());
    }

    #[test]
    fn open_dir_fd_on_root_succeeds() {
        assert!(open_dir_fd(Path::new("/")).is_ok());
    }
}
