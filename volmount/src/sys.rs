//! Thin syscall wrappers used by the mount engine.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::thread;
use std::time::{Duration, Instant};

fn cstr(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn cstr_opt(s: Option<&str>) -> io::Result<Option<CString>> {
    s.map(|s| CString::new(s).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL)))
        .transpose()
}

/// `mount(2)`. `source` and `fstype` may be None for bind mounts and
/// remounts; `data` is passed through to the filesystem.
pub(crate) fn mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> io::Result<()> {
    let source = cstr_opt(source)?;
    let target = cstr(target)?;
    let fstype = cstr_opt(fstype)?;
    let data = cstr_opt(data)?;

    let ret = unsafe {
        libc::mount(
            source.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            flags,
            data.as_ref().map_or(ptr::null(), |s| s.as_ptr()) as *const libc::c_void,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn umount(target: &Path) -> io::Result<()> {
    let target = cstr(target)?;
    let ret = unsafe { libc::umount(target.as_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn umount_detach(target: &Path) -> io::Result<()> {
    let target = cstr(target)?;
    let ret = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn chmod(path: &Path, mode: libc::mode_t) -> io::Result<()> {
    let path = cstr(path)?;
    let ret = unsafe { libc::chmod(path.as_ptr(), mode) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a device node; EEXIST is not an error.
pub(crate) fn mknod(path: &Path, mode: libc::mode_t, dev: libc::dev_t) -> io::Result<()> {
    let cpath = cstr(path)?;
    let ret = unsafe { libc::mknod(cpath.as_ptr(), mode, dev) };
    if ret != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::EEXIST) {
            return Err(e);
        }
    }
    Ok(())
}

pub(crate) fn pivot_root(new_root: &Path, put_old: &Path) -> io::Result<()> {
    let new_root = cstr(new_root)?;
    let put_old = cstr(put_old)?;
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, new_root.as_ptr(), put_old.as_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn chroot(path: &Path) -> io::Result<()> {
    let path = cstr(path)?;
    let ret = unsafe { libc::chroot(path.as_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether `path` is the root of a mount: its st_dev differs from its
/// parent's, or it is the filesystem root itself.
pub(crate) fn is_mountpoint(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        // bind-mounted files: compare against the parent directory
        let Some(parent) = path.parent() else { return false };
        let Ok(parent_meta) = std::fs::symlink_metadata(parent) else {
            return false;
        };
        return meta.dev() != parent_meta.dev();
    }
    let Ok(parent_meta) = std::fs::metadata(path.join("..")) else {
        return false;
    };
    meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino()
}

/// `mkdir -p` with an explicit mode. Mount points are created 0777;
/// the mount itself overrides the visible permissions.
pub(crate) fn mkdir_p_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(mode).create(path)
}

/// Unmount whatever is stacked on `path`, escalating to a lazy detach
/// when a plain umount is refused. Loops because several mounts can
/// shadow each other on the same directory.
pub(crate) fn umount_dir(path: &Path) -> io::Result<()> {
    while is_mountpoint(path) {
        if umount(path).is_err() {
            umount_detach(path)?;
        }
    }
    Ok(())
}

/// Touch a file into existence, creating parent directories.
pub(crate) fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Bounded poll for a path to appear. Starts at 10 ms and backs off to
/// 100 ms; udev node creation is usually done within the first tries.
pub(crate) fn wait_for_path(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut delay = Duration::from_millis(10);
    loop {
        if path.exists() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(delay);
        if delay < Duration::from_millis(100) {
            delay *= 2;
        }
    }
}
