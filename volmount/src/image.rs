//! Image provisioning: path resolution, sparse file creation, copies
//! from guest OS images or raw devices, and filesystem formatting.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};

use crate::context::HostContext;
use crate::entry::{MountEntry, MountType};
use crate::error::Error;

/// Images created on demand are at least this big.
pub(crate) const MIN_IMAGE_SIZE_MB: u64 = 10;

/// dm-integrity meta images are sized at a fifth of the data image;
/// 32-byte tags per 4 KiB block plus journal fit with ample margin.
const META_SIZE_DIVISOR: u64 = 5;

const MKFS_EXT4: &str = "mkfs.ext4";
const MKFS_BTRFS: &str = "mkfs.btrfs";
const BTRFSTUNE: &str = "btrfstune";
const BTRFS: &str = "btrfs";

/// Resolve the backing path for a mount entry.
pub(crate) fn image_path(
    host: &HostContext,
    images_dir: &Path,
    entry: &MountEntry,
) -> Result<PathBuf, Error> {
    let ty = entry.mount_type();
    if ty.uses_guestos_image() {
        return Ok(host.guestos_dir.join(format!("{}.img", entry.img())));
    }
    if ty.uses_compartment_image() {
        return Ok(images_dir.join(format!("{}.img", entry.img())));
    }
    match ty {
        MountType::BindFile | MountType::BindFileRw => {
            Ok(host.shared_files_dir().join(entry.img()))
        }
        // any absolute host path may be bind mounted
        MountType::BindDir | MountType::BindDirRw => Ok(PathBuf::from(entry.img())),
        _ => Err(Error::UnsupportedMountType { img: entry.img().to_string() }),
    }
}

/// Companion meta image holding dm-integrity tags for an entry.
pub(crate) fn meta_image_path(images_dir: &Path, entry: &MountEntry) -> Result<PathBuf, Error> {
    if !entry.mount_type().uses_compartment_image() {
        return Err(Error::UnsupportedMountType { img: entry.img().to_string() });
    }
    Ok(images_dir.join(format!("{}.meta.img", entry.img())))
}

/// dm-verity hash image shipped alongside a guest OS image.
pub(crate) fn hash_image_path(host: &HostContext, entry: &MountEntry) -> Result<PathBuf, Error> {
    match entry.mount_type() {
        MountType::Shared | MountType::SharedRw => {
            Ok(host.guestos_dir.join(format!("{}.hash.img", entry.img())))
        }
        _ => Err(Error::UnsupportedMountType { img: entry.img().to_string() }),
    }
}

/// Create a sparse image file: truncate to size, materialize the last
/// byte, then zero-range the whole extent so dm-integrity finds
/// allocated blocks.
pub(crate) fn create_sparse_file(img: &Path, size: u64) -> io::Result<()> {
    info!("creating empty image file {} with {size} bytes", img.display());

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .custom_flags(libc::O_LARGEFILE)
        .open(img)?;

    file.set_len(size)?;

    let ret = unsafe {
        libc::pwrite(file.as_raw_fd(), b"\0".as_ptr() as *const libc::c_void, 1, (size - 1) as libc::off_t)
    };
    if ret != 1 {
        return Err(io::Error::last_os_error());
    }

    let ret = unsafe {
        libc::fallocate(file.as_raw_fd(), libc::FALLOC_FL_ZERO_RANGE, 0, size as libc::off_t)
    };
    if ret != 0 {
        let e = io::Error::last_os_error();
        // tmpfs lacks ZERO_RANGE; the zero-format pass still
        // materializes MACs there
        if e.raw_os_error() == Some(libc::EOPNOTSUPP) {
            warn!("zero-range allocation unsupported on {}", img.display());
        } else {
            return Err(e);
        }
    }
    Ok(())
}

/// Create a fresh data image (and meta companion when the protection
/// mode needs one) for an EMPTY or OVERLAY_RW entry.
pub(crate) fn create_image_empty(
    img: &Path,
    img_meta: Option<&Path>,
    size_mb: u64,
) -> Result<(), Error> {
    let storage_size = size_mb.max(MIN_IMAGE_SIZE_MB) * 1024 * 1024;
    create_sparse_file(img, storage_size)
        .map_err(|source| Error::Image { path: img.to_path_buf(), source })?;

    if let Some(meta) = img_meta {
        let meta_size = storage_size / META_SIZE_DIVISOR;
        create_sparse_file(meta, meta_size)
            .map_err(|source| Error::Image { path: meta.to_path_buf(), source })?;
    }
    Ok(())
}

/// Copy the guest OS image into the compartment images directory. Two
/// btrfs filesystems with the same device UUID cannot be mounted at
/// once, so copies get a fresh one.
pub(crate) fn create_image_copy(
    host: &HostContext,
    img: &Path,
    entry: &MountEntry,
) -> Result<(), Error> {
    let src = host.guestos_dir.join(format!("{}.img", entry.img()));
    debug!("copying image {} to {}", src.display(), img.display());
    std::fs::copy(&src, img).map_err(|source| Error::Image { path: src, source })?;

    if entry.fs() == "btrfs" {
        info!("regenerating btrfs UUID on {}", img.display());
        btrfs_regen_uuid(img)?;
    }
    Ok(())
}

/// Snapshot a raw block device into an image file.
pub(crate) fn create_image_device(img: &Path, entry: &MountEntry) -> Result<(), Error> {
    let dev = entry.img();
    if !dev.starts_with('/') {
        return Err(Error::RelativeDevicePath { path: dev.to_string() });
    }
    std::fs::copy(dev, img).map_err(|source| Error::Image { path: PathBuf::from(dev), source })?;
    Ok(())
}

/// Provision the backing image for an entry that has none yet.
pub(crate) fn create_image(
    host: &HostContext,
    images_dir: &Path,
    img: &Path,
    entry: &MountEntry,
    with_meta: bool,
) -> Result<(), Error> {
    info!("creating image {}", img.display());

    match entry.mount_type() {
        MountType::Shared | MountType::SharedRw => Ok(()),
        MountType::Empty | MountType::OverlayRw => {
            let meta = if with_meta { Some(meta_image_path(images_dir, entry)?) } else { None };
            create_image_empty(img, meta.as_deref(), entry.size_mb())
        }
        MountType::Copy => create_image_copy(host, img, entry),
        MountType::Device | MountType::DeviceRw => create_image_device(img, entry),
        // flash images are written by firmware tooling, never here
        _ => Err(Error::UnsupportedMountType { img: entry.img().to_string() }),
    }
}

fn run_tool(tool: &str, args: &[&str]) -> Result<(), Error> {
    let status = Command::new(tool)
        .args(args)
        .status()
        .map_err(|e| Error::ToolFailed { tool: format!("{tool}: {e}"), status: -1 })?;
    if !status.success() {
        return Err(Error::ToolFailed {
            tool: tool.to_string(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

fn run_tool_quiet(tool: &str, args: &[&str]) -> Result<(), Error> {
    let status = Command::new(tool)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(|e| Error::ToolFailed { tool: format!("{tool}: {e}"), status: -1 })?;
    if !status.success() {
        return Err(Error::ToolFailed {
            tool: tool.to_string(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Make a filesystem on a fresh device.
pub(crate) fn format_image(dev: &Path, fs: &str) -> Result<(), Error> {
    let mkfs = match fs {
        "ext4" => MKFS_EXT4,
        "btrfs" => MKFS_BTRFS,
        _ => {
            return Err(Error::FormatFailed { dev: dev.to_path_buf(), fs: fs.to_string() });
        }
    };
    let dev_str = dev.display().to_string();
    run_tool(mkfs, &[dev_str.as_str()])
        .map_err(|e| {
            warn!("{mkfs} on {dev_str} failed: {e}");
            Error::FormatFailed { dev: dev.to_path_buf(), fs: fs.to_string() }
        })
}

pub(crate) fn btrfs_regen_uuid(dev: &Path) -> Result<(), Error> {
    let dev_str = dev.display().to_string();
    run_tool(BTRFSTUNE, &["-f", "-u", dev_str.as_str()])
}

/// `subvol=<name>` out of a mount data string.
pub(crate) fn parse_subvol(mount_data: &str) -> Option<&str> {
    mount_data
        .split(',')
        .find_map(|opt| opt.strip_prefix("subvol="))
        .filter(|name| !name.is_empty())
}

/// Ensure the named subvolume exists on a btrfs device: mount the
/// root volume at a scratch dir, create the subvolume if listing it
/// fails, unmount again.
pub(crate) fn btrfs_ensure_subvol(dev: &Path, mount_data: &str) -> Result<(), Error> {
    let Some(subvol) = parse_subvol(mount_data) else {
        return Err(Error::Image {
            path: dev.to_path_buf(),
            source: io::Error::from_raw_os_error(libc::EINVAL),
        });
    };

    let tmp_mount = tempfile::tempdir().map_err(|source| Error::Image {
        path: dev.to_path_buf(),
        source,
    })?;
    let dev_str = dev.display().to_string();

    crate::sys::mount(Some(&dev_str), tmp_mount.path(), Some("btrfs"), 0, None).map_err(
        |source| Error::MountFailed {
            src: dev_str.clone(),
            dst: tmp_mount.path().to_path_buf(),
            fs: "btrfs".to_string(),
            source,
        },
    )?;

    let subvol_path = tmp_mount.path().join(subvol);
    let subvol_str = subvol_path.display().to_string();
    if run_tool_quiet(BTRFS, &["subvol", "list", subvol_str.as_str()]).is_err() {
        match run_tool(BTRFS, &["subvol", "create", subvol_str.as_str()]) {
            Ok(()) => info!("created subvolume {subvol} on btrfs device {}", dev.display()),
            Err(e) => warn!("could not create btrfs subvolume {subvol}: {e}"),
        }
    }

    if let Err(e) = crate::sys::umount(tmp_mount.path()) {
        warn!("could not umount temporary btrfs mount: {e}");
        let _ = crate::sys::umount_detach(tmp_mount.path());
    }
    Ok(())
}
