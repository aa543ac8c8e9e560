//! The shared-files store backing all `BIND_FILE*` mounts: one ext4
//! image, created once, loop-mounted at a well-known host path.

use libc::{MS_NOATIME, MS_NODEV, MS_NOEXEC};
use log::info;

use cryptfs::loopdev::LoopDevice;

use crate::entry::MountType;
use crate::error::Error;
use crate::image;
use crate::sys;
use crate::VolumeManager;

/// Size of the store image in MiB.
const SHARED_STORE_SIZE_MB: u64 = 100;

const STORE_IMAGE: &str = "_store.img";

/// Mount the shared-files store if this compartment binds files out of
/// it. The mountpoint probe makes racing compartment starts converge:
/// whoever mounts first wins, everybody else sees the mount.
pub(crate) fn do_shared_bind_mounts(vol: &VolumeManager<'_>) -> Result<(), Error> {
    let contains_bind = vol
        .mnt
        .iter()
        .any(|e| matches!(e.mount_type(), MountType::BindFile | MountType::BindFileRw));
    if !contains_bind {
        return Ok(());
    }

    let shared_dir = vol.host.shared_files_dir();
    std::fs::create_dir_all(&shared_dir)?;
    if sys::is_mountpoint(&shared_dir) {
        return Ok(());
    }

    let store = shared_dir.join(STORE_IMAGE);
    if !store.exists() {
        image::create_image_empty(&store, None, SHARED_STORE_SIZE_MB)?;
        image::format_image(&store, "ext4")?;
        info!("created shared-files store {}", store.display());
    }

    let loop_dev = LoopDevice::attach(&store)?;
    let dev_str = loop_dev.path().display().to_string();
    sys::mount(
        Some(&dev_str),
        &shared_dir,
        Some("ext4"),
        MS_NOATIME | MS_NODEV | MS_NOEXEC,
        None,
    )
    .map_err(|source| Error::MountFailed {
        src: dev_str,
        dst: shared_dir,
        fs: "ext4".to_string(),
        source,
    })?;
    // the mount keeps the loop association alive from here on
    drop(loop_dev);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CompartmentSpec, HostContext, NullAudit};
    use crate::entry::{MountEntry, MountTable};
    use crate::VolumeManager;

    #[test]
    fn compartments_without_file_binds_skip_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = MountTable::new();
        table.add(MountEntry::new(MountType::Shared, "root", "/", "ext4"));

        let compartment = CompartmentSpec {
            uuid: "11111111-2222-3333-4444-555555555555".into(),
            images_dir: dir.path().join("imgs"),
            ..Default::default()
        };
        let host = HostContext::new(dir.path().join("guestos"), dir.path().join("base"));
        let audit = NullAudit;
        let vol = VolumeManager::new(host, &compartment, &audit, table, MountTable::new());
        do_shared_bind_mounts(&vol).unwrap();
        // nothing was created
        assert!(!vol.host.shared_files_dir().exists());
    }
}
