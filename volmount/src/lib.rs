//! Compartment volume management.
//!
//! Takes a declarative mount table and assembles a live root
//! filesystem for one compartment: images are provisioned, attached to
//! loop devices, optionally wrapped in dm-verity or the cryptfs
//! protection stack, mounted under `/tmp/<uuid>` with overlayfs
//! composition where requested, and finally entered via `pivot_root`.
//! Teardown releases everything in exact reverse order and tolerates
//! state that is already gone.
//!
//! The lifecycle mirrors the compartment framework's hook contract:
//!
//! - `select_dm_mode`: pre-clone, decides the protection mode
//! - `setup`: child-early, verifies and mounts everything
//! - `verify_images_bg`: post-clone, forks background image checks
//! - `populate_dev`: pre-exec, fills the compartment's `/dev`
//! - `switch_root`: child, pivots into the assembled tree
//! - `cleanup`: after stop, unmounts and removes dm devices

use std::path::{Path, PathBuf};

use log::{info, warn};

pub use cryptfs::CryptfsMode;

mod context;
mod entry;
mod error;
mod image;
mod mount;
mod overlay;
mod rootfs;
mod shared;
mod sys;
mod verify;

pub use context::{AuditEvent, AuditSink, Compartment, CompartmentSpec, HostContext, NullAudit};
pub use entry::{MountEntry, MountTable, MountType};
pub use error::Error;

/// Marker file selecting the non-stacked protection policy for a
/// compartment's images directory.
const NOT_STACKED_FILE: &str = "not-stacked";

/// Volume state and lifecycle driver for one compartment.
pub struct VolumeManager<'a> {
    pub(crate) host: HostContext,
    pub(crate) compartment: &'a dyn Compartment,
    pub(crate) audit: &'a dyn AuditSink,
    /// `/tmp/<uuid>`, the scratch root all images assemble under.
    pub(crate) root: PathBuf,
    /// Monotonic per-compartment counter naming overlay scratch dirs.
    pub(crate) overlay_count: u32,
    pub(crate) mnt: MountTable,
    pub(crate) mnt_setup: MountTable,
    pub(crate) mode: CryptfsMode,
}

impl<'a> VolumeManager<'a> {
    pub fn new(
        host: HostContext,
        compartment: &'a dyn Compartment,
        audit: &'a dyn AuditSink,
        mnt: MountTable,
        mnt_setup: MountTable,
    ) -> Self {
        let root = host.compartment_root(compartment.uuid());
        VolumeManager {
            host,
            compartment,
            audit,
            root,
            overlay_count: 0,
            mnt,
            mnt_setup,
            mode: CryptfsMode::NotImplemented,
        }
    }

    /// The directory the composed root is assembled under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> CryptfsMode {
        self.mode
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mnt
    }

    /// Whether any entry of this compartment is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.mnt.iter().any(MountEntry::is_encrypted)
    }

    fn images_dir_contains_image(&self) -> bool {
        let Ok(entries) = std::fs::read_dir(self.compartment.images_dir()) else {
            return false;
        };
        entries.flatten().any(|e| {
            e.path().extension().map(|ext| ext == "img").unwrap_or(false)
        })
    }

    /// Decide the protection mode for this start, pre-clone.
    ///
    /// Image directories marked `not-stacked` (and all newly created
    /// ones) use the non-stacked policy so TRIM keeps working on SSDs;
    /// directories with existing images and no marker were created by
    /// the stacked engine and stay on AUTHENC. The privileged c0
    /// compartment stores no secrets and gets integrity only.
    pub fn select_dm_mode(&mut self) -> CryptfsMode {
        let images_dir = self.compartment.images_dir();
        let is_c0 = context::is_c0(self.compartment.uuid());
        let not_stacked = images_dir.join(NOT_STACKED_FILE);

        self.mode = if not_stacked.exists() {
            if is_c0 { CryptfsMode::IntegrityOnly } else { CryptfsMode::IntegrityEncrypt }
        } else if self.images_dir_contains_image() {
            CryptfsMode::Authenc
        } else {
            if std::fs::create_dir_all(images_dir)
                .and_then(|()| std::fs::write(&not_stacked, b""))
                .is_err()
            {
                warn!("could not persist {} marker", not_stacked.display());
            }
            if is_c0 { CryptfsMode::IntegrityOnly } else { CryptfsMode::IntegrityEncrypt }
        };
        self.mode
    }

    /// Mount every entry, setup-mode entries first at the root and the
    /// regular table below `<root>/setup` then. On any failure the full
    /// symmetric teardown runs before the error is returned.
    pub fn mount_images(&mut self) -> Result<(), Error> {
        let setup_mode = self.compartment.has_setup_mode();
        let c_root = if setup_mode { self.root.join("setup") } else { self.root.clone() };

        let result = (|| -> Result<(), Error> {
            if setup_mode {
                let setup_entries: Vec<MountEntry> = self.mnt_setup.iter().cloned().collect();
                let root = self.root.clone();
                for entry in &setup_entries {
                    mount::mount_image(self, &root, entry)?;
                }
                if let Err(e) = std::fs::create_dir_all(&c_root) {
                    warn!("could not mkdir {}: {e}", c_root.display());
                }
            }

            let entries: Vec<MountEntry> = self.mnt.iter().cloned().collect();
            for entry in &entries {
                mount::mount_image(self, &c_root, entry)?;
            }
            Ok(())
        })();

        if let Err(e) = &result {
            warn!("mounting images failed ({e}), tearing down");
            if let Err(e) = self.umount_all() {
                warn!("teardown after failed setup: {e}");
            }
            self.cleanup_dm();
        }
        result
    }

    /// Child-early hook: verify base images, prepare directories,
    /// mount everything including the shared store and `/dev`.
    pub fn setup(&mut self) -> Result<(), Error> {
        verify::verify_mount_entries(self)?;

        info!("mounting rootfs to {}", self.root.display());
        std::fs::create_dir_all(self.compartment.images_dir())?;
        std::fs::create_dir_all(&self.host.tmp_dir)?;
        sys::mkdir_p_mode(&self.root, 0o700)?;

        self.mount_images()?;

        shared::do_shared_bind_mounts(self)?;

        rootfs::mount_dev(self)?;
        Ok(())
    }

    /// Post-clone hook: background verification of verity images.
    pub fn verify_images_bg(&self) -> Result<(), Error> {
        verify::verify_mount_entries_bg(self)
    }

    /// Pre-exec hook: populate the compartment's `/dev`.
    pub fn populate_dev(&self) -> Result<(), Error> {
        rootfs::populate_dev(self)
    }

    /// Child hook: pivot (or move) into the assembled root and provide
    /// the runtime mounts.
    pub fn switch_root(&self) -> Result<(), Error> {
        rootfs::switch_root(self)
    }

    /// Unmount every entry in reverse order, then release the overlay
    /// scratch tree. Never aborts early; reports what survived.
    pub fn umount_all(&self) -> Result<(), Error> {
        let setup_mode = self.compartment.has_setup_mode();
        let c_root = if setup_mode { self.root.join("setup") } else { self.root.clone() };
        let mut remained: Vec<String> = Vec::new();

        let mut release = |dir: PathBuf| {
            if let Err(e) = sys::umount_dir(&dir) {
                warn!("could not umount {}: {e}", dir.display());
                remained.push(dir.display().to_string());
            }
        };

        release(self.root.join("dev"));

        if setup_mode {
            for entry in self.mnt_setup.iter().rev() {
                release(mount::target_dir(&self.root, entry.dir()));
            }
        }
        for entry in self.mnt.iter().rev() {
            release(mount::target_dir(&c_root, entry.dir()));
        }

        if setup_mode {
            let _ = std::fs::remove_dir(&c_root);
        }
        if std::fs::remove_dir(&self.root).is_err() {
            log::debug!("unable to remove {}", self.root.display());
        }

        overlay::cleanup_overlays(&self.host.overlay_dir(self.compartment.uuid()));

        if remained.is_empty() {
            Ok(())
        } else {
            Err(Error::TeardownPartial { what: remained.join(", ") })
        }
    }

    /// Remove this compartment's dm devices, dispatching on the live
    /// target type of each label. Labels that are gone already are
    /// skipped silently.
    pub fn cleanup_dm(&self) {
        let ctl = match cryptfs::DmControl::open() {
            Ok(ctl) => ctl,
            Err(e) => {
                warn!("cannot open device-mapper for cleanup: {e}");
                return;
            }
        };

        for entry in self.mnt.iter().rev() {
            let label = format!("{}-{}", self.compartment.uuid(), entry.img());
            let ty = match ctl.target_type(&label) {
                Ok(Some(ty)) => ty,
                Ok(None) => continue,
                Err(e) => {
                    warn!("failed to get target type of '{label}': {e}");
                    continue;
                }
            };
            log::debug!("cleanup: removing block device '{label}' of type {ty}");
            match ty.as_str() {
                "crypt" | "integrity" => {
                    if let Err(e) = cryptfs::delete_blk_dev(&label, self.mode) {
                        warn!("could not delete dm-{ty} device '{label}': {e}");
                    }
                }
                "verity" => {
                    if let Err(e) = cryptfs::verity::delete_verity_blk_dev(&label) {
                        warn!("could not delete dm-verity device '{label}': {e}");
                    }
                }
                other => {
                    warn!("unexpected target type {other} for '{label}', leaving it alone");
                }
            }
        }
    }

    /// Full teardown after a compartment stops. Across a reboot the dm
    /// devices deliberately survive so the next start skips the
    /// zero-format pass.
    pub fn cleanup(&self, is_rebooting: bool) {
        if let Err(e) = self.umount_all() {
            warn!("could not umount all images properly: {e}");
        }
        if !is_rebooting {
            self.cleanup_dm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compartment(dir: &Path, uuid: &str) -> CompartmentSpec {
        CompartmentSpec {
            uuid: uuid.into(),
            images_dir: dir.join("imgs"),
            ..Default::default()
        }
    }

    fn host(dir: &Path) -> HostContext {
        let mut host = HostContext::new(dir.join("guestos"), dir.join("base"));
        host.tmp_dir = dir.join("tmp");
        host
    }

    const UUID: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
    const C0_UUID: &str = "00000000-0000-0000-0000-000000000000";

    #[test]
    fn root_is_tmp_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let c = compartment(dir.path(), UUID);
        let audit = NullAudit;
        let vol =
            VolumeManager::new(host(dir.path()), &c, &audit, MountTable::new(), MountTable::new());
        assert_eq!(vol.root(), dir.path().join("tmp").join(UUID));
    }

    #[test]
    fn fresh_images_dir_selects_non_stacked_and_persists_marker() {
        let dir = tempfile::tempdir().unwrap();
        let c = compartment(dir.path(), UUID);
        let audit = NullAudit;
        let mut vol =
            VolumeManager::new(host(dir.path()), &c, &audit, MountTable::new(), MountTable::new());

        assert_eq!(vol.select_dm_mode(), CryptfsMode::IntegrityEncrypt);
        assert!(dir.path().join("imgs").join(NOT_STACKED_FILE).exists());
        // stable across restarts
        assert_eq!(vol.select_dm_mode(), CryptfsMode::IntegrityEncrypt);
    }

    #[test]
    fn c0_gets_integrity_only() {
        let dir = tempfile::tempdir().unwrap();
        let c = compartment(dir.path(), C0_UUID);
        let audit = NullAudit;
        let mut vol =
            VolumeManager::new(host(dir.path()), &c, &audit, MountTable::new(), MountTable::new());
        assert_eq!(vol.select_dm_mode(), CryptfsMode::IntegrityOnly);
    }

    #[test]
    fn existing_images_without_marker_stay_stacked() {
        let dir = tempfile::tempdir().unwrap();
        let imgs = dir.path().join("imgs");
        std::fs::create_dir_all(&imgs).unwrap();
        std::fs::write(imgs.join("data.img"), b"").unwrap();

        let c = compartment(dir.path(), UUID);
        let audit = NullAudit;
        let mut vol =
            VolumeManager::new(host(dir.path()), &c, &audit, MountTable::new(), MountTable::new());
        assert_eq!(vol.select_dm_mode(), CryptfsMode::Authenc);
    }

    #[test]
    fn marker_beats_existing_images() {
        let dir = tempfile::tempdir().unwrap();
        let imgs = dir.path().join("imgs");
        std::fs::create_dir_all(&imgs).unwrap();
        std::fs::write(imgs.join("data.img"), b"").unwrap();
        std::fs::write(imgs.join(NOT_STACKED_FILE), b"").unwrap();

        let c = compartment(dir.path(), UUID);
        let audit = NullAudit;
        let mut vol =
            VolumeManager::new(host(dir.path()), &c, &audit, MountTable::new(), MountTable::new());
        assert_eq!(vol.select_dm_mode(), CryptfsMode::IntegrityEncrypt);
    }

    #[test]
    fn encryption_flag_aggregates_over_entries() {
        let dir = tempfile::tempdir().unwrap();
        let c = compartment(dir.path(), UUID);
        let audit = NullAudit;

        let mut table = MountTable::new();
        table.add(MountEntry::new(MountType::Shared, "root", "/", "ext4"));
        let vol =
            VolumeManager::new(host(dir.path()), &c, &audit, table.clone(), MountTable::new());
        assert!(!vol.is_encrypted());

        table.add(MountEntry::new(MountType::Empty, "data", "/data", "ext4").encrypted(true));
        let vol = VolumeManager::new(host(dir.path()), &c, &audit, table, MountTable::new());
        assert!(vol.is_encrypted());
    }

    #[test]
    fn umount_all_with_nothing_mounted_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let c = compartment(dir.path(), UUID);
        let audit = NullAudit;
        let mut table = MountTable::new();
        table.add(MountEntry::new(MountType::Empty, "data", "/data", "ext4"));

        let vol = VolumeManager::new(host(dir.path()), &c, &audit, table, MountTable::new());
        // no mounts exist; teardown must still succeed end to end
        vol.umount_all().unwrap();
        vol.umount_all().unwrap();
    }
}
