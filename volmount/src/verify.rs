//! Whole-image integrity verification.
//!
//! Base images without a verity root hash are verified blocking before
//! any mount. Verity-protected images already fail closed on block
//! access, so their thorough check runs in a forked child per image,
//! tracked via the compartment's child registry.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use log::{debug, error, info};
use sha2::{Digest, Sha256};

use crate::context::AuditEvent;
use crate::entry::{MountEntry, MountType};
use crate::error::Error;
use crate::image;
use crate::VolumeManager;

/// Streaming SHA-256 of a file, hex encoded.
pub(crate) fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in digest {
        hex.push_str(&format!("{b:02x}"));
    }
    Ok(hex)
}

/// Base images shipped by the guest OS; everything else is either
/// generated locally or bound from the host.
fn is_base_image(entry: &MountEntry) -> bool {
    matches!(
        entry.mount_type(),
        MountType::Shared | MountType::SharedRw | MountType::OverlayRo
    )
}

fn check_image(vol: &VolumeManager<'_>, entry: &MountEntry, expected: &str) -> Result<(), Error> {
    let img = image::image_path(&vol.host, vol.compartment.images_dir(), entry)?;
    let actual = sha256_file(&img).map_err(|source| Error::Image { path: img.clone(), source })?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::VerifyFailed { img: entry.img().to_string() });
    }
    Ok(())
}

/// Blocking verification of base images that dm-verity does not cover.
pub(crate) fn verify_mount_entries(vol: &VolumeManager<'_>) -> Result<(), Error> {
    let uuid = vol.compartment.uuid();
    for entry in vol.mnt.iter() {
        if !is_base_image(entry) || entry.verity_root_hash().is_some() {
            continue;
        }
        let Some(expected) = entry.img_sha256() else {
            debug!("no digest recorded for image {}, skipping check", entry.img());
            continue;
        };
        match check_image(vol, entry, expected) {
            Ok(()) => {
                vol.audit.record(uuid, AuditEvent::VerifyImage { img: entry.img(), ok: true });
            }
            Err(e) => {
                error!("cannot verify image {}: image file is corrupted", entry.img());
                vol.audit.record(uuid, AuditEvent::VerifyImage { img: entry.img(), ok: false });
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Background verification of verity-protected base images: dm-verity
/// catches tampering on access, the forked child reads the whole image
/// once so dormant corruption surfaces early.
pub(crate) fn verify_mount_entries_bg(vol: &VolumeManager<'_>) -> Result<(), Error> {
    let uuid = vol.compartment.uuid();
    for entry in vol.mnt.iter() {
        if !is_base_image(entry) || entry.verity_root_hash().is_none() {
            continue;
        }
        let Some(expected) = entry.img_sha256() else {
            debug!("no digest recorded for image {}, skipping background check", entry.img());
            continue;
        };

        // no shared mutable state crosses this fork; the child only
        // reads the image and exits with a status code
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            0 => {
                let ok = check_image(vol, entry, expected).is_ok();
                if !ok {
                    error!("cannot verify image {}: image file is corrupted", entry.img());
                }
                vol.audit.record(uuid, AuditEvent::VerifyImage { img: entry.img(), ok });
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            pid => {
                info!(
                    "dm-verity active for image {}, thorough check continues in background",
                    entry.img()
                );
                vol.compartment.watch_child("vol-bg-check", pid);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_content() {
        let f = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(f.path(), b"abc").unwrap();
        assert_eq!(
            sha256_file(f.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha256_of_empty_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            sha256_file(f.path()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sha256_streams_large_files() {
        let f = tempfile::NamedTempFile::new().unwrap();
        // crosses several 64 KiB read buffers
        std::fs::write(f.path(), vec![0u8; 200_000]).unwrap();
        let hex = sha256_file(f.path()).unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn base_image_classification() {
        for ty in [MountType::Shared, MountType::SharedRw, MountType::OverlayRo] {
            assert!(is_base_image(&MountEntry::new(ty, "a", "/", "ext4")));
        }
        for ty in [MountType::Empty, MountType::OverlayRw, MountType::BindDir, MountType::Copy] {
            assert!(!is_base_image(&MountEntry::new(ty, "a", "/", "ext4")));
        }
    }
}
