//! dm-integrity target construction and meta-device superblock probe.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::dm::{self, DmControl};
use crate::error::Error;

/// Fixed per-sector tag size for all integrity volumes handled here.
pub const INTEGRITY_TAG_SIZE: u32 = 32;

const INTEGRITY_TYPE: &str = "hmac(sha256)";

/// ASCII magic at offset 0 of a formatted dm-integrity meta device.
const SB_MAGIC: &[u8; 8] = b"integrt\0";
/// Byte offset of the little-endian `provided_data_sectors` field.
const SB_PROVIDED_DATA_SECTORS_OFFSET: u64 = 16;

/// Parameter string for the integrity target.
///
/// Stacked under an authenc crypt target the MACs live inline and the
/// extra params only name the meta device; standalone integrity keys
/// the internal hash itself and allows discards.
pub(crate) fn integrity_params(
    real_blkdev: &str,
    meta_blkdev: &str,
    integrity_key_hex: Option<&str>,
) -> String {
    let extra = match integrity_key_hex {
        None => format!("1 meta_device:{meta_blkdev}"),
        Some(key) => format!(
            "3 meta_device:{meta_blkdev} internal_hash:{INTEGRITY_TYPE}:{key} allow_discards"
        ),
    };
    format!("{real_blkdev} 0 {INTEGRITY_TAG_SIZE} J {extra}")
}

/// Read `provided_data_sectors` from the meta device superblock.
///
/// Returns 0 when the device cannot be read, 1 when no integrity
/// superblock is present (both can never equal a real volume size, so
/// either forces an initial format), otherwise the recorded value.
pub fn provided_data_sectors(meta_blkdev: &Path) -> u64 {
    let mut file = match File::open(meta_blkdev) {
        Ok(f) => f,
        Err(e) => {
            warn!("cannot open meta device {}: {e}", meta_blkdev.display());
            return 0;
        }
    };

    let mut magic = [0u8; 8];
    if file.read_exact(&mut magic).is_err() {
        warn!("cannot read superblock magic from {}", meta_blkdev.display());
        return 0;
    }
    if &magic != SB_MAGIC {
        debug!("no integrity superblock on {}", meta_blkdev.display());
        return 1;
    }

    let mut sectors = [0u8; 8];
    if file.seek(SeekFrom::Start(SB_PROVIDED_DATA_SECTORS_OFFSET)).is_err()
        || file.read_exact(&mut sectors).is_err()
    {
        warn!("cannot read provided_data_sectors from {}", meta_blkdev.display());
        return 0;
    }
    let value = u64::from_le_bytes(sectors);
    debug!("meta device {} provides {value} data sectors", meta_blkdev.display());
    value
}

/// Check that the meta device is already formatted for `fs_size`
/// sectors. The mismatch error tells the caller to zero-format.
pub fn check_meta_formatted(meta_blkdev: &Path, fs_size: u64) -> Result<(), Error> {
    let provided = provided_data_sectors(meta_blkdev);
    if provided == fs_size {
        Ok(())
    } else {
        Err(Error::MetaDeviceFormatMismatch { expected: fs_size, actual: provided })
    }
}

/// Create an integrity mapping named `name` over `real_blkdev` with
/// MAC storage on `meta_blkdev`, then resume it and create its device
/// node. `fs_size` is in 512-byte sectors.
pub(crate) fn create_integrity_blk_dev(
    ctl: &DmControl,
    real_blkdev: &Path,
    meta_blkdev: &Path,
    integrity_key_hex: Option<&str>,
    name: &str,
    fs_size: u64,
    stacked: bool,
) -> Result<PathBuf, Error> {
    if !stacked && integrity_key_hex.is_none() {
        return Err(Error::KeyLengthMismatch { expected: 2 * INTEGRITY_TAG_SIZE as usize, actual: 0 });
    }
    // Stacked mode carries the MACs inside the authenc crypt target; the
    // integrity table itself stays keyless then.
    let key = if stacked { None } else { integrity_key_hex };

    let params = integrity_params(
        &real_blkdev.display().to_string(),
        &meta_blkdev.display().to_string(),
        key,
    );

    ctl.create_device(name)?;
    ctl.load_table(name, "integrity", fs_size, &params, 0)?;
    ctl.resume(name)?;

    let node = ctl.create_device_node(name)?;
    info!("created dm-integrity device '{name}' at {}", node.display());
    Ok(node)
}

/// Remove an integrity mapping and its device node. Missing devices
/// (ENXIO) are not an error.
pub(crate) fn delete_integrity_blk_dev(ctl: &DmControl, name: &str) -> Result<(), Error> {
    let existed = ctl.remove_device(name)?;
    if existed {
        let _ = std::fs::remove_file(dm::device_path(name));
        debug!("deleted dm-integrity device '{name}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn meta_image(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    fn formatted_meta(sectors: u64) -> Vec<u8> {
        let mut sb = vec![0u8; 64];
        sb[..8].copy_from_slice(b"integrt\0");
        sb[16..24].copy_from_slice(&sectors.to_le_bytes());
        sb
    }

    #[test]
    fn stacked_params_only_name_meta_device() {
        let p = integrity_params("/dev/loop3", "/dev/loop4", None);
        assert_eq!(p, "/dev/loop3 0 32 J 1 meta_device:/dev/loop4");
    }

    #[test]
    fn standalone_params_carry_hmac_key_and_discards() {
        let key = "aa".repeat(32);
        let p = integrity_params("/dev/loop3", "/dev/loop4", Some(&key));
        assert_eq!(
            p,
            format!(
                "/dev/loop3 0 32 J 3 meta_device:/dev/loop4 \
                 internal_hash:hmac(sha256):{key} allow_discards"
            )
        );
    }

    #[test]
    fn probe_unreadable_device_is_zero() {
        assert_eq!(provided_data_sectors(Path::new("/nonexistent-meta-img")), 0);
    }

    #[test]
    fn probe_without_magic_is_one() {
        let f = meta_image(&[0u8; 64]);
        assert_eq!(provided_data_sectors(f.path()), 1);
    }

    #[test]
    fn probe_truncated_device_is_zero() {
        let f = meta_image(b"int");
        assert_eq!(provided_data_sectors(f.path()), 0);
    }

    #[test]
    fn probe_reads_sector_count() {
        let f = meta_image(&formatted_meta(131072));
        assert_eq!(provided_data_sectors(f.path()), 131072);
    }

    #[test]
    fn probe_is_idempotent_on_quiescent_device() {
        let f = meta_image(&formatted_meta(2048));
        let first = provided_data_sectors(f.path());
        let second = provided_data_sectors(f.path());
        assert_eq!(first, second);
    }

    #[test]
    fn formatted_check_accepts_matching_size() {
        let f = meta_image(&formatted_meta(4096));
        assert!(check_meta_formatted(f.path(), 4096).is_ok());
    }

    #[test]
    fn formatted_check_rejects_size_change() {
        let f = meta_image(&formatted_meta(4096));
        let err = check_meta_formatted(f.path(), 8192).unwrap_err();
        match err {
            Error::MetaDeviceFormatMismatch { expected, actual } => {
                assert_eq!(expected, 8192);
                assert_eq!(actual, 4096);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fresh_meta_never_matches_a_real_size() {
        let f = meta_image(&[0u8; 64]);
        assert!(check_meta_formatted(f.path(), 2048).is_err());
    }
}
