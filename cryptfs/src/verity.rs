//! Read-only dm-verity devices from a data image + hash image pair.
//!
//! The hash image is expected to start with the standard veritysetup
//! superblock; geometry and salt are taken from there, the root hash
//! comes from the caller (it is the trust anchor and must not be read
//! from the untrusted image).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::dm::{self, DmControl, DM_READONLY_FLAG};
use crate::error::Error;
use crate::loopdev::LoopDevice;

/// veritysetup superblock magic.
const SB_MAGIC: &[u8; 8] = b"verity\0\0";
const SB_SIZE: usize = 512;

/// Geometry read from a dm-verity hash-device superblock.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct VeritySuperblock {
    pub(crate) algorithm: String,
    pub(crate) data_block_size: u32,
    pub(crate) hash_block_size: u32,
    pub(crate) data_blocks: u64,
    pub(crate) salt_hex: String,
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub(crate) fn parse_superblock(sb: &[u8]) -> Option<VeritySuperblock> {
    if sb.len() < SB_SIZE || &sb[..8] != SB_MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(sb[8..12].try_into().ok()?);
    if version != 1 {
        return None;
    }
    let algorithm = sb[32..64]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>();
    if algorithm.is_empty() {
        return None;
    }
    let data_block_size = u32::from_le_bytes(sb[64..68].try_into().ok()?);
    let hash_block_size = u32::from_le_bytes(sb[68..72].try_into().ok()?);
    let data_blocks = u64::from_le_bytes(sb[72..80].try_into().ok()?);
    let salt_size = u16::from_le_bytes(sb[80..82].try_into().ok()?) as usize;
    if data_block_size == 0 || hash_block_size == 0 || salt_size > 256 {
        return None;
    }
    let salt_hex = if salt_size == 0 {
        // the kernel table wants "-", not an empty string
        "-".to_string()
    } else {
        hex_string(&sb[88..88 + salt_size])
    };
    Some(VeritySuperblock {
        algorithm,
        data_block_size,
        hash_block_size,
        data_blocks,
        salt_hex,
    })
}

fn read_superblock(hash_img: &Path) -> Result<VeritySuperblock, Error> {
    let mut buf = [0u8; SB_SIZE];
    let bad = || Error::BadVeritySuperblock { path: hash_img.to_path_buf() };
    let mut file = File::open(hash_img).map_err(|_| bad())?;
    file.read_exact(&mut buf).map_err(|_| bad())?;
    parse_superblock(&buf).ok_or_else(bad)
}

/// Kernel table line for the verity target. The superblock occupies
/// the first hash block, so the tree starts at block 1.
pub(crate) fn verity_params(
    sb: &VeritySuperblock,
    data_dev: &str,
    hash_dev: &str,
    root_hash_hex: &str,
) -> String {
    format!(
        "1 {data_dev} {hash_dev} {dbs} {hbs} {blocks} 1 {algo} {root_hash_hex} {salt}",
        dbs = sb.data_block_size,
        hbs = sb.hash_block_size,
        blocks = sb.data_blocks,
        algo = sb.algorithm,
        salt = sb.salt_hex,
    )
}

/// A composed verity device. The loop handles stay alive until the
/// caller has mounted (or otherwise referenced) the device.
pub struct VerityDevice {
    path: PathBuf,
    _loops: Vec<LoopDevice>,
}

impl VerityDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Create a read-only verity mapping `<label>` from `data_img`,
/// checked against the merkle tree in `hash_img` and the caller's
/// `root_hash_hex`.
///
/// With `allow_unverified`, a missing root hash or unusable hash image
/// degrades to the bare data loop device instead of failing. That is
/// only acceptable on hosts that do not enforce a verified boot chain.
pub fn create_verity_blk_dev(
    label: &str,
    data_img: &Path,
    hash_img: &Path,
    root_hash_hex: &str,
    allow_unverified: bool,
) -> Result<VerityDevice, Error> {
    let data_loop = LoopDevice::attach(data_img)?;

    let sb = match read_superblock(hash_img) {
        Ok(sb) if !root_hash_hex.is_empty() => sb,
        Ok(_) | Err(_) if allow_unverified => {
            warn!("image {} mounted without verity protection", data_img.display());
            let path = data_loop.path().to_path_buf();
            return Ok(VerityDevice { path, _loops: vec![data_loop] });
        }
        Ok(_) => {
            return Err(Error::BadVeritySuperblock { path: hash_img.to_path_buf() });
        }
        Err(e) => return Err(e),
    };

    let hash_loop = LoopDevice::attach(hash_img)?;
    let num_sectors = sb.data_blocks * u64::from(sb.data_block_size) / 512;

    let params = verity_params(
        &sb,
        &data_loop.path().display().to_string(),
        &hash_loop.path().display().to_string(),
        root_hash_hex,
    );

    let ctl = DmControl::open()?;
    ctl.create_device(label)?;
    let node = ctl
        .load_table(label, "verity", num_sectors, &params, DM_READONLY_FLAG)
        .and_then(|()| ctl.resume(label))
        .and_then(|()| ctl.create_device_node(label))
        .inspect_err(|_| {
            let _ = ctl.remove_device(label);
        })?;
    info!("created dm-verity device '{label}' at {}", node.display());

    Ok(VerityDevice { path: node, _loops: vec![data_loop, hash_loop] })
}

/// Remove a verity mapping and its device node, tolerating ENXIO.
pub fn delete_verity_blk_dev(label: &str) -> Result<(), Error> {
    let ctl = DmControl::open()?;
    if ctl.remove_device(label)? {
        let _ = std::fs::remove_file(dm::device_path(label));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sb(salt: &[u8]) -> Vec<u8> {
        let mut sb = vec![0u8; SB_SIZE];
        sb[..8].copy_from_slice(b"verity\0\0");
        sb[8..12].copy_from_slice(&1u32.to_le_bytes());
        sb[32..38].copy_from_slice(b"sha256");
        sb[64..68].copy_from_slice(&4096u32.to_le_bytes());
        sb[68..72].copy_from_slice(&4096u32.to_le_bytes());
        sb[72..80].copy_from_slice(&25600u64.to_le_bytes());
        sb[80..82].copy_from_slice(&(salt.len() as u16).to_le_bytes());
        sb[88..88 + salt.len()].copy_from_slice(salt);
        sb
    }

    #[test]
    fn superblock_roundtrip() {
        let sb = parse_superblock(&sample_sb(&[0xde, 0xad, 0xbe, 0xef])).unwrap();
        assert_eq!(sb.algorithm, "sha256");
        assert_eq!(sb.data_block_size, 4096);
        assert_eq!(sb.hash_block_size, 4096);
        assert_eq!(sb.data_blocks, 25600);
        assert_eq!(sb.salt_hex, "deadbeef");
    }

    #[test]
    fn empty_salt_becomes_dash() {
        let sb = parse_superblock(&sample_sb(&[])).unwrap();
        assert_eq!(sb.salt_hex, "-");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut raw = sample_sb(&[1, 2]);
        raw[0] = b'x';
        assert!(parse_superblock(&raw).is_none());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut raw = sample_sb(&[1, 2]);
        raw[8..12].copy_from_slice(&2u32.to_le_bytes());
        assert!(parse_superblock(&raw).is_none());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let mut raw = sample_sb(&[1, 2]);
        raw[64..68].copy_from_slice(&0u32.to_le_bytes());
        assert!(parse_superblock(&raw).is_none());
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(parse_superblock(&[0u8; 80]).is_none());
    }

    #[test]
    fn params_follow_kernel_field_order() {
        let sb = parse_superblock(&sample_sb(&[0xab])).unwrap();
        let p = verity_params(&sb, "/dev/loop1", "/dev/loop2", "00112233");
        assert_eq!(p, "1 /dev/loop1 /dev/loop2 4096 4096 25600 1 sha256 00112233 ab");
    }

    #[test]
    fn hex_string_is_lowercase_two_digit() {
        assert_eq!(hex_string(&[0x00, 0x0f, 0xff]), "000fff");
    }
}
