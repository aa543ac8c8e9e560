//! dm-crypt target construction.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::dm::{self, DmControl, DM_EXISTS_FLAG};
use crate::error::Error;
use crate::integrity::INTEGRITY_TAG_SIZE;

/// Kernel crypto API spec for authenticated encryption: AES-XTS with
/// an HMAC-SHA256 tag per sector, random IV.
const CRYPTO_TYPE_AUTHENC: &str = "capi:authenc(hmac(sha256),xts(aes))-random";
/// Plain 512-bit XTS for the non-authenticated modes.
const CRYPTO_TYPE: &str = "aes-xts-plain64";

/// Parameter string for the crypt target.
pub(crate) fn crypt_params(real_blkdev: &str, key_hex: &str, stacked: bool) -> String {
    let crypto_type = if stacked { CRYPTO_TYPE_AUTHENC } else { CRYPTO_TYPE };
    let extra = if stacked {
        format!("1 integrity:{INTEGRITY_TAG_SIZE}:aead")
    } else {
        "1 allow_discards".to_string()
    };
    format!("{crypto_type} {key_hex} 0 {real_blkdev} 0 {extra}")
}

/// Create a crypt mapping named `name` over `real_blkdev`, resume it
/// and create its device node. `fs_size` is in 512-byte sectors.
pub(crate) fn create_crypto_blk_dev(
    ctl: &DmControl,
    real_blkdev: &Path,
    key_hex: &str,
    name: &str,
    fs_size: u64,
    stacked: bool,
) -> Result<PathBuf, Error> {
    let params = crypt_params(&real_blkdev.display().to_string(), key_hex, stacked);

    ctl.create_device(name)?;
    ctl.load_table(name, "crypt", fs_size, &params, DM_EXISTS_FLAG)?;
    ctl.resume(name)?;

    let node = ctl.create_device_node(name)?;
    info!("created dm-crypt device '{name}' at {}", node.display());
    Ok(node)
}

/// Remove a crypt mapping and its device node. Missing devices
/// (ENXIO) are not an error.
pub(crate) fn delete_crypto_blk_dev(ctl: &DmControl, name: &str) -> Result<(), Error> {
    let existed = ctl.remove_device(name)?;
    if existed {
        let _ = std::fs::remove_file(dm::device_path(name));
        debug!("deleted dm-crypt device '{name}'");
    }
    Ok(())
}
