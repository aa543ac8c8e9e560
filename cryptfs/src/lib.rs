//! Encrypted / integrity-protected block volume composition.
//!
//! Builds, per logical volume, one of four protection stacks on top of
//! a raw block device using Linux device-mapper targets:
//!
//! - `Authenc`: a single crypt target doing AES-XTS + HMAC-SHA256
//!   authenticated encryption, stacked on an inline integrity target
//!   that only provides tag storage (two dm devices, one key).
//! - `IntegrityEncrypt`: independent xts and hmac keys, a plain crypt
//!   target on top of a standalone integrity target.
//! - `EncryptOnly`: one crypt target, no integrity.
//! - `IntegrityOnly`: one standalone integrity target, no encryption.
//!
//! `setup_volume` composes the stack and returns the path of the
//! topmost device node; `delete_blk_dev` tears it down. Newly created
//! volumes are zero-formatted once so integrity MACs exist before the
//! first read.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use zeroize::Zeroizing;

pub mod dm;
mod error;
pub mod loopdev;
pub mod verity;

mod crypt;
mod integrity;

pub use dm::{blkdev_size_sectors, device_path, wait_for_device, DmControl};
pub use error::Error;
pub use integrity::{provided_data_sectors, INTEGRITY_TAG_SIZE};

/// Full-disk-encryption key length in bytes (512-bit XTS).
pub const CRYPTFS_FDE_KEY_LEN: usize = 64;
/// authenc() key length in bytes: 64 byte xts + 32 byte hmac.
const AUTHENC_KEY_LEN: usize = 96;

/// Hex characters consumed per mode component.
pub const CRYPTO_HEXKEY_LEN: usize = 2 * CRYPTFS_FDE_KEY_LEN;
pub const INTEGRITY_HEXKEY_LEN: usize = 2 * INTEGRITY_TAG_SIZE as usize;
const AUTHENC_HEXKEY_LEN: usize = 2 * AUTHENC_KEY_LEN;

/// 100 MiB zero buffer for the initial-format pass.
const ZERO_BUF_SIZE: usize = 100 * 1024 * 1024;

/// How a volume is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptfsMode {
    /// Pass the raw device through unprotected.
    NotImplemented,
    /// Authenticated encryption in one crypt target, tag storage on a
    /// meta device.
    Authenc,
    /// Plain AES-XTS, no integrity.
    EncryptOnly,
    /// Standalone integrity target under a plain crypt target.
    IntegrityEncrypt,
    /// Standalone integrity target only.
    IntegrityOnly,
}

impl CryptfsMode {
    pub fn encrypts(self) -> bool {
        matches!(self, Self::Authenc | Self::EncryptOnly | Self::IntegrityEncrypt)
    }

    pub fn has_integrity(self) -> bool {
        matches!(self, Self::Authenc | Self::IntegrityEncrypt | Self::IntegrityOnly)
    }

    pub fn stacked(self) -> bool {
        matches!(self, Self::Authenc)
    }

    /// Whether a companion meta image must be provisioned for volumes
    /// in this mode.
    pub fn needs_meta_device(self) -> bool {
        self.has_integrity()
    }
}

/// Per-mode key partition, derived up front so the builders only ever
/// see the slice that belongs to them.
#[derive(Debug, PartialEq, Eq)]
struct ModePlan {
    crypto_key_len: usize,
    integrity_key_len: usize,
    encrypt: bool,
    integrity: bool,
    stacked: bool,
}

fn key_plan(mode: CryptfsMode, key_len: usize, has_meta: bool) -> Result<ModePlan, Error> {
    match mode {
        CryptfsMode::NotImplemented => unreachable!("handled by setup_volume"),
        CryptfsMode::Authenc => {
            if !has_meta {
                return Err(Error::MissingMetaDevice);
            }
            if key_len != AUTHENC_HEXKEY_LEN {
                // Historical behavior: tolerate caller-supplied key
                // lengths here, the kernel accepts shortened keys.
                warn!("authenc key is {key_len} hex chars, expected {AUTHENC_HEXKEY_LEN}; using it anyway");
            }
            Ok(ModePlan {
                crypto_key_len: key_len,
                integrity_key_len: 0,
                encrypt: true,
                integrity: true,
                stacked: true,
            })
        }
        CryptfsMode::EncryptOnly => {
            if key_len != CRYPTO_HEXKEY_LEN {
                warn!("xts key is {key_len} hex chars, expected {CRYPTO_HEXKEY_LEN}; using it anyway");
            }
            Ok(ModePlan {
                crypto_key_len: key_len,
                integrity_key_len: 0,
                encrypt: true,
                integrity: false,
                stacked: false,
            })
        }
        CryptfsMode::IntegrityEncrypt => {
            if !has_meta {
                return Err(Error::MissingMetaDevice);
            }
            if key_len != CRYPTO_HEXKEY_LEN + INTEGRITY_HEXKEY_LEN {
                return Err(Error::KeyLengthMismatch {
                    expected: CRYPTO_HEXKEY_LEN + INTEGRITY_HEXKEY_LEN,
                    actual: key_len,
                });
            }
            Ok(ModePlan {
                crypto_key_len: CRYPTO_HEXKEY_LEN,
                integrity_key_len: INTEGRITY_HEXKEY_LEN,
                encrypt: true,
                integrity: true,
                stacked: false,
            })
        }
        CryptfsMode::IntegrityOnly => {
            if !has_meta {
                return Err(Error::MissingMetaDevice);
            }
            if key_len != INTEGRITY_HEXKEY_LEN {
                return Err(Error::KeyLengthMismatch {
                    expected: INTEGRITY_HEXKEY_LEN,
                    actual: key_len,
                });
            }
            Ok(ModePlan {
                crypto_key_len: 0,
                integrity_key_len: INTEGRITY_HEXKEY_LEN,
                encrypt: false,
                integrity: true,
                stacked: false,
            })
        }
    }
}

/// `<label>-integrity`, the child device of a stacked volume.
pub fn integrity_label(label: &str) -> String {
    format!("{label}-integrity")
}

/// Byte-safe slice out of the caller's hex key. Keys are ASCII; a
/// malformed input degrades to replacement characters instead of a
/// panic on a char boundary.
fn key_slice(key_hex: &str, start: usize, len: usize) -> Zeroizing<String> {
    Zeroizing::new(String::from_utf8_lossy(&key_hex.as_bytes()[start..start + len]).into_owned())
}

/// Compose the protection stack for one volume.
///
/// Returns the path of the topmost block device (`/dev/mapper/<label>`
/// or `/dev/mapper/<label>-integrity` for integrity-only volumes). On
/// any failure the partially built stack is torn down before the error
/// is returned, and every internal key copy is scrubbed either way.
pub fn setup_volume(
    label: &str,
    real_blkdev: &Path,
    key_hex: &str,
    meta_blkdev: Option<&Path>,
    mode: CryptfsMode,
) -> Result<PathBuf, Error> {
    if mode == CryptfsMode::NotImplemented {
        warn!("cryptfs mode NOT_IMPLEMENTED, passing through {}", real_blkdev.display());
        return Ok(real_blkdev.to_path_buf());
    }

    let plan = key_plan(mode, key_hex.len(), meta_blkdev.is_some())?;

    // First crypto_key_len hex chars key the crypt target, the
    // following integrity_key_len chars key the hmac. Copies are
    // zeroized on every exit path.
    let crypto_key: Zeroizing<String> = key_slice(key_hex, 0, plan.crypto_key_len);
    let integrity_key: Option<Zeroizing<String>> = (plan.integrity_key_len > 0)
        .then(|| key_slice(key_hex, plan.crypto_key_len, plan.integrity_key_len));

    let fs_size = blkdev_size_sectors(real_blkdev)?;
    if fs_size == 0 {
        return Err(Error::ZeroSize { path: real_blkdev.to_path_buf() });
    }
    debug!("volume '{label}': {fs_size} sectors, mode {mode:?}");

    let ctl = DmControl::open()?;
    let int_label = integrity_label(label);

    let mut initial_format = false;
    let mut integrity_blkdev: Option<PathBuf> = None;

    if plan.integrity {
        let meta = meta_blkdev.ok_or(Error::MissingMetaDevice)?;
        if let Err(e) = integrity::check_meta_formatted(meta, fs_size) {
            info!("volume '{label}' needs initial format: {e}");
            initial_format = true;
        }
        let dev = integrity::create_integrity_blk_dev(
            &ctl,
            real_blkdev,
            meta,
            integrity_key.as_deref().map(String::as_str),
            &int_label,
            fs_size,
            plan.stacked,
        )
        .map_err(|e| unwind(&ctl, label, &int_label, e))?;
        integrity_blkdev = Some(dev);
    }

    let crypto_blkdev = if plan.encrypt {
        // With a meta device present the crypt target sits on the
        // integrity child, otherwise directly on the real device.
        let base = match &integrity_blkdev {
            Some(dev) if meta_blkdev.is_some() => dev.as_path(),
            _ => real_blkdev,
        };
        crypt::create_crypto_blk_dev(&ctl, base, &crypto_key, label, fs_size, plan.stacked)
            .map_err(|e| unwind(&ctl, label, &int_label, e))?
    } else {
        match integrity_blkdev.clone() {
            Some(dev) => dev,
            // key_plan only disables encryption for integrity modes
            None => return Err(Error::MissingMetaDevice),
        }
    };

    if initial_format {
        // Without this pass, reads of sectors that never had MACs
        // generated fail with EIO, including the read-modify-write
        // cycles of sub-block writes.
        debug!(
            "formatting {} to generate initial MACs on {:?}",
            crypto_blkdev.display(),
            integrity_blkdev
        );
        if let Err(e) = write_zeros(&crypto_blkdev, fs_size * 512) {
            warn!(
                "zero format of {} via heap buffer failed ({e}), retrying with O_DIRECT",
                crypto_blkdev.display()
            );
            if let Err(e) = write_zeros_direct(&crypto_blkdev, fs_size * 512) {
                let err = Error::FormatFailed { path: crypto_blkdev.clone(), source: e };
                return Err(unwind(&ctl, label, &int_label, err));
            }
        }
        info!("generated initial MACs on volume '{label}'");
    }

    Ok(crypto_blkdev)
}

/// Reverse teardown for a failed setup: crypt first, then integrity,
/// both tolerating absence. Returns the original error.
fn unwind(ctl: &DmControl, label: &str, int_label: &str, err: Error) -> Error {
    warn!("setup of volume '{label}' failed, unwinding: {err}");
    if let Err(e) = crypt::delete_crypto_blk_dev(ctl, label) {
        warn!("unwind: could not remove crypt device '{label}': {e}");
    }
    if let Err(e) = integrity::delete_integrity_blk_dev(ctl, int_label) {
        warn!("unwind: could not remove integrity device '{int_label}': {e}");
    }
    err
}

/// Tear down the stack of `label` according to `mode`. Devices that
/// are already gone are fine; calling this twice is a no-op.
pub fn delete_blk_dev(label: &str, mode: CryptfsMode) -> Result<(), Error> {
    let (encrypt, integrity) = match mode {
        CryptfsMode::Authenc | CryptfsMode::IntegrityEncrypt => (true, true),
        CryptfsMode::EncryptOnly => (true, false),
        CryptfsMode::IntegrityOnly => (false, true),
        CryptfsMode::NotImplemented => {
            warn!("delete_blk_dev called for mode NOT_IMPLEMENTED, nothing to do");
            return Ok(());
        }
    };

    let ctl = DmControl::open()?;
    if encrypt {
        crypt::delete_crypto_blk_dev(&ctl, label)?;
    }
    if integrity {
        integrity::delete_integrity_blk_dev(&ctl, &integrity_label(label))?;
    }
    Ok(())
}

/// Sequential zero pass through the whole device with a large heap
/// buffer, fsynced at the end.
fn write_zeros(dev: &Path, size: u64) -> io::Result<()> {
    let mut zeros: Vec<u8> = Vec::new();
    zeros
        .try_reserve_exact(ZERO_BUF_SIZE)
        .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
    zeros.resize(ZERO_BUF_SIZE, 0);

    let mut file = OpenOptions::new().write(true).open(dev)?;
    let mut written: u64 = 0;
    while written < size {
        let chunk = (size - written).min(ZERO_BUF_SIZE as u64) as usize;
        file.write_all(&zeros[..chunk])?;
        written += chunk as u64;
    }
    file.sync_all()
}

/// Fallback zero pass for memory-constrained hosts: O_DIRECT with one
/// 512-aligned 4 KiB block, so no page-cache pressure at all.
fn write_zeros_direct(dev: &Path, size: u64) -> io::Result<()> {
    #[repr(C, align(512))]
    struct Block([u8; 4096]);
    let block = Block([0u8; 4096]);

    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(dev)?;
    for _ in 0..size / 4096 {
        file.write_all(&block.0)?;
    }
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mode_table_matches_design() {
        // mode          integrity  crypt  stacked
        for (mode, integrity, encrypt, stacked) in [
            (CryptfsMode::Authenc, true, true, true),
            (CryptfsMode::IntegrityEncrypt, true, true, false),
            (CryptfsMode::EncryptOnly, false, true, false),
            (CryptfsMode::IntegrityOnly, true, false, false),
        ] {
            assert_eq!(mode.has_integrity(), integrity, "{mode:?}");
            assert_eq!(mode.encrypts(), encrypt, "{mode:?}");
            assert_eq!(mode.stacked(), stacked, "{mode:?}");
        }
        assert!(!CryptfsMode::NotImplemented.encrypts());
        assert!(!CryptfsMode::NotImplemented.has_integrity());
    }

    #[test]
    fn authenc_accepts_exact_key() {
        let plan = key_plan(CryptfsMode::Authenc, AUTHENC_HEXKEY_LEN, true).unwrap();
        assert_eq!(plan.crypto_key_len, 192);
        assert_eq!(plan.integrity_key_len, 0);
        assert!(plan.stacked);
    }

    #[test]
    fn authenc_warns_but_accepts_short_key() {
        // deliberately tolerated, see key_plan
        let plan = key_plan(CryptfsMode::Authenc, 100, true).unwrap();
        assert_eq!(plan.crypto_key_len, 100);
    }

    #[test]
    fn authenc_without_meta_is_rejected() {
        assert!(matches!(
            key_plan(CryptfsMode::Authenc, AUTHENC_HEXKEY_LEN, false),
            Err(Error::MissingMetaDevice)
        ));
    }

    #[test]
    fn integrity_encrypt_requires_exact_192() {
        let plan = key_plan(CryptfsMode::IntegrityEncrypt, 192, true).unwrap();
        assert_eq!(plan.crypto_key_len, 128);
        assert_eq!(plan.integrity_key_len, 64);
        assert!(!plan.stacked);

        for bad in [0, 64, 128, 191, 193, 256] {
            assert!(
                matches!(
                    key_plan(CryptfsMode::IntegrityEncrypt, bad, true),
                    Err(Error::KeyLengthMismatch { expected: 192, .. })
                ),
                "length {bad} must be rejected"
            );
        }
    }

    #[test]
    fn integrity_only_requires_exact_64() {
        let plan = key_plan(CryptfsMode::IntegrityOnly, 64, true).unwrap();
        assert_eq!(plan.crypto_key_len, 0);
        assert_eq!(plan.integrity_key_len, 64);
        assert!(!plan.encrypt);

        assert!(key_plan(CryptfsMode::IntegrityOnly, 63, true).is_err());
        assert!(key_plan(CryptfsMode::IntegrityOnly, 65, true).is_err());
    }

    #[test]
    fn encrypt_only_tolerates_any_length() {
        assert_eq!(key_plan(CryptfsMode::EncryptOnly, 128, false).unwrap().crypto_key_len, 128);
        assert_eq!(key_plan(CryptfsMode::EncryptOnly, 32, false).unwrap().crypto_key_len, 32);
    }

    #[test]
    fn not_implemented_passes_device_through() {
        let dev = Path::new("/dev/null-like");
        let out = setup_volume("x", dev, "", None, CryptfsMode::NotImplemented).unwrap();
        assert_eq!(out, dev);
    }

    #[test]
    fn integrity_label_shape() {
        assert_eq!(integrity_label("c1-data"), "c1-data-integrity");
    }

    #[test]
    fn write_zeros_fills_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(f.path(), vec![0xffu8; 8192]).unwrap();
        write_zeros(f.path(), 8192).unwrap();
        let contents = std::fs::read(f.path()).unwrap();
        assert_eq!(contents.len(), 8192);
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_zeros_direct_fills_file_where_supported() {
        // tmpfs rejects O_DIRECT; only assert when the open succeeds.
        let dir = tempfile::tempdir_in(".").unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0xaau8; 8192]).unwrap();
        match write_zeros_direct(&path, 8192) {
            Ok(()) => {
                let contents = std::fs::read(&path).unwrap();
                assert!(contents.iter().all(|&b| b == 0));
            }
            Err(e) => {
                assert!(
                    matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOTSUP)),
                    "unexpected O_DIRECT failure: {e}"
                );
            }
        }
    }

    proptest! {
        #[test]
        fn key_plan_partitions_never_exceed_key(
            len in 0usize..512,
            meta in proptest::bool::ANY,
        ) {
            for mode in [
                CryptfsMode::Authenc,
                CryptfsMode::EncryptOnly,
                CryptfsMode::IntegrityEncrypt,
                CryptfsMode::IntegrityOnly,
            ] {
                if let Ok(plan) = key_plan(mode, len, meta) {
                    prop_assert!(plan.crypto_key_len + plan.integrity_key_len <= len);
                    prop_assert_eq!(plan.integrity, mode.has_integrity());
                    prop_assert_eq!(plan.encrypt, mode.encrypts());
                }
            }
        }
    }
}
