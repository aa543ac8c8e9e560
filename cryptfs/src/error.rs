//! Error types for the cryptfs engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A device-mapper ioctl returned an errno that is not retried.
    #[error("{cmd} ioctl on '{name}' failed: {source}")]
    Ioctl {
        cmd: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// A retried ioctl (DM_DEV_CREATE / DM_TABLE_LOAD) never succeeded.
    #[error("{cmd} on '{name}' did not succeed after {tries} tries: {source}")]
    RetryExhausted {
        cmd: &'static str,
        name: String,
        tries: u32,
        #[source]
        source: io::Error,
    },

    /// A block device could not be opened or queried.
    #[error("cannot read block device {path}: {source}")]
    BlockDeviceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The block device reports a zero size; nothing can be stacked on it.
    #[error("block device {path} reports zero size")]
    ZeroSize { path: PathBuf },

    /// The hex key does not have the exact length the mode requires.
    #[error("key length mismatch: expected {expected} hex chars, got {actual}")]
    KeyLengthMismatch { expected: usize, actual: usize },

    /// The mode needs a meta device but none was supplied.
    #[error("mode requires a meta device but none was given")]
    MissingMetaDevice,

    /// The meta device carries an integrity superblock for a different
    /// data size. The caller re-formats in response.
    #[error("meta device formatted for {actual} sectors, volume has {expected}")]
    MetaDeviceFormatMismatch { expected: u64, actual: u64 },

    /// Table parameters did not fit into the fixed ioctl buffer.
    #[error("dm table parameters for '{name}' exceed the ioctl buffer")]
    ParamsTooLong { name: String },

    /// No free loop device could be obtained or configured.
    #[error("cannot attach {path} to a loop device: {source}")]
    LoopAttach {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A /dev/mapper node did not appear within the bounded wait.
    #[error("device node {path} did not appear in time")]
    DeviceNodeTimeout { path: PathBuf },

    /// The zero-format pass over a fresh volume failed on both write paths.
    #[error("initial format of {path} failed: {source}")]
    FormatFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The verity hash image has no parsable superblock.
    #[error("no dm-verity superblock on {path}")]
    BadVeritySuperblock { path: PathBuf },
}
