//! Error types for volume setup and teardown.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cryptfs(#[from] cryptfs::Error),

    #[error("mount of {src} on {dst} ({fs}) failed: {source}")]
    MountFailed {
        src: String,
        dst: PathBuf,
        fs: String,
        #[source]
        source: io::Error,
    },

    #[error("unmount of {dst} failed: {source}")]
    UmountFailed {
        dst: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not format {dev} as {fs}")]
    FormatFailed { dev: PathBuf, fs: String },

    #[error("overlay assembly failed at {step}: {source}")]
    OverlayAssemblyFailed {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("teardown left state behind: {what}")]
    TeardownPartial { what: String },

    #[error("image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("mount entry '{img}' has unsupported type for this operation")]
    UnsupportedMountType { img: String },

    #[error("block device path '{path}' is not absolute")]
    RelativeDevicePath { path: String },

    #[error("{tool} exited with status {status}")]
    ToolFailed { tool: String, status: i32 },

    #[error("encrypted volume '{label}' requested but the compartment has no key")]
    MissingKey { label: String },

    #[error("image '{img}' failed verification")]
    VerifyFailed { img: String },

    #[error("root switch failed at {step}: {source}")]
    RootSwitch {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
