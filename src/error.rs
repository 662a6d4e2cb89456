//! Error kinds for the archive format and package manager.
//!
//! The core returns `Result<T, GmPackError>`. Builder and installer layer an
//! ordered, human-readable message list on top (see `builder.rs` /
//! `installer.rs`), matching the accumulate-then-report policy in spec §7.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GmPackError {
    #[error("opens package file {0} failure")]
    IoOpen(PathBuf),

    #[error("seeks position to {position} of file {path} failure")]
    IoSeek { path: PathBuf, position: i64 },

    #[error("reads data from file {0} failure")]
    IoRead(PathBuf),

    #[error("writes data to file {0} failure")]
    IoWrite(PathBuf),

    #[error("resizes package file {0} failure")]
    IoTruncate(PathBuf),

    #[error("uncompress data block [{0}] failure")]
    CodecDecompress(usize),

    #[error("decompressed size {actual} does not match declared original length {expected}")]
    CodecSizeMismatch { expected: i64, actual: i64 },

    #[error("package file trailer is inconsistent: {0}")]
    FormatTrailer(String),

    #[error("package file {0} is truncated or too short to be a valid archive")]
    FormatTruncated(PathBuf),

    #[error("file {0} already exists in the package")]
    DuplicateFilename(String),

    #[error("no file information matched the requested filter")]
    FilterMiss,

    #[error("index {index} is out of range (0...{max})")]
    IndexOutOfRange { index: i64, max: i64 },

    #[error("file {0}: permission denied")]
    PermissionDenied(PathBuf),

    #[error("exists same name as {0}, but that is not a directory path")]
    PathConflict(PathBuf),

    #[error("the package is invalid")]
    InvalidPackage,

    #[error("{0}")]
    PartialFailure(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
