//! `gmpack`: a file-tree archive format and package manager.
//!
//! A package is a single self-locating container file: an optional host
//! prefix, a small header, a run of (optionally compressed and always
//! obfuscated) payload blocks, an index region describing every entry, and
//! a fixed 20-byte trailer. The trailer lets a loader find everything else
//! by reading backwards from the end of the file, so the container can be
//! concatenated onto an arbitrary prefix (a loader binary, for instance)
//! without needing to know where it starts ahead of time.

pub mod builder;
pub mod codec;
pub mod error;
pub mod header;
pub mod installer;
pub mod manager;
pub mod progress;
pub mod rc4;
pub mod record;
pub mod walker;

pub use builder::Builder;
pub use error::GmPackError;
pub use installer::Installer;
pub use manager::PackageManager;
pub use progress::{BackgroundRunner, ChannelSink, NullSink, ProgressEvent, ProgressSink};
pub use record::FileRecord;
