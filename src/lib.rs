//! Content-addressed file patching.
//!
//! A file is identified by a keyed BLAKE3 fingerprint of its contents. The
//! fingerprint names an encrypted patch on a static origin; the patch holds one
//! binary delta per fixed-size chunk of the original, which is rebuilt chunk by
//! chunk into a new file.

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod codec;
pub mod config;
pub mod create;
pub mod error;
pub mod fetch;
pub mod fingerprint;
pub mod gate;
pub mod patch_format;
pub mod pipeline;
pub mod rolling_hash;
pub mod sink;
pub mod status;
pub mod util;

pub use error::PatchError;
pub use fingerprint::Fingerprint;
pub use patch_format::{ApplySummary, PatchDescriptor};
pub use pipeline::{Destination, PatchOptions, Patcher};
pub use status::{Status, StatusReporter};
