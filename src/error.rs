use std::path::PathBuf;
use thiserror::Error;

use crate::binary_patch::DeltaError;

/// Everything that can stop one file's trip through the pipeline.
///
/// All variants are terminal for the file they occurred on; nothing is retried.
#[derive(Error, Debug)]
pub enum PatchError {
    /// The origin has no patch for this content.
    #[error("no patch available for fingerprint {fingerprint}")]
    NoPatchAvailable { fingerprint: String },

    /// Authenticated decryption failed: tampered blob or wrong content.
    #[error("patch failed authentication")]
    CorruptedPatch,

    /// The destination could not be opened or written.
    #[error("could not write {}: {source}", path.display())]
    CouldNotWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch patch: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("invalid patch origin: {0}")]
    InvalidOrigin(String),

    #[error("failed to inflate patch: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("malformed patch: {0}")]
    Malformed(String),

    #[error("delta for chunk {chunk} could not be applied: {source}")]
    Delta {
        chunk: usize,
        #[source]
        source: DeltaError,
    },

    #[error("patched output is {actual} bytes, patch declares {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    pub(crate) fn could_not_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CouldNotWrite {
            path: path.into(),
            source,
        }
    }
}
