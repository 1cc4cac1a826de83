use std::path::PathBuf;

/// Prefix fed to the hasher ahead of the file bytes.
pub const DEFAULT_KEY: &[u8] = b"PATCHER";
/// Number of digest bytes that name a patch on the origin.
pub const FINGERPRINT_LEN: usize = 6;
/// XSalsa20 nonce width. Patches are always sealed with an all-zero nonce.
pub const NONCE_LEN: usize = 24;
/// Poly1305 tag width, stored in front of the ciphertext.
pub const TAG_LEN: usize = 16;
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
/// Directory on the origin that holds `<fingerprint>.bin` blobs.
pub const PATCH_DIR: &str = "patches";

/// Decoded patch: what to call the new file, how big it is, and one delta per
/// chunk of the original file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub deltas: Vec<Vec<u8>>,
}

impl PatchDescriptor {
    /// Byte range of chunk `index` in an original file of `file_size` bytes.
    /// Chunks past the end of the original are empty.
    pub fn chunk_bounds(&self, index: usize, file_size: u64) -> (u64, u64) {
        chunk_bounds(self.chunk_size, index, file_size)
    }
}

pub fn chunk_bounds(chunk_size: u64, index: usize, file_size: u64) -> (u64, u64) {
    let start = chunk_size.saturating_mul(index as u64).min(file_size);
    let end = chunk_size
        .saturating_mul(index as u64 + 1)
        .min(file_size);
    (start, end)
}

/// Number of chunks a file of `len` bytes splits into.
pub fn chunk_count(len: u64, chunk_size: u64) -> usize {
    len.div_ceil(chunk_size) as usize
}

#[derive(Debug, Clone)]
pub struct ApplySummary {
    pub chunks_applied: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Where the rebuilt file ended up. Empty until the sink is finalized.
    pub output: PathBuf,
}
