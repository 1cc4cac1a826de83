use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fmt;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::PatchError;
use crate::patch_format::FINGERPRINT_LEN;

/// Keyed BLAKE3 digest of a file's content.
///
/// The short [`id`](Fingerprint::id) names the patch on the origin; the full
/// digest is the key the patch is sealed with.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.0
    }

    /// URL-safe base64 of the first six digest bytes, without padding.
    pub fn id(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0[..FINGERPRINT_LEN])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.id())
    }
}

fn keyed_hasher(key: &[u8]) -> blake3::Hasher {
    // The key is simply prepended to the content.
    let mut hasher = blake3::Hasher::new();
    hasher.update(key);
    hasher
}

/// Fingerprint an in-memory (or memory-mapped) buffer.
pub fn fingerprint_bytes(key: &[u8], data: &[u8]) -> Fingerprint {
    let mut hasher = keyed_hasher(key);
    hasher.update(data);
    Fingerprint(*hasher.finalize().as_bytes())
}

/// Stream `reader` through the keyed hash in reads of at most `read_buffer`
/// bytes, calling `progress(read_so_far, total)` after every read.
pub async fn identify_reader<R, F>(
    mut reader: R,
    total: u64,
    key: &[u8],
    read_buffer: usize,
    mut progress: F,
) -> std::io::Result<Fingerprint>
where
    R: AsyncRead + Unpin,
    F: FnMut(u64, u64),
{
    let mut hasher = keyed_hasher(key);
    let mut buf = vec![0u8; read_buffer.max(1)];
    let mut read: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read += n as u64;
        progress(read, total);
    }

    Ok(Fingerprint(*hasher.finalize().as_bytes()))
}

/// Fingerprint the file at `path` without loading it into memory.
pub async fn identify_file<F>(
    path: &Path,
    key: &[u8],
    read_buffer: usize,
    progress: F,
) -> Result<Fingerprint, PatchError>
where
    F: FnMut(u64, u64),
{
    let file = tokio::fs::File::open(path).await?;
    let total = file.metadata().await?.len();
    let fingerprint = identify_reader(file, total, key, read_buffer, progress).await?;
    tracing::debug!(path = %path.display(), %fingerprint, total, "identified");
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::DEFAULT_KEY;
    use proptest::prelude::*;

    #[test]
    fn test_id_is_eight_url_safe_chars() {
        let fp = Fingerprint::from_digest([0xFB; 32]);
        // 0xFB 0xFB 0xFB encodes to "+/v7" in the standard alphabet.
        assert_eq!(fp.id(), "-_v7-_v7");
    }

    #[test]
    fn test_key_is_prefixed() {
        let fp = fingerprint_bytes(DEFAULT_KEY, b"content");
        assert_eq!(fp.digest(), blake3::hash(b"PATCHERcontent").as_bytes());
        assert_ne!(fingerprint_bytes(b"OTHER", b"content"), fp);
    }

    #[tokio::test]
    async fn test_streamed_matches_in_memory() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let mut reports = Vec::new();
        let streamed = identify_reader(&data[..], data.len() as u64, DEFAULT_KEY, 4096, |read, total| {
            reports.push((read, total))
        })
        .await
        .unwrap();

        assert_eq!(streamed, fingerprint_bytes(DEFAULT_KEY, &data));
        assert_eq!(reports.len(), data.len().div_ceil(4096));
        assert_eq!(reports.last(), Some(&(data.len() as u64, data.len() as u64)));
    }

    proptest! {
        #[test]
        fn prop_identical_content_identical_id(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let a = fingerprint_bytes(DEFAULT_KEY, &data);
            let b = fingerprint_bytes(DEFAULT_KEY, &data.clone());
            prop_assert_eq!(a.id(), b.id());
        }

        #[test]
        fn prop_single_byte_change_changes_id(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            at in any::<usize>(),
            flip in 1u8..,
        ) {
            let mut changed = data.clone();
            let at = at % changed.len();
            changed[at] ^= flip;
            prop_assert_ne!(
                fingerprint_bytes(DEFAULT_KEY, &data).id(),
                fingerprint_bytes(DEFAULT_KEY, &changed).id()
            );
        }
    }
}
