use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::binary_patch;
use crate::error::PatchError;
use crate::patch_format::{ApplySummary, PatchDescriptor};
use crate::sink::OutputSink;

/// Rebuild the new file chunk by chunk: read chunk `i` of `original`, apply
/// `descriptor.deltas[i]`, append the result to `sink`.
///
/// After chunk `i` is written, `progress(i, total)` is called; completion is
/// the caller's to report. The sink is neither finalized nor aborted here.
pub async fn apply_patch<F>(
    original: &Path,
    descriptor: &PatchDescriptor,
    sink: &mut dyn OutputSink,
    mut progress: F,
) -> Result<ApplySummary, PatchError>
where
    F: FnMut(usize, usize),
{
    let mut file = tokio::fs::File::open(original).await?;
    let file_size = file.metadata().await?.len();
    let count = descriptor.deltas.len();

    let mut chunk = Vec::new();
    let mut bytes_read = 0u64;
    let mut bytes_written = 0u64;

    for (i, delta) in descriptor.deltas.iter().enumerate() {
        let (start, end) = descriptor.chunk_bounds(i, file_size);
        chunk.resize((end - start) as usize, 0);
        if !chunk.is_empty() {
            file.seek(SeekFrom::Start(start)).await?;
            file.read_exact(&mut chunk).await?;
        }
        bytes_read += chunk.len() as u64;

        let patched = binary_patch::apply_delta(&chunk, delta)
            .map_err(|source| PatchError::Delta { chunk: i, source })?;
        sink.append(&patched).await?;
        bytes_written += patched.len() as u64;

        progress(i, count);
    }

    if bytes_written != descriptor.total_size {
        return Err(PatchError::SizeMismatch {
            expected: descriptor.total_size,
            actual: bytes_written,
        });
    }

    tracing::debug!(
        original = %original.display(),
        chunks = count,
        bytes_read,
        bytes_written,
        "applied deltas"
    );

    Ok(ApplySummary {
        chunks_applied: count,
        bytes_read,
        bytes_written,
        output: Default::default(),
    })
}
