use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::binary_diff;
use crate::codec;
use crate::fetch::patch_path;
use crate::fingerprint::{fingerprint_bytes, Fingerprint};
use crate::patch_format::{chunk_bounds, chunk_count, PatchDescriptor, DEFAULT_CHUNK_SIZE, DEFAULT_KEY};
use crate::util::{self, MappedFile};

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub key: Vec<u8>,
    pub chunk_size: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY.to_vec(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Default)]
pub struct CreateSummary {
    pub patches_written: usize,
    pub unchanged: usize,
    /// Old files whose content matched another old file's.
    pub duplicates: usize,
}

struct FilePair {
    rel_path: String,
    old_path: PathBuf,
    new_path: PathBuf,
}

/// Build one delta per chunk of `old`, producing `new`.
///
/// The chunk count covers the longer of the two files: chunks past the end of
/// `old` start from empty input, chunks past the end of `new` produce nothing.
pub fn build_descriptor(old: &[u8], new: &[u8], filename: &str, chunk_size: u64) -> PatchDescriptor {
    let count = chunk_count(old.len() as u64, chunk_size).max(chunk_count(new.len() as u64, chunk_size));

    let deltas = (0..count)
        .into_par_iter()
        .map(|i| {
            let (os, oe) = chunk_bounds(chunk_size, i, old.len() as u64);
            let (ns, ne) = chunk_bounds(chunk_size, i, new.len() as u64);
            binary_diff::compute_delta(&old[os as usize..oe as usize], &new[ns as usize..ne as usize])
        })
        .collect();

    PatchDescriptor {
        filename: filename.to_string(),
        total_size: new.len() as u64,
        chunk_size,
        deltas,
    }
}

/// Compare `old` against `new` and write a patch blob for every changed file
/// into `output/patches/`.
///
/// `old` and `new` are either two files or two directory trees; trees are
/// paired by relative path and files present on only one side are ignored.
pub async fn create_patches(
    old: &Path,
    new: &Path,
    output: &Path,
    options: &CreateOptions,
) -> Result<CreateSummary> {
    if options.chunk_size == 0 {
        bail!("Chunk size must be greater than zero");
    }

    let pairs = if old.is_file() && new.is_file() {
        let name = new
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Non-UTF8 file name: {}", new.display()))?;
        vec![FilePair {
            rel_path: name.to_string(),
            old_path: old.to_path_buf(),
            new_path: new.to_path_buf(),
        }]
    } else if old.is_dir() && new.is_dir() {
        pair_trees(old, new).await?
    } else {
        bail!(
            "{} and {} must both be files or both be directories",
            old.display(),
            new.display()
        );
    };

    let options = options.clone();
    let built = tokio::task::spawn_blocking(move || -> Result<Vec<Option<(FilePair, Fingerprint, Vec<u8>)>>> {
        pairs
            .into_par_iter()
            .map(|pair| build_patch(pair, &options))
            .collect()
    })
    .await??;

    let patch_dir = output.join(crate::patch_format::PATCH_DIR);
    tokio::fs::create_dir_all(&patch_dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", patch_dir.display()))?;

    let mut summary = CreateSummary::default();
    let mut written: HashMap<Fingerprint, String> = HashMap::new();

    for entry in built {
        let Some((pair, fingerprint, blob)) = entry else {
            summary.unchanged += 1;
            continue;
        };
        if let Some(first) = written.get(&fingerprint) {
            tracing::warn!(
                file = %pair.rel_path,
                same_as = %first,
                %fingerprint,
                "old content already has a patch, skipping"
            );
            summary.duplicates += 1;
            continue;
        }

        let path = output.join(patch_path(&fingerprint));
        tokio::fs::write(&path, &blob)
            .await
            .with_context(|| format!("Failed to write patch: {}", path.display()))?;
        tracing::info!(file = %pair.rel_path, %fingerprint, bytes = blob.len(), "wrote patch");

        written.insert(fingerprint, pair.rel_path);
        summary.patches_written += 1;
    }

    Ok(summary)
}

async fn pair_trees(old: &Path, new: &Path) -> Result<Vec<FilePair>> {
    let old_owned = old.to_path_buf();
    let new_owned = new.to_path_buf();

    let (old_files, new_files) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::walk_files(&old_owned)),
        tokio::task::spawn_blocking(move || util::walk_files(&new_owned)),
    )?;
    let old_files = old_files?;
    let mut new_files = new_files?;

    let pairs = old_files
        .into_iter()
        .filter_map(|(rel_path, old_path)| {
            let new_path = new_files.remove(&rel_path)?;
            Some(FilePair {
                rel_path,
                old_path,
                new_path,
            })
        })
        .collect();

    for rel_path in new_files.keys() {
        tracing::debug!(file = %rel_path, "no old counterpart, skipping");
    }
    Ok(pairs)
}

/// `None` when the two files are identical.
fn build_patch(pair: FilePair, options: &CreateOptions) -> Result<Option<(FilePair, Fingerprint, Vec<u8>)>> {
    let old_data = MappedFile::open(&pair.old_path)?;
    let new_data = MappedFile::open(&pair.new_path)?;

    if old_data.bytes() == new_data.bytes() {
        return Ok(None);
    }

    let fingerprint = fingerprint_bytes(&options.key, old_data.bytes());
    let filename = pair
        .rel_path
        .rsplit('/')
        .next()
        .unwrap_or(pair.rel_path.as_str());
    let descriptor = build_descriptor(old_data.bytes(), new_data.bytes(), filename, options.chunk_size);
    let blob = codec::encode_patch(&descriptor, &fingerprint)
        .with_context(|| format!("Failed to encode patch for {}", pair.rel_path))?;

    Ok(Some((pair, fingerprint, blob)))
}
