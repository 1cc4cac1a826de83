use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Walk a directory tree and collect its regular files by relative path.
/// Relative paths use forward slashes so old and new trees pair up on every platform.
pub fn walk_files(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut files = BTreeMap::new();

    for entry in WalkDir::new(&root).min_depth(1) {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;
        let relative_str = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        files.insert(relative_str, full_path);
    }

    Ok(files)
}

/// Read-only view of a file's bytes. Empty files are not mapped, since a
/// zero-length mapping is an error on some platforms.
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?
            .len();
        if len == 0 {
            return Ok(Self { map: None });
        }
        // SAFETY: the mapping is only read. Callers must not truncate or
        // replace the file while it is live.
        let map = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("Failed to memory-map file: {}", path.display()))?
        };
        Ok(Self { map: Some(map) })
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}
