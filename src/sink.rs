use async_trait::async_trait;
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::PatchError;

/// Where rebuilt chunks go.
///
/// Both implementations write the final file only on `finalize`; until then
/// the destination name is untouched.
#[async_trait]
pub trait OutputSink: Send {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), PatchError>;

    /// Flush everything and move the output to its final name.
    async fn finalize(self: Box<Self>) -> Result<PathBuf, PatchError>;

    /// Drop whatever was written so far.
    async fn abort(self: Box<Self>);

    fn is_streaming(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkStrategy {
    /// Buffer outputs up to the configured limit, stream anything larger
    #[default]
    Auto,
    /// Always write chunks to disk as they are produced
    Streaming,
    /// Always assemble the whole output in memory and save it once
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Streaming,
    Buffered,
}

impl SinkStrategy {
    pub fn resolve(self, total_size: u64, buffer_limit: u64) -> SinkKind {
        match self {
            SinkStrategy::Streaming => SinkKind::Streaming,
            SinkStrategy::Buffered => SinkKind::Buffered,
            SinkStrategy::Auto if total_size <= buffer_limit => SinkKind::Buffered,
            SinkStrategy::Auto => SinkKind::Streaming,
        }
    }
}

/// Destinations currently being written, so they can be aborted on shutdown
/// and so two sinks never race for the same output name.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    open: HashMap<u64, OpenOutput>,
}

struct OpenOutput {
    partial: PathBuf,
    target: PathBuf,
    streaming: bool,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an open output. Returns `None` if another open sink already
    /// writes `target`.
    pub fn register(&self, partial: PathBuf, target: PathBuf, streaming: bool) -> Option<u64> {
        let mut inner = self.lock();
        if inner.open.values().any(|open| open.target == target) {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.open.insert(
            id,
            OpenOutput {
                partial,
                target,
                streaming,
            },
        );
        Some(id)
    }

    pub fn deregister(&self, id: u64) {
        self.lock().open.remove(&id);
    }

    /// Streaming outputs still being written.
    pub fn pending(&self) -> usize {
        self.lock().open.values().filter(|open| open.streaming).count()
    }

    /// Remove every partial file still registered. Returns how many were open.
    pub fn abort_all(&self) -> usize {
        let open: Vec<PathBuf> = self.lock().open.drain().map(|(_, open)| open.partial).collect();
        for path in &open {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
                }
            }
        }
        open.len()
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
        }
    }
}

/// A reserved output: a freshly created `.<name>.<random>.partial` file in the
/// destination directory and the registry entry for its final name. Dropping
/// an unsettled claim removes the partial file.
struct Claim {
    partial: PathBuf,
    target: PathBuf,
    registry: SinkRegistry,
    id: u64,
    settled: bool,
}

impl Claim {
    fn acquire(
        dir: &Path,
        filename: &str,
        streaming: bool,
        registry: &SinkRegistry,
    ) -> Result<(tokio::fs::File, Self), PatchError> {
        let target = dir.join(filename);
        let (file, partial) = tempfile::Builder::new()
            .prefix(&format!(".{filename}."))
            .suffix(".partial")
            .tempfile_in(dir)
            .and_then(|file| file.keep().map_err(|e| e.error))
            .map_err(|e| PatchError::could_not_write(&target, e))?;

        let Some(id) = registry.register(partial.clone(), target.clone(), streaming) else {
            let _ = std::fs::remove_file(&partial);
            return Err(PatchError::could_not_write(
                &target,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "another patch is already writing this file",
                ),
            ));
        };

        let claim = Self {
            partial,
            target,
            registry: registry.clone(),
            id,
            settled: false,
        };
        Ok((tokio::fs::File::from_std(file), claim))
    }

    /// Move the partial file to the final name.
    async fn commit(mut self) -> Result<PathBuf, PatchError> {
        self.settled = true;
        let renamed = tokio::fs::rename(&self.partial, &self.target).await;
        self.registry.deregister(self.id);
        if let Err(e) = renamed {
            remove_quietly(&self.partial).await;
            return Err(PatchError::could_not_write(&self.target, e));
        }
        Ok(self.target.clone())
    }

    async fn discard(mut self) {
        self.settled = true;
        remove_quietly(&self.partial).await;
        self.registry.deregister(self.id);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        // Dropped mid-run without finalize or abort.
        if !self.settled {
            let _ = std::fs::remove_file(&self.partial);
            self.registry.deregister(self.id);
        }
    }
}

async fn write_out(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

pub struct StreamingSink {
    writer: BufWriter<tokio::fs::File>,
    claim: Claim,
}

impl StreamingSink {
    pub async fn create(
        dir: &Path,
        filename: &str,
        registry: &SinkRegistry,
    ) -> Result<Self, PatchError> {
        let (file, claim) = Claim::acquire(dir, filename, true, registry)?;
        Ok(Self {
            writer: BufWriter::with_capacity(256 * 1024, file),
            claim,
        })
    }
}

#[async_trait]
impl OutputSink for StreamingSink {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), PatchError> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| PatchError::could_not_write(&self.claim.target, e))
    }

    async fn finalize(self: Box<Self>) -> Result<PathBuf, PatchError> {
        let Self { mut writer, claim } = *self;
        let flushed = async {
            writer.flush().await?;
            writer.get_mut().sync_all().await
        }
        .await;
        drop(writer);

        if let Err(e) = flushed {
            let target = claim.target.clone();
            claim.discard().await;
            return Err(PatchError::could_not_write(target, e));
        }
        claim.commit().await
    }

    async fn abort(self: Box<Self>) {
        let Self { writer, claim } = *self;
        drop(writer);
        claim.discard().await;
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

/// Keeps the output in memory and writes it once on `finalize`. The partial
/// file is created up front so an unwritable destination fails before any
/// delta is applied.
pub struct BufferedSink {
    buffer: Vec<u8>,
    file: tokio::fs::File,
    claim: Claim,
}

impl BufferedSink {
    pub async fn create(
        dir: &Path,
        filename: &str,
        total_size: u64,
        registry: &SinkRegistry,
    ) -> Result<Self, PatchError> {
        let (file, claim) = Claim::acquire(dir, filename, false, registry)?;
        Ok(Self {
            buffer: Vec::with_capacity(total_size.min(64 * 1024 * 1024) as usize),
            file,
            claim,
        })
    }
}

#[async_trait]
impl OutputSink for BufferedSink {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), PatchError> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<PathBuf, PatchError> {
        let Self {
            buffer,
            mut file,
            claim,
        } = *self;
        let written = write_out(&mut file, &buffer).await;
        drop(file);

        if let Err(e) = written {
            let target = claim.target.clone();
            claim.discard().await;
            return Err(PatchError::could_not_write(target, e));
        }
        claim.commit().await
    }

    async fn abort(self: Box<Self>) {
        let Self { file, claim, .. } = *self;
        drop(file);
        claim.discard().await;
    }

    fn is_streaming(&self) -> bool {
        false
    }
}

/// Obtain a destination for `filename` in `dir`. Fails with `CouldNotWrite`
/// before anything is written.
pub async fn open_sink(
    kind: SinkKind,
    dir: &Path,
    filename: &str,
    total_size: u64,
    registry: &SinkRegistry,
) -> Result<Box<dyn OutputSink>, PatchError> {
    let sink: Box<dyn OutputSink> = match kind {
        SinkKind::Streaming => Box::new(StreamingSink::create(dir, filename, registry).await?),
        SinkKind::Buffered => {
            Box::new(BufferedSink::create(dir, filename, total_size, registry).await?)
        }
    };
    tracing::debug!(dir = %dir.display(), filename, ?kind, "opened sink");
    Ok(sink)
}
