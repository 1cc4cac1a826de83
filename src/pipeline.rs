use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::apply;
use crate::codec;
use crate::error::PatchError;
use crate::fetch::PatchSource;
use crate::fingerprint;
use crate::gate::PermissionGate;
use crate::patch_format::{ApplySummary, DEFAULT_KEY};
use crate::sink::{self, SinkKind, SinkRegistry, SinkStrategy};
use crate::status::{Status, StatusReporter};

/// Where the rebuilt file is written.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Into this directory, leaving the original alone.
    Directory(PathBuf),
    /// Next to the original; the original is removed once the new file is in
    /// place under a different name.
    InPlace,
}

#[derive(Debug, Clone)]
pub struct PatchOptions {
    pub key: Vec<u8>,
    pub read_buffer: usize,
    pub strategy: SinkStrategy,
    pub buffer_limit: u64,
    pub destination: Destination,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY.to_vec(),
            read_buffer: 64 * 1024,
            strategy: SinkStrategy::Auto,
            buffer_limit: 64 * 1024 * 1024,
            destination: Destination::InPlace,
        }
    }
}

/// Runs files through identify → fetch → decode → apply → save.
pub struct Patcher {
    source: Arc<dyn PatchSource>,
    gate: PermissionGate,
    registry: SinkRegistry,
    reporter: Arc<dyn StatusReporter>,
    options: PatchOptions,
}

impl Patcher {
    pub fn new(
        source: Arc<dyn PatchSource>,
        gate: PermissionGate,
        registry: SinkRegistry,
        reporter: Arc<dyn StatusReporter>,
        options: PatchOptions,
    ) -> Self {
        Self {
            source,
            gate,
            registry,
            reporter,
            options,
        }
    }

    pub fn registry(&self) -> &SinkRegistry {
        &self.registry
    }

    /// Patch one file. Any failure is reported as that file's final status
    /// and returned; nothing is retried.
    pub async fn process_file(&self, path: &Path) -> Result<ApplySummary, PatchError> {
        let result = self.run(path).await;
        match &result {
            Ok(summary) => {
                tracing::info!(
                    original = %path.display(),
                    output = %summary.output.display(),
                    chunks = summary.chunks_applied,
                    bytes = summary.bytes_written,
                    "patched"
                );
                self.reporter.report(path, &Status::Finished);
            }
            Err(e) => {
                tracing::debug!(file = %path.display(), error = %e, "patching stopped");
                self.reporter.report(path, &Status::from_error(e));
            }
        }
        result
    }

    async fn run(&self, path: &Path) -> Result<ApplySummary, PatchError> {
        let report = |status: Status| self.reporter.report(path, &status);

        report(Status::Identifying { percent: 0.0 });
        let fingerprint = fingerprint::identify_file(
            path,
            &self.options.key,
            self.options.read_buffer,
            |read, total| {
                let percent = if total == 0 {
                    100.0
                } else {
                    read as f64 * 100.0 / total as f64
                };
                report(Status::Identifying { percent });
            },
        )
        .await?;

        report(Status::Checking);
        let blob = self
            .source
            .fetch(&fingerprint)
            .await?
            .ok_or_else(|| PatchError::NoPatchAvailable {
                fingerprint: fingerprint.id(),
            })?;

        let descriptor = codec::decode_patch(&blob, &fingerprint)?;
        drop(blob);

        let dir = self.output_dir(path)?;
        self.gate
            .wait_until_writable(&dir, || report(Status::PermissionRequired))
            .await?;

        let kind = self
            .options
            .strategy
            .resolve(descriptor.total_size, self.options.buffer_limit);
        let streaming = kind == SinkKind::Streaming;

        let mut sink = sink::open_sink(
            kind,
            &dir,
            &descriptor.filename,
            descriptor.total_size,
            &self.registry,
        )
        .await?;

        let applied = apply::apply_patch(path, &descriptor, sink.as_mut(), |index, total| {
            report(Status::Patching {
                streaming,
                percent: index as f64 * 100.0 / total as f64,
            });
        })
        .await;

        let mut summary = match applied {
            Ok(summary) => summary,
            Err(e) => {
                sink.abort().await;
                return Err(e);
            }
        };
        summary.output = sink.finalize().await?;

        if matches!(self.options.destination, Destination::InPlace) {
            self.remove_replaced_original(path, &summary.output).await?;
        }

        Ok(summary)
    }

    fn output_dir(&self, original: &Path) -> Result<PathBuf, PatchError> {
        match &self.options.destination {
            Destination::Directory(dir) => Ok(dir.clone()),
            Destination::InPlace => {
                let parent = original.parent().unwrap_or_else(|| Path::new(""));
                if parent.as_os_str().is_empty() {
                    Ok(PathBuf::from("."))
                } else {
                    Ok(parent.to_path_buf())
                }
            }
        }
    }

    async fn remove_replaced_original(&self, original: &Path, output: &Path) -> Result<(), PatchError> {
        let same = match (
            tokio::fs::canonicalize(original).await,
            tokio::fs::canonicalize(output).await,
        ) {
            (Ok(a), Ok(b)) => a == b,
            // The original is gone only if it was overwritten by the output.
            (Err(_), _) => true,
            (Ok(_), Err(e)) => return Err(e.into()),
        };
        if !same {
            tokio::fs::remove_file(original).await?;
            tracing::debug!(original = %original.display(), "removed replaced original");
        }
        Ok(())
    }

    /// Patch every file concurrently, one independent task each. Results come
    /// back in completion order.
    pub async fn process_all(
        self: Arc<Self>,
        paths: Vec<PathBuf>,
    ) -> Vec<(PathBuf, Result<ApplySummary, PatchError>)> {
        let mut tasks = JoinSet::new();
        for path in paths {
            let patcher = Arc::clone(&self);
            tasks.spawn(async move {
                let result = patcher.process_file(&path).await;
                (path, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => tracing::error!(error = %e, "patch task panicked"),
            }
        }
        results
    }
}
