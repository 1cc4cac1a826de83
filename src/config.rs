use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::patch_format::{DEFAULT_CHUNK_SIZE, DEFAULT_KEY};
use crate::sink::SinkStrategy;
use crate::status::Messages;

/// Settings loaded from hashpatch.toml. Every field is optional in the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL (or local mirror directory) serving `patches/<id>.bin`
    pub origin: Option<String>,
    /// Key prepended to file contents before hashing
    pub key: String,
    /// Bytes read per step while identifying a file
    pub read_buffer: usize,
    pub sink: SinkStrategy,
    /// Largest output `sink = "auto"` keeps in memory
    pub buffer_limit: u64,
    /// Write next to the original and remove it afterwards
    pub in_place: bool,
    pub output_dir: Option<PathBuf>,
    /// Ask on the terminal when a destination is not writable
    pub prompt: bool,
    /// Chunk size used when creating patches
    pub chunk_size: u64,
    pub messages: Messages,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: None,
            key: String::from_utf8_lossy(DEFAULT_KEY).into_owned(),
            read_buffer: 64 * 1024,
            sink: SinkStrategy::Auto,
            buffer_limit: 64 * 1024 * 1024,
            in_place: false,
            output_dir: None,
            prompt: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            messages: Messages::default(),
        }
    }
}

impl Config {
    /// Load from `path`, or return the defaults when no path is given.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        if config.read_buffer == 0 {
            bail!("read_buffer must be greater than zero");
        }
        if config.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        Ok(config)
    }
}
