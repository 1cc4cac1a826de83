use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::error::PatchError;
use crate::fingerprint::Fingerprint;
use crate::patch_format::PATCH_DIR;

/// Somewhere patches can be looked up by fingerprint.
#[async_trait]
pub trait PatchSource: Send + Sync {
    /// `Ok(None)` means the origin has no patch for this content.
    async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, PatchError>;
}

/// Path of a patch relative to the origin root.
pub fn patch_path(fingerprint: &Fingerprint) -> String {
    format!("{PATCH_DIR}/{}.bin", fingerprint.id())
}

/// Static HTTP(S) origin.
pub struct HttpSource {
    client: reqwest::Client,
    base: Url,
}

impl HttpSource {
    pub fn new(base: &str) -> Result<Self, PatchError> {
        let mut base =
            Url::parse(base).map_err(|e| PatchError::InvalidOrigin(format!("{base}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("hashpatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base })
    }

    pub fn url_for(&self, fingerprint: &Fingerprint) -> Result<Url, PatchError> {
        self.base
            .join(&patch_path(fingerprint))
            .map_err(|e| PatchError::InvalidOrigin(e.to_string()))
    }
}

#[async_trait]
impl PatchSource for HttpSource {
    async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, PatchError> {
        let url = self.url_for(fingerprint)?;
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, %status, "no patch on origin");
            return Ok(None);
        }
        let body = response.bytes().await?;
        tracing::debug!(%url, bytes = body.len(), "fetched patch");
        Ok(Some(body.to_vec()))
    }
}

/// Local mirror of the origin layout (`<root>/patches/<id>.bin`).
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PatchSource for DirSource {
    async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, PatchError> {
        let path = self.root.join(patch_path(fingerprint));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no patch in mirror");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Pick a source from an origin string: `http(s)://` URLs go over the network,
/// `file://` URLs and plain paths read a local mirror.
pub fn source_for_origin(origin: &str) -> Result<Arc<dyn PatchSource>, PatchError> {
    match Url::parse(origin) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Arc::new(HttpSource::new(origin)?)),
        Ok(url) if url.scheme() == "file" => {
            let root = url
                .to_file_path()
                .map_err(|_| PatchError::InvalidOrigin(origin.to_string()))?;
            Ok(Arc::new(DirSource::new(root)))
        }
        // Windows drive letters parse as a one-letter scheme.
        Ok(url) if url.scheme().len() > 1 => Err(PatchError::InvalidOrigin(format!(
            "unsupported scheme {:?} in {origin}",
            url.scheme()
        ))),
        _ => Ok(Arc::new(DirSource::new(origin))),
    }
}
