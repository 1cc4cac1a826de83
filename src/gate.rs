use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::PatchError;

/// Asks the user to grant write access to a destination.
#[async_trait]
pub trait AccessPrompt: Send + Sync {
    /// Resolves once the user has acted. `true` means "check again",
    /// `false` means the user declined.
    async fn request_access(&self, dir: &Path) -> bool;
}

/// Declines every request. For non-interactive runs.
pub struct DenyPrompt;

#[async_trait]
impl AccessPrompt for DenyPrompt {
    async fn request_access(&self, _dir: &Path) -> bool {
        false
    }
}

/// Waits for the user to press Enter on the terminal. Concurrent files take
/// turns at the prompt.
#[derive(Default)]
pub struct StdinPrompt {
    turn: Mutex<()>,
}

#[async_trait]
impl AccessPrompt for StdinPrompt {
    async fn request_access(&self, dir: &Path) -> bool {
        let _turn = self.turn.lock().await;

        let mut stderr = tokio::io::stderr();
        let question = format!(
            "{} is not writable. Grant access, then press Enter to retry (or type 'n' to skip): ",
            dir.display()
        );
        if stderr.write_all(question.as_bytes()).await.is_err() {
            return false;
        }
        let _ = stderr.flush().await;

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) | Err(_) => false,
            Ok(_) => !line.trim().eq_ignore_ascii_case("n"),
        }
    }
}

enum Access {
    Granted,
    Denied,
    Unavailable(std::io::Error),
}

fn check_access(dir: &Path) -> Access {
    match std::fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => Access::Unavailable(std::io::Error::new(
            ErrorKind::NotFound,
            "destination is not a directory",
        )),
        Ok(meta) if meta.permissions().readonly() => Access::Denied,
        // Mode bits say nothing about who may write; try it.
        Ok(_) => match tempfile::Builder::new()
            .prefix(".hashpatch-access")
            .tempfile_in(dir)
        {
            Ok(_) => Access::Granted,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Access::Denied,
            Err(e) => Access::Unavailable(e),
        },
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Access::Denied,
        Err(e) => Access::Unavailable(e),
    }
}

/// Holds a task until its destination is writable.
#[derive(Clone)]
pub struct PermissionGate {
    prompt: Arc<dyn AccessPrompt>,
}

impl PermissionGate {
    pub fn new(prompt: Arc<dyn AccessPrompt>) -> Self {
        Self { prompt }
    }

    /// Returns once `dir` is writable. While it is not, calls `on_blocked`
    /// and suspends on the prompt; the check is repeated only after the
    /// prompt resolves.
    pub async fn wait_until_writable<F>(&self, dir: &Path, mut on_blocked: F) -> Result<(), PatchError>
    where
        F: FnMut(),
    {
        loop {
            match check_access(dir) {
                Access::Granted => return Ok(()),
                Access::Unavailable(e) => return Err(PatchError::could_not_write(dir, e)),
                Access::Denied => {
                    tracing::debug!(dir = %dir.display(), "waiting for write access");
                    on_blocked();
                    if !self.prompt.request_access(dir).await {
                        return Err(PatchError::could_not_write(
                            dir,
                            std::io::Error::new(
                                ErrorKind::PermissionDenied,
                                "write access was not granted",
                            ),
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set_readonly(dir: &Path, readonly: bool) {
        let mut perms = std::fs::metadata(dir).unwrap().permissions();
        perms.set_readonly(readonly);
        std::fs::set_permissions(dir, perms).unwrap();
    }

    /// Grants access on the second request.
    struct GrantLater {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AccessPrompt for GrantLater {
        async fn request_access(&self, dir: &Path) -> bool {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                set_readonly(dir, false);
            }
            true
        }
    }

    #[tokio::test]
    async fn test_writable_passes_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let gate = PermissionGate::new(Arc::new(DenyPrompt));
        let mut blocked = 0;
        gate.wait_until_writable(dir.path(), || blocked += 1).await.unwrap();
        assert_eq!(blocked, 0);
    }

    #[tokio::test]
    async fn test_resumes_after_grant() {
        let dir = tempfile::tempdir().unwrap();
        set_readonly(dir.path(), true);

        let prompt = Arc::new(GrantLater {
            calls: AtomicUsize::new(0),
        });
        let gate = PermissionGate::new(prompt.clone());
        let mut blocked = 0;
        gate.wait_until_writable(dir.path(), || blocked += 1).await.unwrap();

        assert_eq!(blocked, 2);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_declined_is_could_not_write() {
        let dir = tempfile::tempdir().unwrap();
        set_readonly(dir.path(), true);

        let gate = PermissionGate::new(Arc::new(DenyPrompt));
        let result = gate.wait_until_writable(dir.path(), || {}).await;
        set_readonly(dir.path(), false);
        assert!(matches!(result, Err(PatchError::CouldNotWrite { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agrees_with_real_write_when_bits_allow_others() {
        use std::os::unix::fs::PermissionsExt;

        // Owner may not write, group and others may. `readonly()` is false.
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o577)).unwrap();
        let writable = std::fs::File::create(dir.path().join("attempt")).is_ok();
        let _ = std::fs::remove_file(dir.path().join("attempt"));

        let gate = PermissionGate::new(Arc::new(DenyPrompt));
        let mut blocked = 0;
        let result = gate.wait_until_writable(dir.path(), || blocked += 1).await;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        if writable {
            assert!(result.is_ok());
            assert_eq!(blocked, 0);
        } else {
            assert!(matches!(result, Err(PatchError::CouldNotWrite { .. })));
            assert_eq!(blocked, 1);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_dir_fails_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let gate = PermissionGate::new(Arc::new(DenyPrompt));
        let mut blocked = 0;
        let result = gate
            .wait_until_writable(&dir.path().join("missing"), || blocked += 1)
            .await;
        assert!(matches!(result, Err(PatchError::CouldNotWrite { .. })));
        assert_eq!(blocked, 0);
    }
}
