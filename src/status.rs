use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::PatchError;

/// Where one file is in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Identifying { percent: f64 },
    Checking,
    Patching { streaming: bool, percent: f64 },
    PermissionRequired,
    Finished,
    NoPatch,
    CorruptedPatch,
    CouldNotWrite,
    Failed(String),
}

impl Status {
    pub fn from_error(error: &PatchError) -> Self {
        match error {
            PatchError::NoPatchAvailable { .. } => Status::NoPatch,
            PatchError::CorruptedPatch => Status::CorruptedPatch,
            PatchError::CouldNotWrite { .. } => Status::CouldNotWrite,
            other => Status::Failed(other.to_string()),
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self {
            Status::Identifying { percent } | Status::Patching { percent, .. } => Some(*percent),
            _ => None,
        }
    }
}

/// Texts shown for each status. Keys match the `[messages]` table of the
/// configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Messages {
    pub identifying: String,
    pub checking: String,
    pub no_patch: String,
    pub patching: String,
    pub patching_stream: String,
    pub corrupted_patch: String,
    pub could_not_write: String,
    pub permission_required: String,
    pub finished: String,
    pub failed: String,
    pub page_leave: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            identifying: "Identifying file... ".into(),
            checking: "Looking for a patch...".into(),
            no_patch: "No patch is available for this file.".into(),
            patching: "Patching... ".into(),
            patching_stream: "Patching and saving... ".into(),
            corrupted_patch: "The patch is corrupted.".into(),
            could_not_write: "The patched file could not be written.".into(),
            permission_required: "Write access is needed to save the patched file.".into(),
            finished: "Done!".into(),
            failed: "Patching failed: ".into(),
            page_leave: "Files are still being written; leaving now will truncate them.".into(),
        }
    }
}

impl Messages {
    pub fn render(&self, status: &Status) -> String {
        match status {
            Status::Identifying { percent } => format!("{}{percent:.1}%", self.identifying),
            Status::Checking => self.checking.clone(),
            Status::Patching { streaming, percent } => {
                let text = if *streaming {
                    &self.patching_stream
                } else {
                    &self.patching
                };
                format!("{text}{percent:.1}%")
            }
            Status::PermissionRequired => self.permission_required.clone(),
            Status::Finished => self.finished.clone(),
            Status::NoPatch => self.no_patch.clone(),
            Status::CorruptedPatch => self.corrupted_patch.clone(),
            Status::CouldNotWrite => self.could_not_write.clone(),
            Status::Failed(reason) => format!("{}{reason}", self.failed),
        }
    }
}

/// Receives status changes for every file being processed.
pub trait StatusReporter: Send + Sync {
    fn report(&self, file: &Path, status: &Status);
}

/// Prints one line per stage change, and progress at 10% steps.
pub struct ConsoleReporter {
    messages: Messages,
    last_step: Mutex<HashMap<PathBuf, (std::mem::Discriminant<Status>, i64)>>,
}

impl ConsoleReporter {
    pub fn new(messages: Messages) -> Self {
        Self {
            messages,
            last_step: Mutex::new(HashMap::new()),
        }
    }
}

impl StatusReporter for ConsoleReporter {
    fn report(&self, file: &Path, status: &Status) {
        let step = status.percent().map_or(-1, |p| (p / 10.0).floor() as i64);
        let key = (std::mem::discriminant(status), step);
        {
            let mut last = self
                .last_step
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.get(file) == Some(&key) {
                return;
            }
            last.insert(file.to_path_buf(), key);
        }

        let name = file
            .file_name()
            .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned());
        println!("{name}: {}", self.messages.render(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_progress() {
        let messages = Messages::default();
        assert_eq!(
            messages.render(&Status::Identifying { percent: 12.345 }),
            "Identifying file... 12.3%"
        );
        assert_eq!(
            messages.render(&Status::Patching {
                streaming: true,
                percent: 50.0
            }),
            "Patching and saving... 50.0%"
        );
    }

    #[test]
    fn test_messages_override_from_toml() {
        let messages: Messages = toml::from_str(r#"noPatch = "Nothing to do""#).unwrap();
        assert_eq!(messages.render(&Status::NoPatch), "Nothing to do");
        assert_eq!(messages.finished, Messages::default().finished);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            Status::from_error(&PatchError::NoPatchAvailable {
                fingerprint: "abc123".into()
            }),
            Status::NoPatch
        );
        assert_eq!(Status::from_error(&PatchError::CorruptedPatch), Status::CorruptedPatch);
        assert!(matches!(
            Status::from_error(&PatchError::Malformed("x".into())),
            Status::Failed(_)
        ));
    }
}
