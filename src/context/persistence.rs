use std::path::{Path, PathBuf};

use tokio::fs;

use super::window::ContextWindow;
use crate::config::is_valid_task_id;
use crate::error::{PilotError, Result};

const CONTEXT_FILE: &str = "context.yaml";
const AUDIT_FILE: &str = "audit.log";

/// Stores one session's full window under `<base>/<task_id>/`.
pub struct ContextPersistence {
    base_dir: PathBuf,
}

impl ContextPersistence {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Directory of one session. Ids that could leave `base_dir` are refused.
    pub fn session_dir(&self, task_id: &str) -> Result<PathBuf> {
        if !is_valid_task_id(task_id) {
            return Err(PilotError::Other(format!(
                "task id {:?} cannot be used as a directory name",
                task_id
            )));
        }
        Ok(self.base_dir.join(task_id))
    }

    fn context_file(&self, task_id: &str) -> Result<PathBuf> {
        Ok(self.session_dir(task_id)?.join(CONTEXT_FILE))
    }

    pub async fn exists(&self, task_id: &str) -> bool {
        match self.context_file(task_id) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Writes the structured window and a human-readable audit transcript.
    pub async fn save(&self, task_id: &str, window: &ContextWindow) -> Result<PathBuf> {
        let dir = self.session_dir(task_id)?;
        fs::create_dir_all(&dir).await?;

        let yaml = serde_yaml_bw::to_string(window)?;
        let path = dir.join(CONTEXT_FILE);
        fs::write(&path, yaml).await?;
        fs::write(dir.join(AUDIT_FILE), window.render_audit()).await?;
        Ok(path)
    }

    pub async fn load(&self, task_id: &str) -> Result<ContextWindow> {
        let content = fs::read_to_string(self.context_file(task_id)?).await?;
        Ok(serde_yaml_bw::from_str(&content)?)
    }
}
