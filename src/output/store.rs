use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};

use crate::context::ContextPersistence;
use crate::error::Result;
use crate::orchestrator::{BatchSummary, SessionReport};

const REPORT_FILE: &str = "report.json";

/// Result files of one batch run.
///
/// ```text
/// <dir>/attack_results_<timestamp>.json   rewritten after every session
/// <dir>/<task_id>/report.json
/// <dir>/<task_id>/context.yaml
/// <dir>/<task_id>/audit.log
/// ```
pub struct ResultStore {
    dir: PathBuf,
    batch_file: PathBuf,
    contexts: ContextPersistence,
}

impl ResultStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        Self {
            batch_file: dir.join(format!("attack_results_{}.json", timestamp)),
            contexts: ContextPersistence::new(&dir),
            dir,
        }
    }

    pub fn batch_file(&self) -> &Path {
        &self.batch_file
    }

    pub async fn save_session(&self, report: &SessionReport) -> Result<PathBuf> {
        self.contexts.save(&report.task_id, &report.context).await?;
        let path = self.contexts.session_dir(&report.task_id)?.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(report)?;
        write_atomic(&path, &json).await?;
        Ok(path)
    }

    pub async fn save_batch(&self, summary: &BatchSummary) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(summary)?;
        write_atomic(&self.batch_file, &json).await
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).await?;

    let sync_path = tmp_path.clone();
    let synced = tokio::task::spawn_blocking(move || {
        std::fs::File::open(&sync_path).and_then(|file| file.sync_all())
    })
    .await;
    match synced {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to sync temp file to disk"),
        Err(e) => warn!(error = %e, "Failed to sync temp file to disk"),
    }

    fs::rename(&tmp_path, path).await?;
    debug!(path = %path.display(), "Atomic write completed");
    Ok(())
}
