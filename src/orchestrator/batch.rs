use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::engine::AttackOrchestrator;
use super::report::{BatchSummary, SessionReport};
use super::signal::CancelHandle;
use crate::config::{DefaultSettings, EffectiveSettings, TaskFile};
use crate::error::{PilotError, Result};
use crate::output::ResultStore;

/// Resolved, validated sessions grouped into dependency waves.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub waves: Vec<Vec<EffectiveSettings>>,
}

impl BatchPlan {
    /// Resolve the selected tasks (plus what they require) and order them.
    ///
    /// Every violation of every task is reported at once, and graph errors
    /// surface here, before any session resource exists.
    pub fn prepare(file: &TaskFile, defaults: &DefaultSettings, selection: &[String]) -> Result<Self> {
        let file = file.select(selection)?;
        let waves = file.dependency_waves()?;
        let mut resolved: HashMap<String, EffectiveSettings> = file
            .resolve_all(defaults)?
            .into_iter()
            .map(|s| (s.task_id.clone(), s))
            .collect();

        let waves = waves
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .map(|id| {
                        resolved.remove(&id).ok_or_else(|| {
                            PilotError::TaskGraph(format!("task '{}' was not resolved", id))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { waves })
    }

    pub fn task_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Sessions in execution order.
    pub fn sessions(&self) -> impl Iterator<Item = &EffectiveSettings> {
        self.waves.iter().flatten()
    }
}

/// Runs a batch of sessions wave by wave.
///
/// Dependents start only after their whole wave finished, whatever the
/// outcome of the sessions they depend on. Sessions within a wave run
/// concurrently up to `max_parallel`.
pub struct BatchRunner {
    orchestrator: Arc<AttackOrchestrator>,
    store: Option<Arc<ResultStore>>,
    max_parallel: usize,
}

impl BatchRunner {
    pub fn new(orchestrator: Arc<AttackOrchestrator>) -> Self {
        let max_parallel = orchestrator.config().engine.max_parallel_sessions.max(1);
        Self {
            orchestrator,
            store: None,
            max_parallel,
        }
    }

    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub async fn run(&self, plan: BatchPlan, cancel: &CancelHandle) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let total = plan.task_count();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut sessions: Vec<SessionReport> = Vec::with_capacity(total);

        info!(tasks = total, waves = plan.waves.len(), max_parallel = self.max_parallel, "Starting batch");

        for (wave_index, wave) in plan.waves.into_iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(wave = wave_index, "Batch cancelled, remaining tasks not started");
                break;
            }

            let mut join_set = JoinSet::new();
            for (slot, settings) in wave.into_iter().enumerate() {
                let orchestrator = self.orchestrator.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| PilotError::Other(format!("scheduler closed: {}", e)))?;
                    let report = orchestrator.run(&settings, &cancel).await?;
                    Ok::<_, PilotError>((slot, report))
                });
            }

            let mut finished: Vec<(usize, SessionReport)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let (slot, report) = match joined {
                    Ok(Ok(done)) => done,
                    Ok(Err(e)) => {
                        join_set.abort_all();
                        return Err(e);
                    }
                    Err(e) => {
                        join_set.abort_all();
                        return Err(PilotError::Other(format!("session task panicked: {}", e)));
                    }
                };
                info!(
                    task = %report.task_id,
                    status = %report.status,
                    findings = report.findings.len(),
                    done = sessions.len() + finished.len() + 1,
                    total,
                    "Task finished"
                );
                if let Some(store) = &self.store
                    && let Err(e) = store.save_session(&report).await
                {
                    error!(task = %report.task_id, error = %e, "Failed to persist session results");
                }
                finished.push((slot, report));

                if let Some(store) = &self.store {
                    let mut partial = sessions.clone();
                    partial.extend(finished.iter().map(|(_, r)| r.clone()));
                    if let Err(e) = store
                        .save_batch(&BatchSummary::from_sessions(started_at, partial))
                        .await
                    {
                        error!(error = %e, "Failed to persist batch results");
                    }
                }
            }

            finished.sort_by_key(|(slot, _)| *slot);
            sessions.extend(finished.into_iter().map(|(_, report)| report));
        }

        let summary = BatchSummary::from_sessions(started_at, sessions);
        if let Some(store) = &self.store {
            store.save_batch(&summary).await?;
        }
        info!(
            total = summary.total_tasks,
            completed = summary.completed_tasks,
            findings = summary.total_findings,
            "Batch finished"
        );
        Ok(summary)
    }
}
