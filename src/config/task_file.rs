//! Task files: one target, global settings, and a list of dependent tasks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::layers::{
    DefaultSettings, EffectiveSettings, GlobalSettings, TaskDefinition, is_valid_task_id, resolve,
};
use super::target::TargetSpec;
use crate::error::{PilotError, Result};

/// Task id used for `run --goal`.
pub const SINGLE_GOAL_TASK_ID: &str = "goal";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub target: TargetSpec,
    #[serde(default)]
    pub global_settings: GlobalSettings,
    pub tasks: Vec<TaskDefinition>,
}

impl TaskFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            PilotError::Other(format!("cannot read task file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: TaskFile = serde_json::from_str(content)?;
        file.validate_structure()?;
        Ok(file)
    }

    /// One-task file for a goal given on the command line. The target and
    /// credential fall back to the engine defaults.
    pub fn single_goal(goal: &str, step_budget: Option<u32>, target: TargetSpec) -> Result<Self> {
        let mut task = TaskDefinition::new(SINGLE_GOAL_TASK_ID, "Goal", goal);
        task.step_budget = step_budget;
        let file = TaskFile {
            target,
            global_settings: GlobalSettings::default(),
            tasks: vec![task],
        };
        file.validate_structure()?;
        Ok(file)
    }

    /// Checks that do not depend on layering: task list shape and ids.
    pub fn validate_structure(&self) -> Result<()> {
        let mut violations = Vec::new();
        if self.tasks.is_empty() {
            violations.push("tasks must be a non-empty list".to_string());
        }
        let mut seen = HashSet::new();
        for (index, task) in self.tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                violations.push(format!("task at index {} has an empty id", index));
            } else if !is_valid_task_id(&task.id) {
                violations.push(format!(
                    "task id '{}' may only contain letters, digits, '_', '-' and '.', and no '..'",
                    task.id
                ));
            } else if !seen.insert(task.id.as_str()) {
                violations.push(format!("duplicate task id '{}'", task.id));
            }
            if task.name.trim().is_empty() {
                violations.push(format!("task '{}' has an empty name", task.id));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(PilotError::invalid_config(violations))
        }
    }

    /// Global layer with the top-level target folded in.
    pub fn global_layer(&self) -> GlobalSettings {
        let mut global = self.global_settings.clone();
        global.target = self.global_settings.target.over(&self.target);
        global
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.global_settings.output_dir.as_ref()
    }

    /// Resolve every task, collecting violations of all tasks into one error.
    pub fn resolve_all(&self, defaults: &DefaultSettings) -> Result<Vec<EffectiveSettings>> {
        let global = self.global_layer();
        let mut resolved = Vec::with_capacity(self.tasks.len());
        let mut violations = Vec::new();
        for task in &self.tasks {
            match resolve(defaults, &global, task) {
                Ok(settings) => resolved.push(settings),
                Err(PilotError::ConfigurationInvalid { violations: v }) => violations
                    .extend(v.into_iter().map(|msg| format!("task '{}': {}", task.id, msg))),
                Err(e) => return Err(e),
            }
        }
        if violations.is_empty() {
            Ok(resolved)
        } else {
            Err(PilotError::invalid_config(violations))
        }
    }

    /// Depth-first topological order of task ids.
    ///
    /// Dependencies come before dependents; otherwise file order is kept.
    pub fn resolve_task_order(&self) -> Result<Vec<String>> {
        let by_id: HashMap<&str, &TaskDefinition> =
            self.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut ordered = Vec::with_capacity(self.tasks.len());
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a TaskDefinition>,
            visited: &mut HashSet<&'a str>,
            in_progress: &mut HashSet<&'a str>,
            ordered: &mut Vec<String>,
        ) -> Result<()> {
            if visited.contains(id) {
                return Ok(());
            }
            if !in_progress.insert(id) {
                return Err(PilotError::TaskGraph(format!(
                    "circular dependency involving task '{}'",
                    id
                )));
            }
            if let Some(&task) = by_id.get(id) {
                for dep in &task.requires {
                    if !by_id.contains_key(dep.as_str()) {
                        return Err(PilotError::TaskGraph(format!(
                            "task '{}' depends on unknown task '{}'",
                            id, dep
                        )));
                    }
                    visit(dep.as_str(), by_id, visited, in_progress, ordered)?;
                }
            }
            in_progress.remove(id);
            visited.insert(id);
            ordered.push(id.to_string());
            Ok(())
        }

        for task in &self.tasks {
            visit(
                task.id.as_str(),
                &by_id,
                &mut visited,
                &mut in_progress,
                &mut ordered,
            )?;
        }
        Ok(ordered)
    }

    /// Group tasks into dependency waves. Tasks within a wave are independent.
    ///
    /// Wave membership is the length of the longest dependency chain below a
    /// task; order within a wave follows [`Self::resolve_task_order`].
    pub fn dependency_waves(&self) -> Result<Vec<Vec<String>>> {
        let order = self.resolve_task_order()?;
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();
        for id in &order {
            let task = self
                .task(id)
                .ok_or_else(|| PilotError::TaskGraph(format!("unknown task '{}'", id)))?;
            let depth = task
                .requires
                .iter()
                .filter_map(|dep| level.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            level.insert(task.id.as_str(), depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(id.clone());
        }
        Ok(waves)
    }

    /// Restrict the file to the selected tasks and everything they require.
    pub fn select(&self, ids: &[String]) -> Result<TaskFile> {
        if ids.is_empty() {
            return Ok(self.clone());
        }
        let mut keep: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = Vec::new();
        for id in ids {
            if self.task(id).is_none() {
                return Err(PilotError::TaskGraph(format!("no task with id '{}'", id)));
            }
            stack.push(id.clone());
        }
        while let Some(id) = stack.pop() {
            if !keep.insert(id.clone()) {
                continue;
            }
            if let Some(task) = self.task(&id) {
                stack.extend(task.requires.iter().cloned());
            }
        }
        Ok(TaskFile {
            target: self.target.clone(),
            global_settings: self.global_settings.clone(),
            tasks: self
                .tasks
                .iter()
                .filter(|t| keep.contains(&t.id))
                .cloned()
                .collect(),
        })
    }
}
