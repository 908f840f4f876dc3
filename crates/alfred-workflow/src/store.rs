//! File-backed journal of workflow runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::error::WorkflowError;
use crate::model::{RunStatus, WorkflowRun};

/// Default ceiling on retained runs.
const DEFAULT_MAX_RUNS: usize = 100;

/// Persistent journal of [`WorkflowRun`] records.
///
/// All runs live in memory under an `RwLock`; every mutation rewrites the
/// JSON file through a temp-file-and-rename so a crash mid-save never
/// corrupts the journal.
#[derive(Debug)]
pub struct WorkflowStore {
    path: PathBuf,
    max_runs: usize,
    runs: RwLock<HashMap<String, WorkflowRun>>,
}

impl WorkflowStore {
    /// Open (or create) the journal at `path`.
    ///
    /// A missing file starts empty; an unreadable or corrupt file is a
    /// construction error rather than silent data loss.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        Self::with_capacity(path, DEFAULT_MAX_RUNS)
    }

    pub fn with_capacity(path: impl AsRef<Path>, max_runs: usize) -> Result<Self, WorkflowError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let runs = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let list: Vec<WorkflowRun> = serde_json::from_str(&content).map_err(|e| {
                    WorkflowError::Store(format!("corrupt run journal {}: {e}", path.display()))
                })?;
                list.into_iter().map(|r| (r.id.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(WorkflowError::Store(format!(
                    "cannot read run journal {}: {e}",
                    path.display()
                )));
            }
        };

        tracing::debug!(path = %path.display(), runs = runs.len(), "run journal opened");
        Ok(Self {
            path,
            max_runs,
            runs: RwLock::new(runs),
        })
    }

    /// Insert or update a run, evict over-ceiling terminal runs, persist.
    pub async fn save_run(&self, run: &WorkflowRun) -> Result<(), WorkflowError> {
        let mut runs = self.runs.write().await;
        runs.insert(run.id.clone(), run.clone());
        Self::evict(&mut runs, self.max_runs);
        self.persist(&runs)
    }

    /// Evict oldest terminal runs until at or below the ceiling. Running
    /// and paused runs are never evicted.
    fn evict(runs: &mut HashMap<String, WorkflowRun>, max_runs: usize) {
        if runs.len() <= max_runs {
            return;
        }
        let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = runs
            .values()
            .filter(|r| r.status.is_terminal())
            .map(|r| (r.id.clone(), r.created_at))
            .collect();
        terminal.sort_by_key(|(_, created)| *created);

        for (id, _) in terminal {
            if runs.len() <= max_runs {
                break;
            }
            tracing::debug!(run = %id, "evicting terminal run over ceiling");
            runs.remove(&id);
        }
    }

    fn persist(&self, runs: &HashMap<String, WorkflowRun>) -> Result<(), WorkflowError> {
        let mut list: Vec<&WorkflowRun> = runs.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_string_pretty(&list)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<WorkflowRun, WorkflowError> {
        self.runs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("run {id}")))
    }

    /// Runs sorted newest-first; `limit > 0` truncates.
    pub async fn list_runs(&self, limit: usize) -> Vec<WorkflowRun> {
        let runs = self.runs.read().await;
        let mut list: Vec<WorkflowRun> = runs.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if limit > 0 {
            list.truncate(limit);
        }
        list
    }

    pub async fn delete_run(&self, id: &str) -> Result<(), WorkflowError> {
        let mut runs = self.runs.write().await;
        runs.remove(id)
            .ok_or_else(|| WorkflowError::NotFound(format!("run {id}")))?;
        self.persist(&runs)
    }

    /// The unique paused run carrying `token`.
    pub async fn get_run_by_token(&self, token: &str) -> Result<WorkflowRun, WorkflowError> {
        if token.is_empty() {
            return Err(WorkflowError::InvalidInput("empty resume token".into()));
        }
        let runs = self.runs.read().await;
        runs.values()
            .find(|r| {
                r.status == RunStatus::Paused && r.resume_token.as_deref() == Some(token)
            })
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("no paused run for token {token}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Pipeline, Step, StepKind};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn pipeline() -> Pipeline {
        Pipeline {
            name: "p".into(),
            steps: vec![Step {
                id: "s".into(),
                kind: StepKind::Transform { template: "x".into() },
                condition: None,
                timeout: None,
            }],
            ..Default::default()
        }
    }

    fn run() -> WorkflowRun {
        WorkflowRun::new(pipeline(), BTreeMap::new(), Duration::from_secs(60), 1024)
    }

    #[tokio::test]
    async fn save_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path().join("runs.json")).unwrap();

        let mut first = run();
        store.save_run(&first).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = run();
        store.save_run(&second).await.unwrap();

        assert_eq!(store.get_run(&first.id).await.unwrap().id, first.id);

        let listed = store.list_runs(0).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id, "newest first");

        assert_eq!(store.list_runs(1).await.len(), 1);

        first.status = RunStatus::Completed;
        store.save_run(&first).await.unwrap();
        assert_eq!(
            store.get_run(&first.id).await.unwrap().status,
            RunStatus::Completed
        );

        store.delete_run(&first.id).await.unwrap();
        assert!(store.get_run(&first.id).await.is_err());
    }

    #[tokio::test]
    async fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let saved = {
            let store = WorkflowStore::new(&path).unwrap();
            let run = run();
            store.save_run(&run).await.unwrap();
            run.id
        };

        let store = WorkflowStore::new(&path).unwrap();
        assert_eq!(store.get_run(&saved).await.unwrap().id, saved);
    }

    #[tokio::test]
    async fn corrupt_journal_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        std::fs::write(&path, "{{{{ not json").unwrap();

        let err = WorkflowStore::new(&path).unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
    }

    #[tokio::test]
    async fn eviction_spares_active_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::with_capacity(dir.path().join("runs.json"), 3).unwrap();

        let mut paused = run();
        paused.status = RunStatus::Paused;
        paused.resume_token = Some("tok-1".into());
        store.save_run(&paused).await.unwrap();

        for _ in 0..4 {
            std::thread::sleep(std::time::Duration::from_millis(2));
            let mut done = run();
            done.status = RunStatus::Completed;
            store.save_run(&done).await.unwrap();
        }

        let listed = store.list_runs(0).await;
        assert_eq!(listed.len(), 3);
        assert!(
            listed.iter().any(|r| r.status == RunStatus::Paused),
            "paused run must never be evicted"
        );
    }

    #[tokio::test]
    async fn token_lookup_only_matches_paused() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path().join("runs.json")).unwrap();

        let mut paused = run();
        paused.status = RunStatus::Paused;
        paused.resume_token = Some("tok-42".into());
        store.save_run(&paused).await.unwrap();

        let mut denied = run();
        denied.status = RunStatus::Denied;
        denied.resume_token = Some("tok-stale".into());
        store.save_run(&denied).await.unwrap();

        assert_eq!(
            store.get_run_by_token("tok-42").await.unwrap().id,
            paused.id
        );
        assert!(store.get_run_by_token("tok-stale").await.is_err());
        assert!(store.get_run_by_token("").await.is_err());
    }
}
