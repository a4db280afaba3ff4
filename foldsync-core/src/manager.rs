//! Pair lifecycle: owns the association between a pair, its scheduler task
//! and its optional filesystem watcher.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{validate_pair, Pair};
use crate::error::{Error, Result};
use crate::hooks::{HookRunner, HookSink, HookStatus, HookStatusRegistry};
use crate::schedule::ScheduleKind;
use crate::scheduler::{task_fn, Scheduler, TaskSnapshot};
use crate::sync::Copier;
use crate::watcher::PairWorker;

/// Combined scheduler and watcher view of one pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub fail_count: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub watcher_active: bool,
}

impl PairStatus {
    fn new(task: TaskSnapshot, watcher_active: bool) -> Self {
        Self {
            id: task.id,
            name: task.name,
            enabled: task.enabled,
            schedule_type: task.schedule.kind.type_name().to_string(),
            last_run: task.last_run,
            next_run: task.next_run,
            run_count: task.run_count,
            fail_count: task.fail_count,
            last_error: task.last_error,
            watcher_active,
        }
    }
}

/// Manages every configured pair. At most one scheduler task and one
/// watcher exist per pair id; all operations serialize on the workers
/// mutex.
pub struct PairManager {
    scheduler: Scheduler,
    workers: Mutex<HashMap<String, PairWorker>>,
    hooks: Arc<HookRunner>,
    statuses: Arc<HookStatusRegistry>,
    token: CancellationToken,
}

impl PairManager {
    /// `timezone` is handed to the scheduler; empty means local.
    pub fn new(timezone: &str) -> Result<Self> {
        let statuses = Arc::new(HookStatusRegistry::default());
        Ok(Self {
            scheduler: Scheduler::new(timezone)?,
            workers: Mutex::new(HashMap::new()),
            hooks: Arc::new(HookRunner::new(Arc::clone(&statuses))),
            statuses,
            token: CancellationToken::new(),
        })
    }

    /// Validate and start a pair: register its sync task with the
    /// scheduler and, for watcher schedules, spawn the filesystem watcher.
    /// An existing entry under the same id is stopped first.
    pub async fn start_pair(&self, mut pair: Pair) -> Result<()> {
        validate_pair(&mut pair)?;

        let mut workers = self.workers.lock().await;
        if let Some(mut worker) = workers.remove(&pair.id) {
            worker.stop().await;
        }
        self.scheduler.remove(&pair.id);

        let pair = Arc::new(pair);
        let runner = {
            let pair = Arc::clone(&pair);
            let hooks: Arc<dyn HookSink> = Arc::clone(&self.hooks) as Arc<dyn HookSink>;
            // full syncs for one pair never overlap
            let guard = Arc::new(Mutex::new(()));
            task_fn(move |token| {
                let pair = Arc::clone(&pair);
                let hooks = Arc::clone(&hooks);
                let guard = Arc::clone(&guard);
                async move {
                    let _lock = guard.lock().await;
                    Copier::new(&pair, hooks.as_ref())
                        .compare_and_sync(&token)
                        .await
                        .map(|_| ())
                }
            })
        };

        self.scheduler.add(&pair.id, &pair.name(), pair.schedule.clone(), runner)?;

        if !pair.enabled {
            self.scheduler.disable(&pair.id)?;
        } else if matches!(pair.schedule.kind, ScheduleKind::Watcher) {
            let sink: Arc<dyn HookSink> = Arc::clone(&self.hooks) as Arc<dyn HookSink>;
            workers.insert(pair.id.clone(), PairWorker::start(Arc::clone(&pair), &self.token, sink));
        }

        info!(pair = %pair.id, schedule = pair.schedule.kind.type_name(), "pair started");
        Ok(())
    }

    /// Stop the watcher (if any) and drop the scheduler task.
    pub async fn stop_pair(&self, id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let had_worker = match workers.remove(id) {
            Some(mut worker) => {
                worker.stop().await;
                true
            }
            None => false,
        };
        let had_task = self.scheduler.remove(id);
        if had_worker || had_task {
            info!(pair = id, "pair stopped");
            Ok(())
        } else {
            Err(Error::NotFound(id.to_string()))
        }
    }

    /// Apply a changed pair configuration: swap the schedule and start or
    /// stop the watcher to match the new mode. The sync callable keeps the
    /// snapshot taken at `start_pair`; restart the pair to apply filter or
    /// strategy changes.
    pub async fn update_pair(&self, mut pair: Pair) -> Result<()> {
        validate_pair(&mut pair)?;

        let mut workers = self.workers.lock().await;
        self.scheduler.update(&pair.id, pair.schedule.clone())?;

        let wants_watcher = pair.enabled && matches!(pair.schedule.kind, ScheduleKind::Watcher);
        if wants_watcher {
            if !workers.contains_key(&pair.id) {
                let sink: Arc<dyn HookSink> = Arc::clone(&self.hooks) as Arc<dyn HookSink>;
                let id = pair.id.clone();
                workers.insert(id, PairWorker::start(Arc::new(pair), &self.token, sink));
            }
        } else if let Some(mut worker) = workers.remove(&pair.id) {
            worker.stop().await;
        }
        Ok(())
    }

    /// Trigger one sync immediately, bypassing the schedule.
    pub fn sync_now(&self, id: &str) -> Result<()> {
        self.scheduler.run_now(id)
    }

    pub async fn status(&self, id: &str) -> Result<PairStatus> {
        let task = self.scheduler.get(id)?;
        let workers = self.workers.lock().await;
        Ok(PairStatus::new(task, workers.contains_key(id)))
    }

    pub async fn list_statuses(&self) -> Vec<PairStatus> {
        let tasks = self.scheduler.list();
        let workers = self.workers.lock().await;
        tasks
            .into_iter()
            .map(|task| {
                let active = workers.contains_key(&task.id);
                PairStatus::new(task, active)
            })
            .collect()
    }

    /// Latest hook outcome for a pair, if any hook has run.
    pub fn hook_status(&self, id: &str) -> Option<HookStatus> {
        self.statuses.last(id)
    }

    /// Cancel everything: watchers come down through the token hierarchy,
    /// the scheduler stops its loops and in-flight executions.
    pub async fn close(&self) {
        self.token.cancel();
        self.scheduler.stop();
        let mut workers = self.workers.lock().await;
        for (_, mut worker) in workers.drain() {
            worker.stop().await;
        }
        info!("pair manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pair(id: &str, source: &Path, target: &Path, schedule: Schedule) -> Pair {
        Pair {
            id: id.into(),
            enabled: true,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            debounce_ms: 100,
            schedule,
            ..Pair::default()
        }
    }

    fn dirs(root: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let source = root.path().join("src");
        let target = root.path().join("dst");
        fs::create_dir_all(&source).unwrap();
        (source, target)
    }

    #[tokio::test]
    async fn watcher_pair_has_active_watcher() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        let manager = PairManager::new("").unwrap();

        manager.start_pair(pair("p1", &source, &target, Schedule::watcher())).await.unwrap();
        let status = manager.status("p1").await.unwrap();
        assert!(status.watcher_active);
        assert_eq!(status.schedule_type, "watcher");
        assert!(status.enabled);

        manager.close().await;
    }

    #[tokio::test]
    async fn interval_pair_has_no_watcher() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        let manager = PairManager::new("").unwrap();

        manager.start_pair(pair("p1", &source, &target, Schedule::interval("1h"))).await.unwrap();
        let status = manager.status("p1").await.unwrap();
        assert!(!status.watcher_active);
        assert_eq!(status.schedule_type, "interval");

        manager.close().await;
    }

    #[tokio::test]
    async fn disabled_flag_registers_without_watcher_or_firing() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        let manager = PairManager::new("").unwrap();

        let mut p = pair("p1", &source, &target, Schedule::watcher());
        p.enabled = false;
        manager.start_pair(p).await.unwrap();
        let status = manager.status("p1").await.unwrap();
        assert!(!status.watcher_active);
        assert!(!status.enabled);

        manager.close().await;
    }

    #[tokio::test]
    async fn start_twice_replaces_previous_entry() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        let manager = PairManager::new("").unwrap();

        manager.start_pair(pair("p1", &source, &target, Schedule::watcher())).await.unwrap();
        manager.start_pair(pair("p1", &source, &target, Schedule::interval("1h"))).await.unwrap();

        let status = manager.status("p1").await.unwrap();
        assert_eq!(status.schedule_type, "interval");
        assert!(!status.watcher_active);

        manager.close().await;
    }

    #[tokio::test]
    async fn stop_pair_forgets_everything() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        let manager = PairManager::new("").unwrap();

        manager.start_pair(pair("p1", &source, &target, Schedule::watcher())).await.unwrap();
        manager.stop_pair("p1").await.unwrap();
        assert!(matches!(manager.status("p1").await, Err(Error::NotFound(_))));
        assert!(matches!(manager.stop_pair("p1").await, Err(Error::NotFound(_))));

        manager.close().await;
    }

    #[tokio::test]
    async fn sync_now_copies_and_counts() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        fs::write(source.join("a.txt"), "hello").unwrap();
        let manager = PairManager::new("").unwrap();

        manager.start_pair(pair("p1", &source, &target, Schedule::disabled())).await.unwrap();
        manager.sync_now("p1").unwrap();

        for _ in 0..50 {
            if target.join("a.txt").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(fs::read_to_string(target.join("a.txt")).unwrap(), "hello");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = manager.status("p1").await.unwrap();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.fail_count, 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn update_pair_switches_watcher_mode() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        let manager = PairManager::new("").unwrap();

        manager.start_pair(pair("p1", &source, &target, Schedule::watcher())).await.unwrap();
        assert!(manager.status("p1").await.unwrap().watcher_active);

        manager.update_pair(pair("p1", &source, &target, Schedule::interval("1h"))).await.unwrap();
        let status = manager.status("p1").await.unwrap();
        assert!(!status.watcher_active);
        assert_eq!(status.schedule_type, "interval");

        manager.update_pair(pair("p1", &source, &target, Schedule::watcher())).await.unwrap();
        assert!(manager.status("p1").await.unwrap().watcher_active);

        manager.close().await;
    }

    #[tokio::test]
    async fn invalid_pair_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("same");
        let manager = PairManager::new("").unwrap();

        let p = pair("p1", &source, &source, Schedule::watcher());
        assert!(matches!(manager.start_pair(p).await, Err(Error::InvalidPair(_))));
        manager.close().await;
    }

    #[tokio::test]
    async fn list_statuses_covers_all_pairs() {
        let dir = TempDir::new().unwrap();
        let (source, target) = dirs(&dir);
        let manager = PairManager::new("").unwrap();

        manager.start_pair(pair("a", &source, &target, Schedule::disabled())).await.unwrap();
        manager
            .start_pair(pair("b", &source, &dir.path().join("dst2"), Schedule::watcher()))
            .await
            .unwrap();

        let mut statuses = manager.list_statuses().await;
        statuses.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(statuses.len(), 2);
        assert!(!statuses[0].watcher_active);
        assert!(statuses[1].watcher_active);

        manager.close().await;
    }
}
