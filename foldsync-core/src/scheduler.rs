//! Task registry with five schedule modes: disabled, watcher, interval,
//! cron and custom time-window. Executions run on spawned tasks, never on
//! the dispatch loops; panics inside a task are converted to failures.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cron::CronExpr;
use crate::error::{Error, Result};
use crate::schedule::{parse_clock, parse_duration, CustomSchedule, Schedule, ScheduleKind, Timezone};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |token| -> TaskFuture { Box::pin(f(token)) })
}

/// Execution statistics for one task. Counters are monotonic;
/// `run_count + fail_count` equals the number of completed executions.
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub fail_count: u64,
    pub last_error: String,
}

/// Externally visible view of a task, with the callable and scheduling
/// handles stripped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub fail_count: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

struct Task {
    id: String,
    name: String,
    runner: TaskFn,
    state: Mutex<TaskState>,
}

struct TaskState {
    schedule: Schedule,
    enabled: bool,
    stats: TaskStats,
    /// Cancellation token of the current schedule generation; `None` for
    /// disabled/watcher tasks and while unscheduled.
    generation: Option<CancellationToken>,
}

/// Registry of scheduled tasks keyed by id.
pub struct Scheduler {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
    token: CancellationToken,
    tz: Timezone,
}

impl Scheduler {
    /// `timezone` applies to cron and custom schedules; empty means local.
    pub fn new(timezone: &str) -> Result<Self> {
        Ok(Self {
            tasks: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            tz: Timezone::parse(timezone)?,
        })
    }

    /// Register and schedule a new task. Fails if the id is taken or the
    /// schedule does not validate.
    pub fn add(&self, id: &str, name: &str, schedule: Schedule, runner: TaskFn) -> Result<()> {
        schedule.validate()?;
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(id) {
            return Err(Error::Duplicate(id.to_string()));
        }
        let kind = schedule.kind.type_name();
        let task = Arc::new(Task {
            id: id.to_string(),
            name: name.to_string(),
            runner,
            state: Mutex::new(TaskState {
                schedule,
                enabled: true,
                stats: TaskStats::default(),
                generation: None,
            }),
        });
        self.schedule_task(&task)?;
        tasks.insert(id.to_string(), task);
        info!(task = id, kind, "task added");
        Ok(())
    }

    /// Unschedule and forget a task. Idempotent; returns whether a task
    /// was actually removed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.tasks.lock().unwrap().remove(id);
        match removed {
            Some(task) => {
                unschedule(&task);
                info!(task = id, "task removed");
                true
            }
            None => false,
        }
    }

    /// Swap a task's schedule, rescheduling under a fresh generation when
    /// the task is enabled. An invalid schedule leaves the task untouched.
    pub fn update(&self, id: &str, schedule: Schedule) -> Result<()> {
        schedule.validate()?;
        let task = self.get_task(id)?;
        let enabled = {
            let mut state = task.state.lock().unwrap();
            if let Some(generation) = state.generation.take() {
                generation.cancel();
            }
            state.stats.next_run = None;
            state.schedule = schedule;
            state.enabled
        };
        if enabled {
            self.schedule_task(&task)?;
        }
        info!(task = id, "task updated");
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<()> {
        let task = self.get_task(id)?;
        {
            let mut state = task.state.lock().unwrap();
            if state.enabled {
                return Ok(());
            }
            state.enabled = true;
        }
        self.schedule_task(&task)
    }

    pub fn disable(&self, id: &str) -> Result<()> {
        let task = self.get_task(id)?;
        let mut state = task.state.lock().unwrap();
        if !state.enabled {
            return Ok(());
        }
        state.enabled = false;
        if let Some(generation) = state.generation.take() {
            generation.cancel();
        }
        state.stats.next_run = None;
        Ok(())
    }

    /// Dispatch one execution in the background, bypassing the schedule.
    pub fn run_now(&self, id: &str) -> Result<()> {
        let task = self.get_task(id)?;
        tokio::spawn(execute(task, self.token.child_token()));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<TaskSnapshot> {
        let task = self.get_task(id)?;
        Ok(snapshot(&task))
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.tasks.lock().unwrap().values().map(|task| snapshot(task)).collect()
    }

    /// Cancel every schedule loop and in-flight execution.
    pub fn stop(&self) {
        self.token.cancel();
        info!("scheduler stopped");
    }

    fn get_task(&self, id: &str) -> Result<Arc<Task>> {
        self.tasks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn schedule_task(&self, task: &Arc<Task>) -> Result<()> {
        let schedule = task.state.lock().unwrap().schedule.clone();
        let tz = match &schedule.timezone {
            Some(name) => Timezone::parse(name)?,
            None => self.tz,
        };
        match &schedule.kind {
            // no firing path; watcher tasks are driven externally
            ScheduleKind::Disabled | ScheduleKind::Watcher => Ok(()),
            ScheduleKind::Interval { interval } => {
                let period = parse_duration(interval)?;
                let generation = self.new_generation(task);
                {
                    let mut state = task.state.lock().unwrap();
                    state.stats.next_run = Some(utc_in(period));
                }
                tokio::spawn(interval_loop(Arc::clone(task), generation, self.token.clone(), period));
                Ok(())
            }
            ScheduleKind::Cron { cron_expr } => {
                let expr = CronExpr::parse(cron_expr)?;
                let generation = self.new_generation(task);
                tokio::spawn(cron_loop(Arc::clone(task), generation, self.token.clone(), expr, tz));
                Ok(())
            }
            ScheduleKind::Custom { custom } => {
                let runtime = CustomRuntime::compile(custom)?;
                let generation = self.new_generation(task);
                {
                    let mut state = task.state.lock().unwrap();
                    state.stats.next_run = Some(utc_in(runtime.interval));
                }
                tokio::spawn(custom_loop(Arc::clone(task), generation, self.token.clone(), runtime, tz));
                Ok(())
            }
        }
    }

    fn new_generation(&self, task: &Arc<Task>) -> CancellationToken {
        let generation = self.token.child_token();
        let mut state = task.state.lock().unwrap();
        if let Some(old) = state.generation.replace(generation.clone()) {
            old.cancel();
        }
        generation
    }
}

fn unschedule(task: &Task) {
    let mut state = task.state.lock().unwrap();
    if let Some(generation) = state.generation.take() {
        generation.cancel();
    }
    state.stats.next_run = None;
}

fn snapshot(task: &Task) -> TaskSnapshot {
    let state = task.state.lock().unwrap();
    TaskSnapshot {
        id: task.id.clone(),
        name: task.name.clone(),
        schedule: state.schedule.clone(),
        enabled: state.enabled,
        last_run: state.stats.last_run,
        next_run: state.stats.next_run,
        run_count: state.stats.run_count,
        fail_count: state.stats.fail_count,
        last_error: state.stats.last_error.clone(),
    }
}

/// Gate shared by every firing path: enabled, inside the date bounds, and
/// under the run limit.
fn should_execute(task: &Task) -> bool {
    let state = task.state.lock().unwrap();
    if !state.enabled {
        return false;
    }
    let now = Utc::now();
    if let Some(start) = state.schedule.start_date {
        if now < start {
            return false;
        }
    }
    if let Some(end) = state.schedule.end_date {
        if now > end {
            return false;
        }
    }
    if let Some(max) = state.schedule.max_runs {
        if max > 0 && state.stats.run_count >= u64::from(max) {
            return false;
        }
    }
    true
}

/// Run the task body on its own spawned task so a panic unwinds there and
/// surfaces as a join error instead of taking the dispatch loop down.
async fn execute(task: Arc<Task>, token: CancellationToken) {
    info!(task = %task.id, "executing task");
    let timer = Instant::now();
    task.state.lock().unwrap().stats.last_run = Some(Utc::now());

    let body = (task.runner)(token);
    let outcome = tokio::spawn(body).await;

    let mut state = task.state.lock().unwrap();
    match outcome {
        Ok(Ok(())) => {
            state.stats.run_count += 1;
            state.stats.last_error.clear();
            info!(task = %task.id, elapsed_ms = timer.elapsed().as_millis() as u64, "task completed");
        }
        Ok(Err(err)) => {
            state.stats.fail_count += 1;
            state.stats.last_error = err.to_string();
            error!(task = %task.id, error = %err, "task failed");
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                format!("panic: {}", panic_message(join_err))
            } else {
                "task aborted".to_string()
            };
            error!(task = %task.id, error = %message, "task panicked");
            state.stats.fail_count += 1;
            state.stats.last_error = message;
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn interval_loop(
    task: Arc<Task>,
    generation: CancellationToken,
    root: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // the immediate first tick; firings start one period in
    loop {
        tokio::select! {
            _ = generation.cancelled() => return,
            _ = ticker.tick() => {
                if should_execute(&task) {
                    tokio::spawn(execute(Arc::clone(&task), root.child_token()));
                    task.state.lock().unwrap().stats.next_run = Some(utc_in(period));
                }
            }
        }
    }
}

async fn cron_loop(
    task: Arc<Task>,
    generation: CancellationToken,
    root: CancellationToken,
    expr: CronExpr,
    tz: Timezone,
) {
    loop {
        let now = tz.now();
        let Some(next) = expr.next_after(now) else {
            task.state.lock().unwrap().stats.next_run = None;
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        task.state.lock().unwrap().stats.next_run = Some(tz.to_utc(next));
        tokio::select! {
            _ = generation.cancelled() => return,
            _ = tokio::time::sleep(wait) => {
                if should_execute(&task) {
                    tokio::spawn(execute(Arc::clone(&task), root.child_token()));
                }
            }
        }
    }
}

/// Compiled form of a custom schedule.
struct CustomRuntime {
    week_days: Vec<u8>,
    start: NaiveTime,
    end: NaiveTime,
    interval: Duration,
}

impl CustomRuntime {
    fn compile(custom: &CustomSchedule) -> Result<Self> {
        custom.validate()?;
        Ok(Self {
            week_days: custom.week_days.clone(),
            start: parse_clock(&custom.start_time)?,
            end: parse_clock(&custom.end_time)?,
            interval: parse_duration(&custom.interval)?,
        })
    }
}

async fn custom_loop(
    task: Arc<Task>,
    generation: CancellationToken,
    root: CancellationToken,
    runtime: CustomRuntime,
    tz: Timezone,
) {
    let check = runtime.interval.min(Duration::from_secs(60));
    let mut ticker = tokio::time::interval(check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut last_execution: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = generation.cancelled() => return,
            _ = ticker.tick() => {
                let now = tz.now();
                let due = should_execute(&task)
                    && weekday_allowed(&runtime.week_days, now.date().weekday().num_days_from_sunday() as u8)
                    && within_window(now.time(), runtime.start, runtime.end)
                    && last_execution.map_or(true, |at| at.elapsed() >= runtime.interval);
                if due {
                    tokio::spawn(execute(Arc::clone(&task), root.child_token()));
                    last_execution = Some(Instant::now());
                    // display value only; firing is guarded by the predicate above
                    task.state.lock().unwrap().stats.next_run = Some(utc_in(runtime.interval));
                }
            }
        }
    }
}

fn weekday_allowed(allowed: &[u8], day: u8) -> bool {
    allowed.is_empty() || allowed.contains(&day)
}

fn within_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    now >= start && now <= end
}

fn utc_in(period: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero())
}
