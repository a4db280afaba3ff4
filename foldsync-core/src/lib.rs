//! Core library for foldsync – a local service that keeps pairs of
//! directories synchronized from source to target, driven by filesystem
//! events or time-based schedules, with optional post-sync hooks.

mod config;
mod cron;
mod debounce;
mod error;
mod filter;
mod hooks;
mod manager;
mod schedule;
mod scheduler;
mod sync;
mod utils;
mod watcher;

pub use config::{
    validate_pair, CommandHook, Config, Hook, HttpHook, Pair, SyncStrategy, DEFAULT_COPY_WORKERS,
    DEFAULT_DEBOUNCE_MS, DEFAULT_HOOK_RETRIES, DEFAULT_LISTEN,
};
pub use cron::CronExpr;
pub use debounce::Debouncer;
pub use error::{Error, Result};
pub use filter::{hook_matches, matches_extension, normalize_extensions, PathFilter};
pub use hooks::{HookRunner, HookSink, HookStatus, HookStatusRegistry, NoopHooks};
pub use manager::{PairManager, PairStatus};
pub use schedule::{parse_duration, CustomSchedule, Schedule, ScheduleKind, Timezone};
pub use scheduler::{task_fn, Scheduler, TaskFn, TaskFuture, TaskSnapshot, TaskStats};
pub use sync::{copy_atomic, hash_file, Copier, SyncStats};
pub use utils::{as_posix_path, normalize_long_path, rel_path};
pub use watcher::PairWorker;
