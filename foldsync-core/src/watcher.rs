//! Real-time synchronisation worker: subscribes to filesystem events under
//! a pair's source tree and turns them into debounced per-file copies.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Pair;
use crate::debounce::Debouncer;
use crate::error::{Error, Result};
use crate::filter::{matches_extension, PathFilter};
use crate::hooks::HookSink;
use crate::sync::{copy_atomic, Copier};
use crate::utils::rel_path;

/// Retry delays for copies that hit transient locks (common on Windows).
const RETRY_DELAYS: [Duration; 3] =
    [Duration::from_millis(100), Duration::from_millis(300), Duration::from_millis(600)];

/// Grace period before mirroring a delete, absorbing rename races where the
/// remove event arrives before the file reappears elsewhere.
const MIRROR_DELETE_GRACE: Duration = Duration::from_millis(100);

/// Filesystem watcher for one pair. Runs until its token is cancelled.
pub struct PairWorker {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PairWorker {
    /// Spawn the worker with a token derived from `parent`.
    pub fn start(pair: Arc<Pair>, parent: &CancellationToken, hooks: Arc<dyn HookSink>) -> Self {
        let token = parent.child_token();
        let handle = tokio::spawn(run(pair, token.clone(), hooks));
        Self { token, handle: Some(handle) }
    }

    /// Cancel the worker and wait for its loop to return.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run(pair: Arc<Pair>, token: CancellationToken, hooks: Arc<dyn HookSink>) {
    info!(pair = %pair.id, "watcher starting");

    // one full reconciliation before watching; failure is not fatal
    if let Err(err) = Copier::new(&pair, hooks.as_ref()).compare_and_sync(&token).await {
        error!(pair = %pair.id, error = %err, "initial sync failed");
    }

    if let Err(err) = watch_loop(&pair, &token, &hooks).await {
        error!(pair = %pair.id, error = %err, "file watching failed");
    }

    info!(pair = %pair.id, "watcher stopping");
}

async fn watch_loop(
    pair: &Arc<Pair>,
    token: &CancellationToken,
    hooks: &Arc<dyn HookSink>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<notify::Event>(1024);

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(err) => error!(error = %err, "watcher"),
        },
        notify::Config::default(),
    )
    .map_err(into_io)?;

    // the recursive subscription also covers directories created later
    watcher.watch(&pair.source, RecursiveMode::Recursive).map_err(into_io)?;

    let debouncer = Debouncer::new(pair.debounce());
    let filter = PathFilter::new(&pair.include_extensions, &pair.exclude_globs);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                handle_event(pair, hooks, token, &debouncer, &filter, event);
            }
        }
    }

    debouncer.close();
    let _ = watcher.unwatch(&pair.source);
    Ok(())
}

fn handle_event(
    pair: &Arc<Pair>,
    hooks: &Arc<dyn HookSink>,
    token: &CancellationToken,
    debouncer: &Debouncer,
    filter: &PathFilter,
    event: notify::Event,
) {
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    let is_remove = matches!(event.kind, EventKind::Remove(_));

    for path in event.paths {
        if filter.matches_exclude(&path) {
            continue;
        }
        // new directories are already covered by the recursive subscription
        if matches!(event.kind, EventKind::Create(_)) && path.is_dir() {
            debug!(pair = %pair.id, dir = %path.display(), "directory created");
            continue;
        }
        let key = path.to_string_lossy().into_owned();
        debouncer.trigger(
            key,
            process_file_event(
                Arc::clone(pair),
                Arc::clone(hooks),
                token.clone(),
                path,
                is_remove,
            ),
        );
    }
}

/// Handle one coalesced event for one path: copy for create/write/rename/
/// chmod, delete for removes under mirror mode.
async fn process_file_event(
    pair: Arc<Pair>,
    hooks: Arc<dyn HookSink>,
    token: CancellationToken,
    path: PathBuf,
    is_remove: bool,
) {
    let rel = rel_path(&pair.source, &path);
    let target = pair.target.join(&rel);

    if is_remove {
        if pair.mirror_deletes {
            let _ = fs::remove_file(&target);
        }
        return;
    }

    let is_file = fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
    if !is_file {
        // the source vanished; re-check after a grace window before
        // mirroring the delete, in case this was half of a rename
        if pair.mirror_deletes && !path.exists() {
            tokio::time::sleep(MIRROR_DELETE_GRACE).await;
            if !path.exists() {
                let _ = fs::remove_file(&target);
            }
        }
        return;
    }

    if !matches_extension(&pair.include_extensions, &path) {
        return;
    }

    if let Some(parent) = target.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }

    let mut result = copy_atomic(&path, &target);
    for delay in RETRY_DELAYS {
        if result.is_ok() {
            break;
        }
        tokio::time::sleep(delay).await;
        result = copy_atomic(&path, &target);
    }

    match result {
        Ok(bytes) => {
            info!(pair = %pair.id, file = %rel, bytes, "copied (event)");
            hooks.file_synced(&token, &pair, &rel).await;
        }
        Err(err) => {
            error!(pair = %pair.id, file = %rel, error = %err, "copy failed after retries");
        }
    }
}

fn into_io(err: notify::Error) -> Error {
    Error::Io(io::Error::other(err))
}
