use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Coalesces rapid triggers per key: only the last trigger before the
/// window goes quiet fires its callback. A trigger arriving while a
/// callback is already running schedules a fresh firing without
/// interrupting the running one.
pub struct Debouncer {
    window: Duration,
    pending: Arc<Mutex<HashMap<String, Entry>>>,
    seq: AtomicU64,
}

struct Entry {
    generation: u64,
    token: CancellationToken,
}

impl Debouncer {
    /// `window_ms` of 0 falls back to the 300 ms default.
    pub fn new(window_ms: u64) -> Self {
        let window_ms = if window_ms == 0 { DEFAULT_DEBOUNCE_MS } else { window_ms };
        Self {
            window: Duration::from_millis(window_ms),
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Schedule `fut` to run once after the window. A pending (not yet
    /// started) callback for the same key is cancelled and replaced.
    pub fn trigger<F>(&self, key: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(prev) = pending.insert(key.clone(), Entry { generation, token: token.clone() }) {
                prev.token.cancel();
            }
        }

        let window = self.window;
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    // drop our entry before running, so a trigger landing
                    // mid-callback schedules a future firing
                    {
                        let mut pending = pending.lock().unwrap();
                        if pending.get(&key).is_some_and(|e| e.generation == generation) {
                            pending.remove(&key);
                        }
                    }
                    fut.await;
                }
            }
        });
    }

    /// Cancel every pending callback.
    pub fn close(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (_, entry) in pending.drain() {
            entry.token.cancel();
        }
    }
}
