//! In-memory windowed counter implementation.

use std::time::{Duration, SystemTime};

use ahash::{AHashMap, RandomState};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::backend::WindowCounterStore;
use super::window::Window;
use crate::error::Result;

/// Bucket state guarded by the counter's lock.
struct Buckets {
    /// Length of a window
    window_length: Duration,
    /// Window the `latest` bucket belongs to
    latest_window: Window,
    /// Counts for `latest_window`
    latest: AHashMap<u64, u64>,
    /// Counts for the window before `latest_window`
    previous: AHashMap<u64, u64>,
}

impl Buckets {
    /// Bring the buckets in line with `current_window`.
    fn rotate(&mut self, current_window: Window) {
        if self.latest_window == current_window {
            return;
        }

        if self.latest_window.next(self.window_length) == current_window {
            // Reuse the old previous map as the new latest one.
            self.previous.clear();
            std::mem::swap(&mut self.latest, &mut self.previous);
            self.latest_window = current_window;
            return;
        }

        self.latest.clear();
        self.previous.clear();
        self.latest_window = current_window;
    }

    /// Counts for `hkey` as seen from `current_window`, without rotating.
    fn counts(&self, hkey: u64, current_window: Window, previous_window: Window) -> (u64, u64) {
        if self.latest_window == current_window {
            let current = self.latest.get(&hkey).copied().unwrap_or(0);
            let previous = self.previous.get(&hkey).copied().unwrap_or(0);
            return (current, previous);
        }

        // The caller has moved one window ahead of the last increment.
        if self.latest_window == previous_window {
            return (0, self.latest.get(&hkey).copied().unwrap_or(0));
        }

        (0, 0)
    }

    /// Rotate to `current_window` and add `amount` to `hkey`, returning the new count.
    fn add(&mut self, hkey: u64, current_window: Window, amount: u64) -> u64 {
        self.rotate(current_window);
        let count = self.latest.entry(hkey).or_insert(0);
        *count = count.saturating_add(amount);
        *count
    }
}

/// A process-local `WindowCounterStore` holding two rotating buckets.
///
/// Keys are reduced to 64-bit hashes before they are stored. Two distinct
/// keys with the same hash share a count; with a 64-bit hash this is rare
/// enough to accept in exchange for not retaining arbitrary-length keys.
///
/// Buckets are rotated lazily on increment, never by a background task.
/// Every operation completes without I/O and never returns an error.
pub struct LocalWindowCounter {
    /// Hasher for reducing keys, fixed for the lifetime of the counter
    hasher: RandomState,
    /// Bucket state
    buckets: RwLock<Buckets>,
}

impl LocalWindowCounter {
    /// Create a new counter for windows of the given length, starting at the
    /// window containing the current time.
    pub fn new(window_length: Duration) -> Self {
        Self {
            hasher: RandomState::new(),
            buckets: RwLock::new(Buckets {
                window_length,
                latest_window: Window::containing(SystemTime::now(), window_length),
                latest: AHashMap::new(),
                previous: AHashMap::new(),
            }),
        }
    }

    /// Window currently tracked by the `latest` bucket.
    pub fn latest_window(&self) -> Window {
        self.buckets.read().latest_window
    }

    /// Number of keys with a count in either bucket.
    pub fn tracked_keys(&self) -> usize {
        let buckets = self.buckets.read();
        buckets.latest.len() + buckets.previous.len()
    }

    fn hash_key(&self, key: &str) -> u64 {
        self.hasher.hash_one(key)
    }
}

#[async_trait]
impl WindowCounterStore for LocalWindowCounter {
    async fn increment_by(&self, key: &str, current_window: Window, amount: u64) -> Result<()> {
        let hkey = self.hash_key(key);
        let count = self.buckets.write().add(hkey, current_window, amount);

        trace!(key = %key, window = %current_window, count = count, "Incremented counter");
        Ok(())
    }

    async fn get(
        &self,
        key: &str,
        current_window: Window,
        previous_window: Window,
    ) -> Result<(u64, u64)> {
        let hkey = self.hash_key(key);
        Ok(self.buckets.read().counts(hkey, current_window, previous_window))
    }

    async fn get_and_increment_if(
        &self,
        key: &str,
        current_window: Window,
        previous_window: Window,
        amount: u64,
        admit: &(dyn Fn(u64, u64) -> bool + Send + Sync),
    ) -> Result<((u64, u64), bool)> {
        let hkey = self.hash_key(key);
        let mut buckets = self.buckets.write();

        let counts = buckets.counts(hkey, current_window, previous_window);
        if !admit(counts.0, counts.1) {
            return Ok((counts, false));
        }

        let count = buckets.add(hkey, current_window, amount);
        trace!(key = %key, window = %current_window, count = count, "Incremented counter");
        Ok((counts, true))
    }

    fn configure(&self, _request_limit: u64, window_length: Duration) {
        let mut buckets = self.buckets.write();
        buckets.window_length = window_length;
        buckets.latest_window = Window::containing(SystemTime::now(), window_length);
        buckets.latest.clear();
        buckets.previous.clear();
    }
}
