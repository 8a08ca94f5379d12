//! Counter store trait for abstracting local and shared implementations.

use std::time::Duration;

use async_trait::async_trait;

use super::window::Window;
use crate::error::Result;

/// Trait for windowed counter stores.
///
/// A store keeps per-key request counts for two adjacent windows: the
/// window the caller considers current and the one before it. Counts for
/// anything older are discarded. The `RateLimiter` only talks to this trait,
/// so a store shared between processes can replace the in-memory
/// `LocalWindowCounter` without touching the decision logic.
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait WindowCounterStore: Send + Sync {
    /// Add `amount` to the count for `key` in `current_window`, rotating
    /// buckets first if the window has moved.
    async fn increment_by(&self, key: &str, current_window: Window, amount: u64) -> Result<()>;

    /// Add one to the count for `key` in `current_window`.
    async fn increment(&self, key: &str, current_window: Window) -> Result<()> {
        self.increment_by(key, current_window, 1).await
    }

    /// Counts for `key` in `current_window` and `previous_window`, zero when absent.
    async fn get(
        &self,
        key: &str,
        current_window: Window,
        previous_window: Window,
    ) -> Result<(u64, u64)>;

    /// Read the counts for `key` and, when `admit` accepts them, add `amount`
    /// to the count in `current_window`.
    ///
    /// Returns the counts seen before the increment and whether the increment
    /// happened. The default is a `get` followed by `increment_by`, so two
    /// callers racing on the same key can both be admitted on the same counts.
    /// Stores able to decide and count in one step should override it.
    async fn get_and_increment_if(
        &self,
        key: &str,
        current_window: Window,
        previous_window: Window,
        amount: u64,
        admit: &(dyn Fn(u64, u64) -> bool + Send + Sync),
    ) -> Result<((u64, u64), bool)> {
        let counts = self.get(key, current_window, previous_window).await?;
        if !admit(counts.0, counts.1) {
            return Ok((counts, false));
        }
        self.increment_by(key, current_window, amount).await?;
        Ok((counts, true))
    }

    /// Re-tune the store after the owning limiter is reconfigured.
    fn configure(&self, request_limit: u64, window_length: Duration);
}
