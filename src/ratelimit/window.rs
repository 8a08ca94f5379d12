//! Fixed-length time windows.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// The start of a fixed-length time window, measured from the Unix epoch.
///
/// A window is an instant truncated to a multiple of the window length, so
/// every instant inside `[start, start + length)` maps to the same `Window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window(Duration);

impl Window {
    /// Create a window starting at the given offset from the epoch.
    pub fn from_start(start: Duration) -> Self {
        Self(start)
    }

    /// The window of the given length that contains `at`.
    ///
    /// Instants before the epoch collapse into the epoch window.
    pub fn containing(at: SystemTime, length: Duration) -> Self {
        let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let nanos = since_epoch.as_nanos();
        let truncated = match nanos.checked_rem(length.as_nanos()) {
            Some(rem) => nanos - rem,
            None => nanos,
        };
        Self(duration_from_nanos(truncated))
    }

    /// Offset of the window start from the epoch.
    pub fn start(&self) -> Duration {
        self.0
    }

    /// The window immediately before this one.
    pub fn previous(&self, length: Duration) -> Self {
        Self(self.0.saturating_sub(length))
    }

    /// The window immediately after this one.
    pub fn next(&self, length: Duration) -> Self {
        Self(self.0.saturating_add(length))
    }

    /// Time elapsed between the window start and `now`, zero if `now` is earlier.
    pub fn elapsed(&self, now: SystemTime) -> Duration {
        now.duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .saturating_sub(self.0)
    }

    /// Time left until this window rolls over.
    pub fn remaining(&self, length: Duration, now: SystemTime) -> Duration {
        length.saturating_sub(self.elapsed(now))
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0.as_secs(), self.0.subsec_nanos())
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    // Always below one second, so the cast cannot truncate.
    let subsec = (nanos % NANOS_PER_SEC) as u32;
    Duration::new(secs, subsec)
}
