//! Backoff strategies and timeouts for spin loops.
//!
//! Record locks live inside the 64-bit index entries, so waiting for one is
//! a compare-and-swap loop rather than a parked thread on a wait queue. The
//! loop asks a [`Backoff`] how to pause between attempts and a [`Deadline`]
//! whether to give up.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How a spin loop pauses between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Busy-spin with an exponentially growing number of spin hints.
    #[default]
    Spin,
    /// Yield the time slice to the scheduler.
    Yield,
    /// Sleep for a fixed number of microseconds.
    Park {
        /// Sleep duration in microseconds.
        micros: u64,
    },
}

/// Spins double per attempt up to this exponent, then the loop yields.
const SPIN_LIMIT: u32 = 6;

impl Backoff {
    /// Pauses according to the strategy. `attempt` counts from zero.
    pub fn snooze(&self, attempt: u32) {
        match self {
            Self::Spin => {
                if attempt <= SPIN_LIMIT {
                    for _ in 0..(1u32 << attempt) {
                        hint::spin_loop();
                    }
                } else {
                    thread::yield_now();
                }
            }
            Self::Yield => thread::yield_now(),
            Self::Park { micros } => thread::sleep(Duration::from_micros(*micros)),
        }
    }
}

/// How long a lock acquisition may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    /// Make a single attempt.
    TryOnce,
    /// Retry until the duration has elapsed.
    After(Duration),
    /// Retry forever.
    Infinite,
}

impl LockTimeout {
    /// Creates a timeout from milliseconds.
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self::After(Duration::from_millis(ms))
    }

    /// Starts the clock for one acquisition.
    #[must_use]
    pub fn start(self) -> Deadline {
        Deadline {
            timeout: self,
            started: Instant::now(),
        }
    }
}

impl Default for LockTimeout {
    fn default() -> Self {
        Self::from_millis(crate::constants::DEFAULT_LOCK_TIMEOUT_MS)
    }
}

/// A started [`LockTimeout`].
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    timeout: LockTimeout,
    started: Instant,
}

impl Deadline {
    /// Returns true once no further attempt may be made.
    #[must_use]
    pub fn expired(&self) -> bool {
        match self.timeout {
            LockTimeout::TryOnce => true,
            LockTimeout::After(limit) => self.started.elapsed() >= limit,
            LockTimeout::Infinite => false,
        }
    }

    /// Time spent since the clock was started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Elapsed time in whole milliseconds, saturating.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
