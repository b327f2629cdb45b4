//! Change coalescing with bounded staleness.
//!
//! # State Machine
//!
//! ```text
//!            kick()                    fire_at reached
//!  Clean ───────────► Dirty(deadline) ─────────────────► Clean (emit)
//!                      │     ▲
//!                      └─────┘ kick(): fire_at = min(now + min_batch, deadline)
//! ```
//!
//! The first kick after a clean period fixes `deadline = now + max_batch`.
//! Later kicks push the firing point out by `min_batch` but never past
//! `deadline`, so a burst collapses into one notification and continuous
//! churn still produces one at least every `max_batch`.

use std::future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};

use crate::config::duration_str;

pub const DEFAULT_MIN_BATCH: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BATCH: Duration = Duration::from_secs(60);

/// Debounce timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceSettings {
    #[serde(with = "duration_str", default = "default_min_batch")]
    pub min_batch: Duration,
    #[serde(with = "duration_str", default = "default_max_batch")]
    pub max_batch: Duration,
}

fn default_min_batch() -> Duration {
    DEFAULT_MIN_BATCH
}

fn default_max_batch() -> Duration {
    DEFAULT_MAX_BATCH
}

impl Default for DebounceSettings {
    fn default() -> Self {
        DebounceSettings {
            min_batch: DEFAULT_MIN_BATCH,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Clean,
    Dirty { deadline: Instant, fire_at: Instant },
}

#[derive(Debug)]
pub struct Debouncer {
    settings: DebounceSettings,
    state: State,
}

impl Debouncer {
    pub fn new(settings: DebounceSettings) -> Self {
        Debouncer {
            settings,
            state: State::Clean,
        }
    }

    /// Record a dirty signal. Returns when the pending notification will fire.
    pub fn kick(&mut self) -> Instant {
        let now = Instant::now();
        let deadline = match self.state {
            State::Clean => now + self.settings.max_batch,
            State::Dirty { deadline, .. } => deadline,
        };
        let fire_at = (now + self.settings.min_batch).min(deadline);
        self.state = State::Dirty { deadline, fire_at };
        fire_at
    }

    /// Drop any pending notification.
    pub fn cancel(&mut self) {
        self.state = State::Clean;
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, State::Dirty { .. })
    }

    /// Resolves when the pending notification is due and returns to
    /// `Clean`. Never resolves while clean.
    ///
    /// Cancel safe: dropping the future before it resolves leaves the
    /// state untouched.
    pub async fn fired(&mut self) {
        match self.state {
            State::Clean => future::pending::<()>().await,
            State::Dirty { fire_at, .. } => {
                sleep_until(fire_at).await;
                self.state = State::Clean;
            }
        }
    }
}
