//! # Inactivity Timer
//!
//! Clears an idle conversation. The timer depends on three inputs: the number
//! of messages, whether a reply is streaming and whether live mode is on.
//! Whenever any of them changes the pending timer is cancelled, and a new one
//! is armed if there are messages, nothing is loading and live mode is off.
//!
//! Cancelled timers may already be running their callback on another task;
//! the generation token handed to the callback lets the owner discard them.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// The inputs the timer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityInputs {
    pub message_count: usize,
    pub is_loading: bool,
    pub live_mode: bool,
}

impl ActivityInputs {
    pub fn should_arm(&self) -> bool {
        self.message_count > 0 && !self.is_loading && !self.live_mode
    }
}

pub struct InactivityTimer {
    limit: Duration,
    pending: Option<JoinHandle<()>>,
    generation: u64,
    last_inputs: Option<ActivityInputs>,
}

impl InactivityTimer {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            pending: None,
            generation: 0,
            last_inputs: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether `generation` belongs to the timer that is currently armed.
    pub fn is_current(&self, generation: u64) -> bool {
        self.pending.is_some() && self.generation == generation
    }

    /// React to a possible change of inputs. `on_expire` runs after the limit
    /// with the generation of the timer that fired. Unchanged inputs leave a
    /// running timer alone.
    pub fn observe<F>(&mut self, inputs: ActivityInputs, on_expire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.last_inputs == Some(inputs) {
            return;
        }
        self.last_inputs = Some(inputs);
        self.cancel();

        if inputs.should_arm() {
            let generation = self.generation;
            let limit = self.limit;
            debug!(generation, ?limit, "Inactivity timer armed");
            self.pending = Some(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                on_expire(generation);
            }));
        }
    }

    /// Mark the current timer as fired so it is not reported armed any more.
    pub fn expired(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.pending = None;
            self.generation += 1;
        }
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.generation += 1;
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}
