//! Admission control: a fixed number of sandbox slots shared by all callers.
//!
//! Waiters are served strictly in arrival order. A slot is held by an
//! `AdmissionTicket` and released when the ticket drops, on every path.

use crate::config::config::{AdmissionConfig, QueuePolicy};
use crate::core::types::CancelToken;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often a queued waiter re-checks its cancel token
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("all {capacity} slots busy and queue full")]
    QueueFull { capacity: usize },

    #[error("no slot freed within {waited:?}")]
    QueueTimeout { waited: Duration },

    #[error("cancelled after waiting {waited:?}")]
    Cancelled { waited: Duration },
}

/// Point-in-time view of the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub in_use: usize,
    pub queued: usize,
    pub capacity: usize,
    pub queue_depth: usize,
    /// Most slots ever held at once
    pub high_water: usize,
}

#[derive(Debug, Default)]
struct SlotState {
    in_use: usize,
    waiters: VecDeque<u64>,
    next_waiter: u64,
    high_water: usize,
}

impl SlotState {
    fn take(&mut self) {
        self.in_use += 1;
        self.high_water = self.high_water.max(self.in_use);
    }

    fn remove_waiter(&mut self, id: u64) {
        self.waiters.retain(|w| *w != id);
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SlotState>,
    slot_freed: Condvar,
    config: AdmissionConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // slot bookkeeping stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Counting gate with a bounded FIFO queue
#[derive(Clone, Debug)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

/// Proof of a held slot
#[derive(Debug)]
pub struct AdmissionTicket {
    shared: Arc<Shared>,
    queue_wait: Duration,
}

impl AdmissionTicket {
    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.in_use = state.in_use.saturating_sub(1);
        debug!(
            "Slot released ({} of {} in use, {} queued)",
            state.in_use,
            self.shared.config.max_concurrent,
            state.waiters.len()
        );
        drop(state);
        self.shared.slot_freed.notify_all();
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        info!(
            "Admission: {} slots, queue depth {}, timeout {}ms, policy {:?}",
            config.max_concurrent, config.queue_depth, config.queue_timeout_ms, config.policy
        );
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SlotState::default()),
                slot_freed: Condvar::new(),
                config,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.max_concurrent
    }

    /// Take a slot, queueing per policy.
    pub fn acquire(&self, cancel: Option<&CancelToken>) -> Result<AdmissionTicket, AdmissionError> {
        let config = &self.shared.config;
        let started = Instant::now();
        let mut state = self.shared.lock();

        if state.in_use < config.max_concurrent && state.waiters.is_empty() {
            state.take();
            return Ok(self.ticket(Duration::ZERO));
        }

        if config.policy == QueuePolicy::Reject || state.waiters.len() >= config.queue_depth {
            return Err(AdmissionError::QueueFull {
                capacity: config.max_concurrent,
            });
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_back(id);
        let deadline = started + Duration::from_millis(config.queue_timeout_ms);

        loop {
            if state.waiters.front() == Some(&id) && state.in_use < config.max_concurrent {
                state.waiters.pop_front();
                state.take();
                drop(state);
                // the next waiter may also fit if several slots are free
                self.shared.slot_freed.notify_all();
                return Ok(self.ticket(started.elapsed()));
            }

            if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                state.remove_waiter(id);
                drop(state);
                self.shared.slot_freed.notify_all();
                return Err(AdmissionError::Cancelled {
                    waited: started.elapsed(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                state.remove_waiter(id);
                drop(state);
                self.shared.slot_freed.notify_all();
                return Err(AdmissionError::QueueTimeout {
                    waited: started.elapsed(),
                });
            }

            let wait = (deadline - now).min(CANCEL_POLL);
            state = match self.shared.slot_freed.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn ticket(&self, queue_wait: Duration) -> AdmissionTicket {
        AdmissionTicket {
            shared: Arc::clone(&self.shared),
            queue_wait,
        }
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.shared.lock();
        AdmissionSnapshot {
            in_use: state.in_use,
            queued: state.waiters.len(),
            capacity: self.shared.config.max_concurrent,
            queue_depth: self.shared.config.queue_depth,
            high_water: state.high_water,
        }
    }
}
