// SPDX-License-Identifier: AGPL-3.0-or-later
// EmberKV - Eventually-Persistent Partitioned Key-Value Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The flusher: drains per-partition dirty queues into backend
//! transactions.
//!
//! One task on the read-write dispatcher. Each tick it walks the
//! partitions (active first), takes a bounded batch from each dirty
//! queue, and runs one transaction per partition through the store's
//! flush path. Batches whose commit fails land on a per-partition reject
//! queue and are retried with backoff; writes acknowledged to clients
//! are thus eventually persistent, never synchronously so.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, DispatcherCallback, Priority, TaskHandle};
use crate::store::EmberStore;
use crate::vbucket::QueuedItem;

/// Sleep between ticks when there is nothing to flush.
const IDLE_SLEEP: f64 = 1.0;
/// Backoff after a failed transaction.
const REJECT_BACKOFF: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    Initializing,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
}

impl fmt::Display for FlusherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlusherState::Initializing => "initializing",
            FlusherState::Running => "running",
            FlusherState::Pausing => "pausing",
            FlusherState::Paused => "paused",
            FlusherState::Stopping => "stopping",
            FlusherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

fn valid_transition(from: FlusherState, to: FlusherState) -> bool {
    use FlusherState::*;
    matches!(
        (from, to),
        (Initializing, Running)
            | (Initializing, Stopping)
            | (Running, Pausing)
            | (Running, Stopping)
            | (Pausing, Paused)
            | (Pausing, Stopping)
            | (Paused, Running)
            | (Paused, Stopping)
            | (Stopping, Stopped)
    )
}

pub struct Flusher {
    store: Weak<EmberStore>,
    dispatcher: Dispatcher,
    state: Mutex<FlusherState>,
    state_cv: Condvar,
    task: Mutex<Option<TaskHandle>>,
    traffic_enabled: AtomicBool,
    idle: AtomicBool,
    rejects: Mutex<HashMap<u16, Vec<QueuedItem>>>,
}

impl Flusher {
    pub(crate) fn new(store: Weak<EmberStore>, dispatcher: Dispatcher) -> Self {
        Flusher {
            store,
            dispatcher,
            state: Mutex::new(FlusherState::Initializing),
            state_cv: Condvar::new(),
            task: Mutex::new(None),
            traffic_enabled: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            rejects: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> FlusherState {
        *self.state.lock()
    }

    fn transition(&self, to: FlusherState) -> bool {
        let mut state = self.state.lock();
        if !valid_transition(*state, to) {
            warn!(from = %*state, to = %to, "invalid flusher transition refused");
            return false;
        }
        info!(from = %*state, to = %to, "flusher state change");
        *state = to;
        self.state_cv.notify_all();
        true
    }

    /// Block until the flusher reaches `want`; false on timeout.
    pub fn wait_for_state(&self, want: FlusherState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != want {
            if self.state_cv.wait_until(&mut state, deadline).timed_out() {
                return *state == want;
            }
        }
        true
    }

    pub(crate) fn start(self: Arc<Self>) {
        let callback = FlusherCallback {
            flusher: self.clone(),
        };
        let task = self
            .dispatcher
            .schedule(Box::new(callback), Priority::FLUSHER, 0.0);
        *self.task.lock() = Some(task);
    }

    /// Warmup is done; mutations may reach the backend.
    pub fn enable_traffic(&self) {
        self.traffic_enabled.store(true, Ordering::Release);
        self.notify();
    }

    /// Kick the task out of its idle sleep.
    pub fn notify(&self) {
        if self.idle.load(Ordering::Acquire) {
            if let Some(task) = &*self.task.lock() {
                self.dispatcher.wake(task);
            }
        }
    }

    pub fn pause(&self) -> bool {
        self.transition(FlusherState::Pausing)
    }

    pub fn resume(&self) -> bool {
        let resumed = self.transition(FlusherState::Running);
        if resumed {
            if let Some(task) = &*self.task.lock() {
                self.dispatcher.wake(task);
            }
        }
        resumed
    }

    /// Begin shutdown; the task drains what it can and then stops.
    pub fn stop(&self) -> bool {
        let stopped = self.transition(FlusherState::Stopping);
        if stopped {
            if let Some(task) = &*self.task.lock() {
                self.dispatcher.wake(task);
            }
        }
        stopped
    }

    fn has_rejects(&self) -> bool {
        !self.rejects.lock().is_empty()
    }

    /// One flush pass over every partition; returns items committed.
    fn flush_some(&self, store: &EmberStore) -> usize {
        let mut total = 0;
        for vbid in store.vbuckets().ids_sorted_by_state() {
            let rejected = self.rejects.lock().remove(&vbid).unwrap_or_default();
            if rejected.is_empty()
                && store
                    .vbuckets()
                    .get_bucket(vbid)
                    .map(|vb| vb.dirty_queue_len())
                    .unwrap_or(0)
                    == 0
            {
                continue;
            }
            let result = store.flush_vbucket(vbid, rejected);
            total += result.flushed;
            if !result.rejects.is_empty() {
                self.rejects
                    .lock()
                    .entry(vbid)
                    .or_default()
                    .extend(result.rejects);
            }
        }
        total
    }

    fn run(&self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            // The engine is tearing down; nothing can be flushed any
            // more, so land in the terminal state directly.
            let mut state = self.state.lock();
            *state = FlusherState::Stopped;
            self.state_cv.notify_all();
            return false;
        };
        match self.state() {
            FlusherState::Initializing => {
                if self.traffic_enabled.load(Ordering::Acquire) {
                    self.transition(FlusherState::Running);
                    dispatcher.snooze(task, 0.0);
                } else {
                    dispatcher.snooze(task, 0.1);
                }
                true
            }
            FlusherState::Running => {
                self.idle.store(false, Ordering::Release);
                let flushed = self.flush_some(&store);
                if self.has_rejects() {
                    dispatcher.snooze(task, REJECT_BACKOFF);
                } else if flushed == 0 {
                    self.idle.store(true, Ordering::Release);
                    dispatcher.snooze(task, IDLE_SLEEP);
                    // A mutation may have been queued between the empty
                    // pass and the snooze; re-check so it is not left to
                    // wait the whole idle sleep.
                    if store.stats().disk_queue_size.load(Ordering::Relaxed) > 0 {
                        self.idle.store(false, Ordering::Release);
                        dispatcher.snooze(task, 0.0);
                    }
                } else {
                    dispatcher.snooze(task, 0.0);
                }
                true
            }
            FlusherState::Pausing => {
                self.transition(FlusherState::Paused);
                dispatcher.snooze(task, IDLE_SLEEP);
                true
            }
            FlusherState::Paused => {
                dispatcher.snooze(task, IDLE_SLEEP);
                true
            }
            FlusherState::Stopping => {
                // Final drain: keep flushing until no forward progress.
                loop {
                    let flushed = self.flush_some(&store);
                    if flushed == 0 {
                        break;
                    }
                }
                if self.has_rejects() {
                    warn!("flusher stopping with rejected items still pending");
                }
                self.transition(FlusherState::Stopped);
                false
            }
            FlusherState::Stopped => false,
        }
    }
}

struct FlusherCallback {
    flusher: Arc<Flusher>,
}

impl DispatcherCallback for FlusherCallback {
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        self.flusher.run(dispatcher, task)
    }

    fn description(&self) -> String {
        "Running a flusher loop".to_string()
    }
}
