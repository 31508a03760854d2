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

//! Priority-ordered background task runner.
//!
//! A dispatcher owns one worker thread that pops the earliest-due task
//! from a heap keyed by (wake time, priority, insertion order) and runs
//! its callback to completion. A callback returning `true` is rescheduled
//! (immediately, unless it snoozed itself while running); `false` drops
//! the task. The engine runs several dispatchers so that slow reads never
//! sit in front of the persistence path.
//!
//! Snooze and wake never re-key the heap in place: they stamp the task
//! with a new generation and push a fresh entry, and the worker discards
//! entries whose generation is stale. Cancellation is lazy the same way.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Scheduling urgency; lower values run first among tasks due together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const BG_FETCHER: Priority = Priority(0);
    pub const WARMUP: Priority = Priority(0);
    pub const VB_DELETION: Priority = Priority(1);
    pub const VB_SNAPSHOT_HIGH: Priority = Priority(2);
    pub const FLUSHER: Priority = Priority(5);
    pub const ITEM_PAGER: Priority = Priority(7);
    pub const VB_SNAPSHOT_LOW: Priority = Priority(9);
    pub const EXPIRY_PAGER: Priority = Priority(10);
}

/// A schedulable unit of background work.
pub trait DispatcherCallback: Send {
    /// Run one step. Return `true` to stay scheduled, `false` to retire.
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool;

    /// Human-readable label for logs and stats.
    fn description(&self) -> String;
}

/// Adapter so small tasks can be written as closures.
pub struct FnCallback<F> {
    name: String,
    f: F,
}

impl<F> FnCallback<F>
where
    F: FnMut(&Dispatcher, &TaskHandle) -> bool + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Box<Self> {
        Box::new(FnCallback { name: name.into(), f })
    }
}

impl<F> DispatcherCallback for FnCallback<F>
where
    F: FnMut(&Dispatcher, &TaskHandle) -> bool + Send,
{
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        (self.f)(dispatcher, task)
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

struct TaskInner {
    name: String,
    priority: Priority,
    seq: u64,
    wake_at: Mutex<Instant>,
    generation: AtomicU64,
    cancelled: AtomicBool,
    callback: Mutex<Option<Box<dyn DispatcherCallback>>>,
}

/// Shared handle to a scheduled task; cheap to clone, valid after the
/// task retires (operations on a dead task are no-ops).
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub fn description(&self) -> &str {
        &self.inner.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

struct HeapEntry {
    wake_at: Instant,
    priority: Priority,
    seq: u64,
    generation: u64,
    task: TaskHandle,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; invert so the earliest-due entry is on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then(other.priority.cmp(&self.priority))
            .then(other.seq.cmp(&self.seq))
    }
}

struct DispatcherInner {
    name: String,
    queue: Mutex<BinaryHeap<HeapEntry>>,
    cv: Condvar,
    running: AtomicBool,
    next_seq: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a dispatcher; clones share the same worker and queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>) -> Dispatcher {
        let name = name.into();
        let dispatcher = Dispatcher {
            inner: Arc::new(DispatcherInner {
                name: name.clone(),
                queue: Mutex::new(BinaryHeap::new()),
                cv: Condvar::new(),
                running: AtomicBool::new(true),
                next_seq: AtomicU64::new(0),
                worker: Mutex::new(None),
            }),
        };
        let worker_handle = {
            let d = dispatcher.clone();
            thread::Builder::new()
                .name(format!("ember-{}", name))
                .spawn(move || d.worker_loop())
                .expect("failed to spawn dispatcher thread")
        };
        *dispatcher.inner.worker.lock() = Some(worker_handle);
        dispatcher
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True when both handles drive the same worker thread.
    pub fn ptr_eq(a: &Dispatcher, b: &Dispatcher) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Insert a task. It first becomes due `initial_sleep` seconds from
    /// now and then follows its callback's reschedule decisions.
    pub fn schedule(
        &self,
        callback: Box<dyn DispatcherCallback>,
        priority: Priority,
        initial_sleep: f64,
    ) -> TaskHandle {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = TaskHandle {
            inner: Arc::new(TaskInner {
                name: callback.description(),
                priority,
                seq,
                wake_at: Mutex::new(Instant::now() + secs(initial_sleep)),
                generation: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                callback: Mutex::new(Some(callback)),
            }),
        };
        self.push_current(&task, 0);
        task
    }

    /// Move the task's wake time to `now + secs`. Last call wins, also
    /// from inside the task's own callback.
    pub fn snooze(&self, task: &TaskHandle, seconds: f64) {
        *task.inner.wake_at.lock() = Instant::now() + secs(seconds);
        let generation = task.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.push_current(task, generation);
    }

    /// Make the task due immediately.
    pub fn wake(&self, task: &TaskHandle) {
        self.snooze(task, 0.0);
    }

    /// Mark the task cancelled; it is discarded the next time it surfaces.
    pub fn cancel(&self, task: &TaskHandle) {
        task.inner.cancelled.store(true, Ordering::Release);
        // Surface it promptly so its callback is released.
        let generation = task.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *task.inner.wake_at.lock() = Instant::now();
        self.push_current(task, generation);
    }

    /// Stop the worker and drop every pending task. Must not be called
    /// from a task running on this dispatcher.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cv.notify_all();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn push_current(&self, task: &TaskHandle, generation: u64) {
        let entry = HeapEntry {
            wake_at: *task.inner.wake_at.lock(),
            priority: task.inner.priority,
            seq: task.inner.seq,
            generation,
            task: task.clone(),
        };
        let mut queue = self.inner.queue.lock();
        queue.push(entry);
        self.inner.cv.notify_one();
    }

    fn worker_loop(&self) {
        enum Step {
            Wait,
            WaitUntil(Instant),
            DiscardStale,
            DiscardCancelled,
            Run,
        }
        loop {
            let entry = {
                let mut queue = self.inner.queue.lock();
                loop {
                    if !self.inner.running.load(Ordering::Acquire) {
                        for entry in queue.drain() {
                            entry.task.inner.callback.lock().take();
                        }
                        return;
                    }
                    let step = match queue.peek() {
                        None => Step::Wait,
                        Some(top) => {
                            let current_gen = top.task.inner.generation.load(Ordering::SeqCst);
                            if top.generation != current_gen {
                                Step::DiscardStale
                            } else if top.task.is_cancelled() {
                                Step::DiscardCancelled
                            } else if top.wake_at <= Instant::now() {
                                Step::Run
                            } else {
                                Step::WaitUntil(top.wake_at)
                            }
                        }
                    };
                    match step {
                        Step::Wait => {
                            self.inner.cv.wait(&mut queue);
                        }
                        Step::WaitUntil(deadline) => {
                            let _ = self.inner.cv.wait_until(&mut queue, deadline);
                        }
                        Step::DiscardStale => {
                            queue.pop();
                        }
                        Step::DiscardCancelled => {
                            if let Some(entry) = queue.pop() {
                                entry.task.inner.callback.lock().take();
                                debug!(
                                    dispatcher = %self.inner.name,
                                    task = %entry.task.description(),
                                    "dropped cancelled task"
                                );
                            }
                        }
                        Step::Run => {
                            if let Some(entry) = queue.pop() {
                                break entry;
                            }
                        }
                    }
                }
            };
            self.run_entry(entry);
        }
    }

    fn run_entry(&self, entry: HeapEntry) {
        // If the callback is out, another (newer) entry already ran it.
        let callback = entry.task.inner.callback.lock().take();
        let Some(mut callback) = callback else {
            return;
        };
        // Default for a rescheduling callback that does not snooze: run
        // again immediately.
        *entry.task.inner.wake_at.lock() = Instant::now();
        let rerun = callback.run(self, &entry.task);
        if rerun && !entry.task.is_cancelled() && self.inner.running.load(Ordering::Acquire) {
            let generation = entry.task.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *entry.task.inner.callback.lock() = Some(callback);
            let requeued = HeapEntry {
                wake_at: *entry.task.inner.wake_at.lock(),
                priority: entry.priority,
                seq: entry.seq,
                generation,
                task: entry.task.clone(),
            };
            self.inner.queue.lock().push(requeued);
        }
    }
}

fn secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn wait_for(pred: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    #[test]
    fn test_runs_one_shot_task() {
        let d = Dispatcher::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        d.schedule(
            FnCallback::new("one-shot", move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                false
            }),
            Priority::FLUSHER,
            0.0,
        );
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        // One-shot: stays at 1.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        d.shutdown();
    }

    #[test]
    fn test_reschedule_with_in_callback_snooze() {
        let d = Dispatcher::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        d.schedule(
            FnCallback::new("repeat", move |dispatcher, task| {
                let n = h.fetch_add(1, Ordering::SeqCst) + 1;
                dispatcher.snooze(task, 0.005);
                n < 3
            }),
            Priority::FLUSHER,
            0.0,
        );
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 3, Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        d.shutdown();
    }

    #[test]
    fn test_cancel_before_due() {
        let d = Dispatcher::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = d.schedule(
            FnCallback::new("cancelled", move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                false
            }),
            Priority::FLUSHER,
            0.2,
        );
        d.cancel(&task);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
        d.shutdown();
    }

    #[test]
    fn test_wake_overrides_long_snooze() {
        let d = Dispatcher::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = d.schedule(
            FnCallback::new("sleeper", move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                false
            }),
            Priority::FLUSHER,
            60.0,
        );
        d.wake(&task);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        d.shutdown();
    }

    #[test]
    fn test_earlier_wake_time_runs_first() {
        let d = Dispatcher::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        d.schedule(
            FnCallback::new("late", move |_, _| {
                o1.lock().push("late");
                false
            }),
            Priority::BG_FETCHER,
            0.15,
        );
        d.schedule(
            FnCallback::new("early", move |_, _| {
                o2.lock().push("early");
                false
            }),
            Priority::EXPIRY_PAGER,
            0.02,
        );
        assert!(wait_for(|| order.lock().len() == 2, Duration::from_secs(2)));
        assert_eq!(*order.lock(), vec!["early", "late"]);
        d.shutdown();
    }

    #[test]
    fn test_shutdown_drops_pending_tasks() {
        let d = Dispatcher::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        d.schedule(
            FnCallback::new("never", move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                false
            }),
            Priority::FLUSHER,
            30.0,
        );
        d.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
