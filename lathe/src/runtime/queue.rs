// Copyright 2025 The Lathe Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The serial task queue linearizing all kernel entry points.
//!
//! A task runs to completion before the next begins; tasks deferred while
//! one is running drain in FIFO order afterwards. Reentrant entry (a
//! kernel call made from inside a running task) executes inline, which
//! preserves program order within an action.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

type Task = Box<dyn FnOnce()>;

/// Single-threaded FIFO executor.
#[derive(Default)]
pub struct SerialQueue {
    busy: Cell<bool>,
    pending: RefCell<VecDeque<Task>>,
}

impl SerialQueue {
    /// An idle queue.
    pub fn new() -> SerialQueue {
        SerialQueue::default()
    }

    /// Runs a task now, then drains any tasks deferred while it ran.
    /// Reentrant calls execute inline.
    pub fn run<T>(&self, task: impl FnOnce() -> T) -> T {
        if self.busy.get() {
            return task();
        }
        self.busy.set(true);
        let guard = BusyGuard { queue: self };
        let result = task();
        loop {
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some(deferred) => deferred(),
                None => break,
            }
        }
        drop(guard);
        result
    }

    /// Defers a task until the current one completes; runs immediately if
    /// the queue is idle.
    pub fn defer(&self, task: Task) {
        if self.busy.get() {
            self.pending.borrow_mut().push_back(task);
        } else {
            self.run(task);
        }
    }
}

struct BusyGuard<'a> {
    queue: &'a SerialQueue,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.queue.busy.set(false);
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("busy", &self.busy.get())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}
