//! A one-shot asynchronous result with cancellation.
//!
//! A [`Task`] starts pending and is resolved exactly once through [`Task::resolve`]. Observers can
//! block on it, await it, or attach callbacks:
//!
//! * [`Task::when_cancelled`] runs when somebody calls [`Task::cancel`] before resolution,
//! * [`Task::cleanup_when_done`] runs once the task is done,
//! * [`Task::delete_when_done`] ties the lifetime of an object to the task.
//!
//! A [`TaskHold`] defers both cancellation delivery and done-processing until it is dropped, so
//! that a producer can finish wiring its callbacks before any of them fire.
//!
//! Callbacks run on whichever thread triggers them (the resolving, cancelling or last releasing
//! thread), never while the internal lock is held.

use std::{any::Any, fmt, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{Error, Status};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to a one-shot asynchronous result.
///
/// Cloning a [`Task`] creates another handle to the same result.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    done_cond: Condvar,
    done_notify: Notify,
}

#[derive(Default)]
struct State {
    status: Option<Status>,
    done: bool,
    holds: usize,
    cancel_requested: bool,
    cancel_delivered: bool,
    cancel_callbacks: Vec<Callback>,
    cleanup_callbacks: Vec<Callback>,
    owned: Vec<Box<dyn Any + Send>>,
}

/// Everything that has to be run or dropped once the lock is released.
#[derive(Default)]
struct Deferred {
    cancel_callbacks: Vec<Callback>,
    cleanup_callbacks: Vec<Callback>,
    owned: Vec<Box<dyn Any + Send>>,
    notify: bool,
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Task {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                done_cond: Condvar::new(),
                done_notify: Notify::new(),
            }),
        }
    }

    /// Resolve the task with `status`.
    ///
    /// Only the first call has any effect, later calls return `false` and leave the status
    /// untouched.
    pub fn resolve(&self, status: Status) -> bool {
        let deferred = {
            let mut state = self.inner.state.lock();
            if state.status.is_some() {
                tracing::trace!("task already resolved, ignoring {status:?}");
                return false;
            }
            state.status = Some(status);
            if state.holds > 0 {
                Deferred::default()
            } else {
                state.finish()
            }
        };
        self.inner.run(deferred);
        true
    }

    /// Shorthand for resolving successfully.
    pub fn resolve_ok(&self) -> bool {
        self.resolve(Ok(()))
    }

    /// Request cancellation.
    ///
    /// Cancellation is only a request: the registered [`Task::when_cancelled`] callbacks are
    /// responsible for resolving the task. Has no effect on a resolved task.
    pub fn cancel(&self) {
        let deferred = {
            let mut state = self.inner.state.lock();
            if state.status.is_some() || state.cancel_requested {
                return;
            }
            state.cancel_requested = true;
            if state.holds > 0 {
                Deferred::default()
            } else {
                state.deliver_cancel()
            }
        };
        self.inner.run(deferred);
    }

    /// Register a callback run when cancellation is delivered.
    ///
    /// Runs immediately if cancellation was already delivered, is dropped unrun if the task
    /// resolves first.
    pub fn when_cancelled<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.status.is_some() {
            return;
        }
        if state.cancel_delivered {
            drop(state);
            f();
            return;
        }
        state.cancel_callbacks.push(Box::new(f));
    }

    /// Register a callback run once the task is done. Runs immediately on a done task.
    pub fn cleanup_when_done<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.done {
            drop(state);
            f();
            return;
        }
        state.cleanup_callbacks.push(Box::new(f));
    }

    /// Keep `object` alive until the task is done.
    pub fn delete_when_done<T>(&self, object: T)
    where
        T: Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.done {
            return;
        }
        state.owned.push(Box::new(object));
    }

    /// Place a hold on the task, see [`TaskHold`].
    pub fn hold(&self) -> TaskHold {
        self.inner.state.lock().holds += 1;
        TaskHold {
            task: self.clone(),
        }
    }

    /// The status the task was resolved with, if any.
    pub fn status(&self) -> Option<Status> {
        self.inner.state.lock().status.clone()
    }

    /// Whether [`Task::resolve`] was called, regardless of holds.
    pub fn is_resolved(&self) -> bool {
        self.inner.state.lock().status.is_some()
    }

    /// Whether the task is resolved and all holds were released.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancel_requested
    }

    /// Block the current thread until the task is done and return its status.
    pub fn wait(&self) -> Status {
        let mut state = self.inner.state.lock();
        while !state.done {
            self.inner.done_cond.wait(&mut state);
        }
        state.status.clone().unwrap_or(Ok(()))
    }

    /// Like [`Task::wait`], but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Status> {
        let mut state = self.inner.state.lock();
        if !state.done {
            self.inner
                .done_cond
                .wait_while_for(&mut state, |state| !state.done, timeout);
        }
        if state.done {
            state.status.clone()
        } else {
            None
        }
    }

    /// Wait asynchronously until the task is done and return its status.
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use ct_fetch::Task;
    ///
    /// let task = Task::new();
    /// task.resolve_ok();
    /// assert!(task.done().await.is_ok());
    /// # })
    /// ```
    pub async fn done(&self) -> Status {
        loop {
            let notified = self.inner.done_notify.notified();
            {
                let state = self.inner.state.lock();
                if state.done {
                    return state.status.clone().unwrap_or(Ok(()));
                }
            }
            notified.await;
        }
    }

    fn release(&self) {
        let deferred = {
            let mut state = self.inner.state.lock();
            debug_assert!(state.holds > 0, "released a task without a hold");
            state.holds = state.holds.saturating_sub(1);
            if state.holds > 0 {
                return;
            }
            if state.status.is_some() && !state.done {
                state.finish()
            } else if state.cancel_requested && !state.cancel_delivered && !state.done {
                state.deliver_cancel()
            } else {
                Deferred::default()
            }
        };
        self.inner.run(deferred);
    }
}

impl State {
    fn finish(&mut self) -> Deferred {
        self.done = true;
        Deferred {
            // never delivered, but they may hold handles to this very task
            cancel_callbacks: std::mem::take(&mut self.cancel_callbacks),
            cleanup_callbacks: std::mem::take(&mut self.cleanup_callbacks),
            owned: std::mem::take(&mut self.owned),
            notify: true,
        }
    }

    fn deliver_cancel(&mut self) -> Deferred {
        self.cancel_delivered = true;
        Deferred {
            cancel_callbacks: std::mem::take(&mut self.cancel_callbacks),
            ..Default::default()
        }
    }
}

impl Inner {
    fn run(&self, deferred: Deferred) {
        let Deferred {
            cancel_callbacks,
            cleanup_callbacks,
            owned,
            notify,
        } = deferred;

        if notify {
            drop(cancel_callbacks);
            for cb in cleanup_callbacks {
                cb();
            }
            drop(owned);
            self.done_cond.notify_all();
            self.done_notify.notify_waiters();
        } else {
            for cb in cancel_callbacks {
                cb();
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("status", &state.status)
            .field("done", &state.done)
            .field("holds", &state.holds)
            .field("cancel_requested", &state.cancel_requested)
            .finish()
    }
}

/// A scoped hold on a [`Task`].
///
/// While at least one hold exists, cancellation callbacks are not delivered and a resolved task
/// does not become done. Both happen when the last hold is dropped.
#[must_use = "the hold is released as soon as it is dropped"]
pub struct TaskHold {
    task: Task,
}

impl Drop for TaskHold {
    fn drop(&mut self) {
        self.task.release();
    }
}

/// Resolve `task` with `err` unless it is already resolved.
pub(crate) fn fail(task: &Task, err: Error) {
    tracing::debug!("task failed: {err}");
    task.resolve(Err(err));
}
