//! The host deferred-task queue.
//!
//! Every continuation attached to a [`Promise`](crate::Promise) runs as a
//! microtask on the queue of the thread that settled it. Nothing runs until
//! the host drains the queue with [`run_microtasks`] (awaiting a promise does
//! this implicitly).
//!
//! # Examples
//!
//! ```
//! use promise_chain::microtask::{queue_microtask, run_microtasks};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let log = Rc::new(RefCell::new(vec![]));
//! let first = log.clone();
//! let second = log.clone();
//! queue_microtask(move || first.borrow_mut().push(1));
//! queue_microtask(move || second.borrow_mut().push(2));
//! assert!(log.borrow().is_empty());
//!
//! assert_eq!(run_microtasks(), 2);
//! assert_eq!(*log.borrow(), vec![1, 2]);
//! ```
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

type Task = Box<dyn FnOnce()>;

thread_local! {
    static QUEUE: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Appends `task` to the back of this thread's queue.
pub fn queue_microtask<F>(task: F)
where
    F: FnOnce() + 'static,
{
    QUEUE.with(|queue| queue.borrow_mut().push_back(Box::new(task)));
}

/// Number of tasks waiting on this thread's queue.
pub fn pending_microtasks() -> usize {
    QUEUE.with(|queue| queue.borrow().len())
}

/// Runs queued tasks in FIFO order until the queue is empty, including tasks
/// queued by the tasks themselves. Returns how many tasks ran.
///
/// Calling this from inside a running task does nothing and returns `0`; the
/// outer drain picks up whatever the inner call would have run.
pub fn run_microtasks() -> usize {
    if DRAINING.with(|draining| draining.replace(true)) {
        return 0;
    }
    let _guard = DrainGuard;

    let mut ran = 0;
    // The borrow must end before the task runs, tasks queue more tasks.
    while let Some(task) = QUEUE.with(|queue| queue.borrow_mut().pop_front()) {
        task();
        ran += 1;
    }
    if ran > 0 {
        tracing::trace!(ran, "drained microtask queue");
    }
    ran
}

/// Clears the draining flag even if a task unwinds.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        DRAINING.with(|draining| draining.set(false));
    }
}
