//! The promise state machine and its continuation protocol.
//!
//! A [`Promise`] starts pending and settles at most once, either fulfilled
//! with a value or rejected with an error. Continuations attached with
//! [`Promise::then`] and friends never run inline: each one is queued on the
//! thread's [microtask](crate::microtask) queue once the promise settles.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{microtask::run_microtasks, Error, Promise};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let seen = Rc::new(RefCell::new(None));
//! let slot = seen.clone();
//! let start: Promise<i32> = Promise::resolve(21);
//! let doubled: Promise<i32> = start.then(|v: i32| Ok(v * 2));
//! doubled.then(move |v: i32| {
//!     *slot.borrow_mut() = Some(v);
//!     Ok::<_, Error>(())
//! });
//!
//! assert_eq!(*seen.borrow(), None);
//! run_microtasks();
//! assert_eq!(*seen.borrow(), Some(42));
//! ```
use std::{
    any,
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use crate::{microtask, Error, Resolution};

/// The observable state of a [`Promise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

type Callback<V> = Box<dyn FnOnce(V)>;

enum Status<T, E> {
    Pending(Waiting<T, E>),
    Fulfilled(T),
    Rejected(E),
}

/// Everything queued against a promise that has not settled yet.
struct Waiting<T, E> {
    on_fulfilled: Vec<Callback<T>>,
    on_rejected: Vec<Callback<E>>,
    wakers: Vec<Waker>,
}

impl<T, E> Default for Waiting<T, E> {
    fn default() -> Self {
        Self {
            on_fulfilled: vec![],
            on_rejected: vec![],
            wakers: vec![],
        }
    }
}

struct Inner<T, E> {
    status: Status<T, E>,
    // Set once the promise has been resolved with another promise. Public
    // resolve/reject calls are ignored from then on.
    locked: bool,
    follows: Option<Weak<RefCell<Inner<T, E>>>>,
    handled: bool,
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        if let Status::Rejected(_) = self.status {
            if !self.handled {
                tracing::warn!(
                    error_type = any::type_name::<E>(),
                    "promise rejected with no rejection handler attached"
                );
            }
        }
    }
}

/// A value that will become available, or fail, at most once.
///
/// Cloning a `Promise` clones the handle, not the value: every clone observes
/// the same settlement.
pub struct Promise<T, E = Error> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

/// The fulfilling capability handed to a promise's resolver.
pub struct Resolve<T, E = Error> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

/// The rejecting capability handed to a promise's resolver.
pub struct Reject<T, E = Error> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> Promise<T, E> {
    pub fn state(&self) -> State {
        match self.inner.borrow().status {
            Status::Pending(_) => State::Pending,
            Status::Fulfilled(_) => State::Fulfilled,
            Status::Rejected(_) => State::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state() == State::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone, E: Clone> Promise<T, E> {
    /// The fulfillment value, if the promise has fulfilled.
    pub fn result(&self) -> Option<T> {
        match &self.inner.borrow().status {
            Status::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection reason, if the promise has rejected.
    pub fn error(&self) -> Option<E> {
        match &self.inner.borrow().status {
            Status::Rejected(err) => Some(err.clone()),
            _ => None,
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `resolver` synchronously with its two
    /// settlement capabilities.
    ///
    /// An `Err` returned from the resolver, or a panic inside it, rejects the
    /// promise (unless it already settled); neither reaches the caller.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Error, Promise, State};
    ///
    /// let p: Promise<&str> = Promise::new(|resolve, _reject| {
    ///     resolve.resolve("done");
    ///     Ok(())
    /// });
    /// assert_eq!(p.state(), State::Fulfilled);
    ///
    /// let q: Promise<&str> = Promise::new(|_resolve, _reject| Err(Error::rejected("nope")));
    /// assert_eq!(q.error(), Some(Error::rejected("nope")));
    /// ```
    pub fn new<F>(resolver: F) -> Self
    where
        F: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
    {
        let (promise, resolve, reject) = Self::with_resolvers();
        let on_error = reject.clone();
        match panic::catch_unwind(AssertUnwindSafe(move || resolver(resolve, reject))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => on_error.reject(err),
            Err(payload) => {
                let err = Error::from_panic(payload);
                tracing::debug!(%err, "promise resolver panicked");
                on_error.reject(E::from(err));
            }
        }
        promise
    }

    /// Creates a pending promise and hands back its settlement capabilities.
    pub fn with_resolvers() -> (Self, Resolve<T, E>, Reject<T, E>) {
        let inner = Rc::new(RefCell::new(Inner {
            status: Status::Pending(Waiting::default()),
            locked: false,
            follows: None,
            handled: false,
        }));
        (
            Promise {
                inner: inner.clone(),
            },
            Resolve {
                inner: inner.clone(),
            },
            Reject { inner },
        )
    }

    /// Returns `value` itself when it is already a promise, otherwise a
    /// promise fulfilled with it.
    pub fn resolve(value: impl Into<Resolution<T, E>>) -> Self {
        match value.into() {
            Resolution::Promise(promise) => promise,
            Resolution::Value(value) => {
                let (promise, resolve, _) = Self::with_resolvers();
                resolve.resolve(value);
                promise
            }
        }
    }

    /// A promise already rejected with `reason`.
    pub fn reject(reason: E) -> Self {
        let (promise, _, reject) = Self::with_resolvers();
        reject.reject(reason);
        promise
    }

    /// Chains a fulfillment handler. Rejections pass through unchanged.
    ///
    /// A handler returning `Ok(value)` fulfills the derived promise, one
    /// returning `Ok(promise)` makes the derived promise follow `promise`, and
    /// one returning `Err(err)` or panicking rejects it. When the handler
    /// returns a promise, the derived promise's type usually needs an
    /// annotation.
    pub fn then<U, F, R>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<R, E> + 'static,
        R: Into<Resolution<U, E>>,
    {
        self.then_else(on_fulfilled, |err| Err::<U, E>(err))
    }

    /// Chains both a fulfillment and a rejection handler. Exactly one of them
    /// runs, in its own microtask, after this promise settles.
    pub fn then_else<U, F, R, G, S>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<R, E> + 'static,
        R: Into<Resolution<U, E>>,
        G: FnOnce(E) -> Result<S, E> + 'static,
        S: Into<Resolution<U, E>>,
    {
        let (next, resolve, reject) = Promise::<U, E>::with_resolvers();
        let (resolve_err, reject_err) = (resolve.clone(), reject.clone());
        self.subscribe(
            move |value| run_handler(move || on_fulfilled(value), &resolve, &reject),
            move |err| run_handler(move || on_rejected(err), &resolve_err, &reject_err),
        );
        next
    }

    /// Recovers from a rejection. Fulfillments pass through unchanged.
    pub fn catch<G, S>(&self, on_rejected: G) -> Self
    where
        G: FnOnce(E) -> Result<S, E> + 'static,
        S: Into<Resolution<T, E>>,
    {
        self.then_else(|value| Ok::<T, E>(value), on_rejected)
    }

    /// Runs `on_finally` once this promise settles, then passes the original
    /// outcome on.
    ///
    /// If `on_finally` returns a promise, the outcome is held back until that
    /// promise settles. If `on_finally` fails (or the promise it returned
    /// rejects), the derived promise rejects with that error instead.
    pub fn finally<F, R>(&self, on_finally: F) -> Self
    where
        F: FnOnce() -> Result<R, E> + 'static,
        R: Into<Resolution<(), E>>,
    {
        let on_fulfilled = Rc::new(Cell::new(Some(on_finally)));
        let on_rejected = on_fulfilled.clone();
        self.then_else(
            move |value| match on_fulfilled.take() {
                Some(f) => Ok(Resolution::Promise(
                    Promise::<(), E>::resolve(f()?).then(move |()| Ok::<T, E>(value)),
                )),
                None => Ok(Resolution::Value(value)),
            },
            move |err| match on_rejected.take() {
                Some(f) => Ok(Resolution::Promise(
                    Promise::<(), E>::resolve(f()?).then(move |()| Err::<T, E>(err)),
                )),
                None => Err(err),
            },
        )
    }

    /// Registers the two internal callbacks. Each one, when it fires, only
    /// queues its continuation as a microtask.
    pub(crate) fn subscribe<F, G>(&self, on_fulfilled: F, on_rejected: G)
    where
        F: FnOnce(T) + 'static,
        G: FnOnce(E) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.handled = true;
        match &mut inner.status {
            Status::Fulfilled(value) => {
                let value = value.clone();
                microtask::queue_microtask(move || on_fulfilled(value));
            }
            Status::Rejected(err) => {
                let err = err.clone();
                microtask::queue_microtask(move || on_rejected(err));
            }
            Status::Pending(waiting) => {
                waiting.on_fulfilled.push(Box::new(move |value| {
                    microtask::queue_microtask(move || on_fulfilled(value))
                }));
                waiting.on_rejected.push(Box::new(move |err| {
                    microtask::queue_microtask(move || on_rejected(err))
                }));
            }
        }
    }
}

/// Runs a user handler and settles the derived promise with its outcome.
fn run_handler<U, E, H, R>(handler: H, resolve: &Resolve<U, E>, reject: &Reject<U, E>)
where
    U: Clone + 'static,
    E: Clone + From<Error> + 'static,
    H: FnOnce() -> Result<R, E>,
    R: Into<Resolution<U, E>>,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(value)) => resolve.resolve(value),
        Ok(Err(err)) => reject.reject(err),
        Err(payload) => {
            let err = Error::from_panic(payload);
            tracing::debug!(%err, "promise handler panicked");
            reject.reject(E::from(err));
        }
    }
}

impl<T, E> Resolve<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Fulfills the promise with `value`, or makes it follow `value` when that
    /// is itself a promise. Ignored once the promise settled or started
    /// following another promise.
    pub fn resolve(&self, value: impl Into<Resolution<T, E>>) {
        if !accepts_resolution(&self.inner) {
            return;
        }
        match value.into() {
            Resolution::Value(value) => settle(&self.inner, Ok(value)),
            Resolution::Promise(target) => self.follow(target),
        }
    }

    fn follow(&self, target: Promise<T, E>) {
        if leads_back_to(&target.inner, &self.inner) {
            tracing::debug!("chaining cycle detected, rejecting promise");
            settle(&self.inner, Err(E::from(Error::ChainingCycle)));
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.locked = true;
            inner.follows = Some(Rc::downgrade(&target.inner));
        }
        tracing::trace!("promise now follows another promise");

        let on_value = self.inner.clone();
        let on_error = self.inner.clone();
        target.subscribe(
            move |value| settle(&on_value, Ok(value)),
            move |err| settle(&on_error, Err(err)),
        );
    }
}

impl<T: Clone, E: Clone> Reject<T, E> {
    /// Rejects the promise with `err`. Ignored once the promise settled or
    /// started following another promise.
    pub fn reject(&self, err: E) {
        if accepts_resolution(&self.inner) {
            settle(&self.inner, Err(err));
        }
    }
}

fn accepts_resolution<T, E>(inner: &Rc<RefCell<Inner<T, E>>>) -> bool {
    let inner = inner.borrow();
    matches!(inner.status, Status::Pending(_)) && !inner.locked
}

/// Whether following `start` would eventually make `target` wait on itself.
fn leads_back_to<T, E>(
    start: &Rc<RefCell<Inner<T, E>>>,
    target: &Rc<RefCell<Inner<T, E>>>,
) -> bool {
    let mut cursor = Some(start.clone());
    while let Some(node) = cursor {
        if Rc::ptr_eq(&node, target) {
            return true;
        }
        cursor = node.borrow().follows.as_ref().and_then(Weak::upgrade);
    }
    false
}

/// Moves a pending promise to its final state and fires what was waiting.
/// Does nothing when the promise already settled.
fn settle<T: Clone, E: Clone>(inner: &Rc<RefCell<Inner<T, E>>>, outcome: Result<T, E>) {
    let waiting = {
        let mut inner = inner.borrow_mut();
        if !matches!(inner.status, Status::Pending(_)) {
            return;
        }
        inner.follows = None;
        let next = match &outcome {
            Ok(value) => Status::Fulfilled(value.clone()),
            Err(err) => Status::Rejected(err.clone()),
        };
        match std::mem::replace(&mut inner.status, next) {
            Status::Pending(waiting) => waiting,
            _ => return,
        }
    };

    match outcome {
        Ok(value) => {
            tracing::trace!(callbacks = waiting.on_fulfilled.len(), "promise fulfilled");
            for callback in waiting.on_fulfilled {
                callback(value.clone());
            }
        }
        Err(err) => {
            tracing::trace!(callbacks = waiting.on_rejected.len(), "promise rejected");
            for callback in waiting.on_rejected {
                callback(err.clone());
            }
        }
    }
    for waker in waiting.wakers {
        waker.wake()
    }
}

/// Polling drains this thread's microtask queue first. A poll issued from
/// inside a running microtask (for example `block_on` within a handler) cannot
/// drain it, since the drain is not re-entrant, so a promise that still needs
/// queued work to settle will never wake that executor.
impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        microtask::run_microtasks();
        let mut inner = self.inner.borrow_mut();
        inner.handled = true;
        match &mut inner.status {
            Status::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            Status::Rejected(err) => Poll::Ready(Err(err.clone())),
            Status::Pending(waiting) => {
                waiting.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Promise, State};
    use crate::{microtask::run_microtasks, Error};
    use std::{
        cell::RefCell,
        rc::Rc,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    type P<T> = Promise<T, Error>;

    #[derive(Debug, Clone, PartialEq)]
    enum AppError {
        Lib(Error),
        Code(i32),
    }

    impl From<Error> for AppError {
        fn from(err: Error) -> Self {
            AppError::Lib(err)
        }
    }

    /// Counts `WARN` events.
    struct WarnCounter(Arc<AtomicUsize>);

    impl tracing::Subscriber for WarnCounter {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }

        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}

        fn event(&self, event: &tracing::Event<'_>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn enter(&self, _: &tracing::span::Id) {}

        fn exit(&self, _: &tracing::span::Id) {}
    }

    #[test]
    fn starts_pending_with_nothing_settled() {
        let (p, _, _) = P::<i32>::with_resolvers();
        assert_eq!(p.state(), State::Pending);
        assert_eq!(p.result(), None);
        assert_eq!(p.error(), None);
    }

    #[test]
    fn only_first_settlement_counts() {
        let p = P::<&str>::new(|resolve, reject| {
            resolve.resolve("first");
            reject.reject(Error::rejected("late"));
            resolve.resolve("second");
            Ok(())
        });
        assert_eq!(p.result(), Some("first"));
        assert_eq!(p.error(), None);

        let q = P::<&str>::new(|resolve, reject| {
            reject.reject(Error::rejected("first"));
            resolve.resolve("late");
            Ok(())
        });
        assert_eq!(q.error(), Some(Error::rejected("first")));
    }

    #[test]
    fn resolver_error_after_settlement_is_ignored() {
        let p = P::<i32>::new(|resolve, _| {
            resolve.resolve(1);
            Err(Error::rejected("ignored"))
        });
        assert_eq!(p.result(), Some(1));
    }

    #[allow(unreachable_code)]
    #[test]
    fn resolver_panic_rejects() {
        let p = P::<i32>::new(|_, _| {
            panic!("executor error");
            Ok(())
        });
        assert_eq!(p.error(), Some(Error::Panicked("executor error".into())));
    }

    #[test]
    fn fulfill_callbacks_drain_once_at_settlement() {
        let (p, resolve, _) = P::<i32>::with_resolvers();
        let calls = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            p.subscribe(move |_| *calls.borrow_mut() += 1, |_| {});
        }
        resolve.resolve(5);
        resolve.resolve(6);
        run_microtasks();
        assert_eq!(*calls.borrow(), 3);
        let inner = p.inner.borrow();
        assert!(matches!(inner.status, super::Status::Fulfilled(5)));
    }

    #[test]
    fn following_locks_out_direct_settlement() {
        let (outer, resolve, reject) = P::<i32>::with_resolvers();
        let (inner, resolve_inner, _) = P::<i32>::with_resolvers();
        resolve.resolve(inner.clone());
        reject.reject(Error::rejected("too late"));
        resolve.resolve(3);
        assert!(outer.is_pending());

        resolve_inner.resolve(9);
        run_microtasks();
        assert_eq!(outer.result(), Some(9));
        assert!(outer.inner.borrow().follows.is_none());
    }

    #[test]
    fn resolving_with_itself_is_a_cycle() {
        let (p, resolve, _) = P::<i32>::with_resolvers();
        resolve.resolve(p.clone());
        assert_eq!(p.error(), Some(Error::ChainingCycle));
    }

    #[test]
    fn mutual_follow_is_a_cycle() {
        let (a, resolve_a, _) = P::<i32>::with_resolvers();
        let (b, resolve_b, _) = P::<i32>::with_resolvers();
        resolve_a.resolve(b.clone());
        resolve_b.resolve(a.clone());
        assert_eq!(b.error(), Some(Error::ChainingCycle));

        run_microtasks();
        assert_eq!(a.error(), Some(Error::ChainingCycle));
    }

    #[test]
    fn debug_shows_state() {
        let p = P::<i32>::reject(Error::rejected("x"));
        let _ = p.catch(|_| Ok::<i32, Error>(0));
        assert_eq!(format!("{:?}", p), "Promise { state: Rejected }");
    }

    #[test]
    fn custom_error_type_receives_library_errors() {
        let (p, resolve, _) = Promise::<i32, AppError>::with_resolvers();
        resolve.resolve(p.clone());
        assert_eq!(p.error(), Some(AppError::Lib(Error::ChainingCycle)));

        let panicked: Promise<i32, AppError> =
            Promise::<i32, AppError>::resolve(1).then(|_: i32| -> Result<i32, AppError> {
                panic!("bad handler")
            });
        let recovered = Promise::<i32, AppError>::reject(AppError::Code(3)).catch(
            |err: AppError| match err {
                AppError::Code(code) => Ok(code),
                other => Err(other),
            },
        );
        run_microtasks();
        assert_eq!(
            panicked.error(),
            Some(AppError::Lib(Error::Panicked("bad handler".into())))
        );
        assert_eq!(recovered.result(), Some(3));
        let _ = p.catch(|_: AppError| Ok(0));
        let _ = panicked.catch(|_: AppError| Ok(0));
    }

    #[test]
    fn dropping_unhandled_rejection_warns() {
        let warnings = Arc::new(AtomicUsize::new(0));
        tracing::subscriber::with_default(WarnCounter(warnings.clone()), || {
            drop(P::<i32>::reject(Error::rejected("nobody listens")));
            assert_eq!(warnings.load(Ordering::SeqCst), 1);

            let handled = P::<i32>::reject(Error::rejected("caught"));
            let recovered = handled.catch(|_: Error| Ok(0));
            run_microtasks();
            drop(handled);
            drop(recovered);
            assert_eq!(warnings.load(Ordering::SeqCst), 1);
        });
    }
}
