//! Single-threaded promises for rust.
//!
//! A [`Promise`] is a value that is not known yet. Continuations attached to
//! it run on the thread's [`microtask`] queue after it settles, always in the
//! order they were attached and never inline with the call that attached
//! them. Promises resolved with other promises adopt their outcome, and
//! [`Promise::all`], [`Promise::race`] and [`Promise::all_settled`] combine
//! several promises into one.
//!
//! Nothing runs by itself: the host drains the queue with
//! [`microtask::run_microtasks`], or awaits a promise, which drains the queue
//! before every poll.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{microtask::run_microtasks, Error, Promise};
//!
//! let (pending, resolve, _reject): (Promise<i32>, _, _) = Promise::with_resolvers();
//! let checked: Promise<i32> =
//!     pending.then(|v: i32| if v > 0 { Ok(v) } else { Err(Error::rejected("negative")) });
//! let recovered = checked.catch(|_err| Ok::<i32, Error>(0));
//!
//! resolve.resolve(-5);
//! run_microtasks();
//! assert_eq!(recovered.result(), Some(0));
//! ```
//!
//! Awaiting from an executor:
//!
//! ```
//! use futures::executor::block_on;
//! use promise_chain::Promise;
//!
//! let p: Promise<&str> = Promise::resolve("🍓");
//! assert_eq!(block_on(p), Ok("🍓"));
//! ```
mod combinators;
mod error;
pub mod microtask;
mod promise;
mod resolution;

pub use error::{Error, Result};
pub use promise::{Promise, Reject, Resolve, State};
pub use resolution::{Resolution, Settled};
