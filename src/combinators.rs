//! Promises derived from a collection of inputs.
//!
//! Inputs are anything convertible into a [`Resolution`]: plain values are
//! treated as already fulfilled promises. The derived promise only keeps the
//! registration closures it placed on each input.
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{Error, Promise, Resolution, Settled};

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Fulfills with every input's value, in input order, once all inputs
    /// fulfilled. Rejects with the first rejection observed.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{microtask::run_microtasks, Promise};
    ///
    /// let all: Promise<Vec<i32>> = Promise::all(vec![1, 2, 3]);
    /// run_microtasks();
    /// assert_eq!(all.result(), Some(vec![1, 2, 3]));
    /// ```
    pub fn all<I, R>(inputs: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = R>,
        R: Into<Resolution<T, E>>,
    {
        let inputs: Vec<Self> = inputs.into_iter().map(Self::resolve).collect();
        let (all, resolve, reject) = Promise::<Vec<T>, E>::with_resolvers();
        if inputs.is_empty() {
            resolve.resolve(Vec::new());
            return all;
        }

        let slots = Rc::new(RefCell::new(vec![None; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));
        for (index, input) in inputs.into_iter().enumerate() {
            let slots = slots.clone();
            let remaining = remaining.clone();
            let resolve = resolve.clone();
            let reject = reject.clone();
            input.subscribe(
                move |value| {
                    slots.borrow_mut()[index] = Some(value);
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values: Vec<T> = slots.borrow_mut().drain(..).flatten().collect();
                        resolve.resolve(values);
                    }
                },
                move |err| reject.reject(err),
            );
        }
        all
    }

    /// Settles like whichever input settles first. Never settles when
    /// `inputs` is empty.
    pub fn race<I, R>(inputs: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Resolution<T, E>>,
    {
        let (race, resolve, reject) = Self::with_resolvers();
        for input in inputs {
            let resolve = resolve.clone();
            let reject = reject.clone();
            Self::resolve(input).subscribe(
                move |value| resolve.resolve(value),
                move |err| reject.reject(err),
            );
        }
        race
    }

    /// Fulfills with every input's outcome, in input order, once all inputs
    /// settled. Never rejects.
    pub fn all_settled<I, R>(inputs: I) -> Promise<Vec<Settled<T, E>>, E>
    where
        I: IntoIterator<Item = R>,
        R: Into<Resolution<T, E>>,
    {
        let inputs: Vec<Self> = inputs.into_iter().map(Self::resolve).collect();
        let (all, resolve, _) = Promise::<Vec<Settled<T, E>>, E>::with_resolvers();
        if inputs.is_empty() {
            resolve.resolve(Vec::new());
            return all;
        }

        let slots = Rc::new(RefCell::new(vec![None; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));
        for (index, input) in inputs.into_iter().enumerate() {
            let record = {
                let slots = slots.clone();
                let remaining = remaining.clone();
                let resolve = resolve.clone();
                move |outcome: Settled<T, E>| {
                    slots.borrow_mut()[index] = Some(outcome);
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let outcomes: Vec<Settled<T, E>> =
                            slots.borrow_mut().drain(..).flatten().collect();
                        resolve.resolve(outcomes);
                    }
                }
            };
            let record_err = record.clone();
            input.subscribe(
                move |value| record(Settled::Fulfilled(value)),
                move |err| record_err(Settled::Rejected(err)),
            );
        }
        all
    }
}
