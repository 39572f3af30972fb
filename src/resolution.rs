use crate::Promise;

/// What a promise can be resolved with: a plain value, or another promise
/// whose outcome should be adopted.
///
/// Every API that accepts "a value or a promise of that value" takes
/// `impl Into<Resolution<T, E>>`, so both `42` and `Promise::resolve(42)`
/// can be passed directly.
pub enum Resolution<T, E> {
    Value(T),
    Promise(Promise<T, E>),
}

impl<T, E> From<T> for Resolution<T, E> {
    fn from(value: T) -> Self {
        Resolution::Value(value)
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: std::fmt::Debug, E> std::fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(_) => f.write_str("Promise(..)"),
        }
    }
}

/// The final outcome of one input of [`Promise::all_settled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settled<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Settled::Fulfilled(value) => Ok(value),
            Settled::Rejected(err) => Err(err),
        }
    }
}
