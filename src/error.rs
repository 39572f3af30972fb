use std::any::Any;

/// Reasons a promise can be rejected by the library itself.
///
/// The error type parameter of [`Promise`](crate::Promise) defaults to this
/// enum. Custom error types only need `From<Error>` so the library can report
/// cycles and panics through them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("chaining cycle detected for promise")]
    ChainingCycle,
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Rejected(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("non-string panic payload")
        };
        Error::Panicked(message)
    }
}
