//! Error types for deferred values.
//!
//! Three kinds of failure exist around a [`DeferredValue`](crate::DeferredValue):
//!
//! - [`ConstructionError`] - the initializer could not be invoked; surfaced
//!   synchronously, before anything is scheduled.
//! - [`HandlerError`] - a chain callback panicked; converted into a rejection
//!   of the downstream value.
//! - [`SettledError`] - returned by the async bridge when the value rejected
//!   or was dropped before it settled.
//!
//! A rejection that nobody observes is not an error. The payload is retained
//! by the settled value and never surfaced.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Construction of a deferred value failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConstructionError {
    /// No invokable initializer was supplied.
    #[error("deferred value initializer is not invokable")]
    NotInvokable,
}

/// A chain callback panicked while handling a settled payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler panicked: {message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build from the payload returned by `std::panic::catch_unwind`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why awaiting [`DeferredValue::settled`](crate::DeferredValue::settled) did
/// not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettledError<E> {
    /// The value settled as rejected.
    #[error("deferred value rejected: {0}")]
    Rejected(E),

    /// Every handle to the value was dropped (or its scheduler stopped)
    /// before it settled.
    #[error("deferred value was dropped before it settled")]
    Abandoned,
}

impl<E> SettledError<E> {
    /// The rejection payload, if the value rejected.
    pub fn rejection(&self) -> Option<&E> {
        match self {
            SettledError::Rejected(error) => Some(error),
            SettledError::Abandoned => None,
        }
    }
}

/// Default rejection payload.
///
/// Wraps an [`anyhow::Error`] behind an `Arc` so one rejection can be handed
/// to every subscriber of a settled value.
#[derive(Clone, Error)]
#[error("{inner}")]
pub struct Rejection {
    inner: Arc<anyhow::Error>,
}

impl Rejection {
    pub fn new<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self {
            inner: Arc::new(error.into()),
        }
    }

    /// Create a rejection from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(anyhow::Error::msg(message)),
        }
    }

    /// Attempt to view the underlying error as a concrete type.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<T>()
    }

    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.inner
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejection").field(&self.inner).finish()
    }
}

impl From<anyhow::Error> for Rejection {
    fn from(error: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }
}

impl From<HandlerError> for Rejection {
    fn from(error: HandlerError) -> Self {
        Self::new(error)
    }
}
