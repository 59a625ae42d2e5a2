//! Chaining: `then` and its shorthands.
//!
//! Every chain call builds a downstream [`DeferredValue`] and registers one
//! wrapped handler per outcome on the source. A wrapped handler either
//! passes the payload through unchanged (no callback for that outcome) or
//! runs the callback and settles the downstream value from its result:
//!
//! | callback result          | downstream value              |
//! |--------------------------|-------------------------------|
//! | `Ok(Resolution::Value)`  | fulfilled with the value      |
//! | `Ok(Resolution::Adopt)`  | settles as the thenable does  |
//! | `Err(e)`                 | rejected with `e`             |
//! | panic                    | rejected with [`HandlerError`]|

use crate::deferred::{DeferredValue, Fulfill, Handler, Reject};
use crate::error::HandlerError;
use crate::thenable::{resolve_into, Resolution};
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

/// Result type returned by chain callbacks.
pub type CallbackResult<U, E> = Result<Resolution<U, E>, E>;

impl<T, E> DeferredValue<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Chain both outcomes.
    ///
    /// Returns a new value that settles from whichever callback runs.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> DeferredValue<U, E>
    where
        U: Clone + Send + 'static,
        E: From<HandlerError>,
        F: FnOnce(T) -> CallbackResult<U, E> + Send + 'static,
        R: FnOnce(E) -> CallbackResult<U, E> + Send + 'static,
    {
        self.chain(move |fulfill, reject| {
            (
                adapt(on_fulfilled, fulfill.clone(), reject.clone()),
                adapt(on_rejected, fulfill, reject),
            )
        })
    }

    /// Chain the fulfilled outcome. Rejections pass through unchanged.
    pub fn on_fulfilled<U, F>(&self, on_fulfilled: F) -> DeferredValue<U, E>
    where
        U: Clone + Send + 'static,
        E: From<HandlerError>,
        F: FnOnce(T) -> CallbackResult<U, E> + Send + 'static,
    {
        self.chain(move |fulfill, reject| {
            (
                adapt(on_fulfilled, fulfill, reject.clone()),
                pass_rejected(reject),
            )
        })
    }

    /// Chain the rejected outcome. Values pass through unchanged.
    ///
    /// A callback that returns `Ok` handles the rejection; the chain carries
    /// on fulfilled from there.
    pub fn on_rejected<R>(&self, on_rejected: R) -> DeferredValue<T, E>
    where
        E: From<HandlerError>,
        R: FnOnce(E) -> CallbackResult<T, E> + Send + 'static,
    {
        self.chain(move |fulfill, reject| {
            (
                pass_fulfilled(fulfill.clone()),
                adapt(on_rejected, fulfill, reject),
            )
        })
    }

    /// Chain with no callbacks: the new value mirrors this one.
    pub fn forward(&self) -> DeferredValue<T, E> {
        self.chain(|fulfill, reject| (pass_fulfilled(fulfill), pass_rejected(reject)))
    }

    /// Transform the fulfilled value.
    pub fn map<U, F>(&self, f: F) -> DeferredValue<U, E>
    where
        U: Clone + Send + 'static,
        E: From<HandlerError>,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.on_fulfilled(move |value| Ok(Resolution::Value(f(value))))
    }

    /// Transform the fulfilled value with a fallible callback.
    pub fn try_map<U, F>(&self, f: F) -> DeferredValue<U, E>
    where
        U: Clone + Send + 'static,
        E: From<HandlerError>,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        self.on_fulfilled(move |value| f(value).map(Resolution::Value))
    }

    /// Continue with another deferred value and adopt its outcome.
    pub fn and_then<U, F>(&self, f: F) -> DeferredValue<U, E>
    where
        U: Clone + Send + 'static,
        E: From<HandlerError>,
        F: FnOnce(T) -> DeferredValue<U, E> + Send + 'static,
    {
        self.on_fulfilled(move |value| Ok(Resolution::adopt(f(value))))
    }

    fn chain<U, B>(&self, build: B) -> DeferredValue<U, E>
    where
        U: Clone + Send + 'static,
        B: FnOnce(Fulfill<U, E>, Reject<U, E>) -> (Handler<T>, Handler<E>),
    {
        DeferredValue::new(self.scheduler(), |fulfill, reject| {
            let (on_fulfilled, on_rejected) = build(fulfill, reject);
            self.register(on_fulfilled, on_rejected);
        })
    }
}

fn adapt<P, U, E, C>(callback: C, fulfill: Fulfill<U, E>, reject: Reject<U, E>) -> Handler<P>
where
    P: Send + 'static,
    U: Clone + Send + 'static,
    E: Clone + Send + From<HandlerError> + 'static,
    C: FnOnce(P) -> CallbackResult<U, E> + Send + 'static,
{
    Box::new(move |payload: P| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match callback(payload) {
            Ok(resolution) => resolve_into(resolution, fulfill.clone(), reject.clone()),
            Err(error) => reject.complete(error),
        }));

        if let Err(panic) = outcome {
            let error = HandlerError::from_panic(panic);
            warn!(deferred = %fulfill.id(), error = %error, "chain callback panicked");
            reject.complete(E::from(error));
        }
    })
}

fn pass_fulfilled<T, E>(fulfill: Fulfill<T, E>) -> Handler<T>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    Box::new(move |value: T| fulfill.complete(value))
}

fn pass_rejected<U, E>(reject: Reject<U, E>) -> Handler<E>
where
    U: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    Box::new(move |error: E| reject.complete(error))
}
