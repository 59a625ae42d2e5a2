//! Thenables and flattening.
//!
//! A chain callback returns a [`Resolution`]: either a plain value, or a
//! [`Thenable`] whose eventual outcome the downstream value adopts. Adoption
//! goes one layer at a time, because a thenable resolves through a
//! [`Resolver`] that itself accepts another `Resolution`.

use crate::deferred::{DeferredValue, Fulfill, Reject};
use crate::error::Rejection;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Anything exposing a subscribe operation that eventually resolves or
/// rejects at most once.
pub trait Thenable<T: 'static, E: 'static = Rejection>: Send + 'static {
    /// Hand the resolver to the thenable. It may be called from any thread
    /// at any later point.
    fn subscribe(self: Box<Self>, resolver: Resolver<T, E>);
}

/// What a chain callback produces.
pub enum Resolution<T: 'static, E: 'static = Rejection> {
    /// Fulfill the downstream value with this.
    Value(T),
    /// Settle the downstream value the way this thenable settles.
    Adopt(Box<dyn Thenable<T, E>>),
}

impl<T: 'static, E: 'static> Resolution<T, E> {
    pub fn adopt<Th>(thenable: Th) -> Self
    where
        Th: Thenable<T, E>,
    {
        Resolution::Adopt(Box::new(thenable))
    }
}

impl<T, E> From<DeferredValue<T, E>> for Resolution<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn from(value: DeferredValue<T, E>) -> Self {
        Resolution::adopt(value)
    }
}

impl<T: fmt::Debug + 'static, E: 'static> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Adopt(_) => f.write_str("Adopt(..)"),
        }
    }
}

/// Settle `fulfill`/`reject` from a resolution, adopting thenables.
pub(crate) fn resolve_into<T, E>(
    resolution: Resolution<T, E>,
    fulfill: Fulfill<T, E>,
    reject: Reject<T, E>,
) where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    match resolution {
        Resolution::Value(value) => fulfill.complete(value),
        Resolution::Adopt(thenable) => thenable.subscribe(Resolver::new(fulfill, reject)),
    }
}

/// Capability handed to a [`Thenable`].
///
/// Clones share one flag; only the first `resolve`, `fulfill` or `reject`
/// across all of them counts. Once a resolver adopts another thenable, later
/// calls cannot override that adoption.
pub struct Resolver<T: 'static, E: 'static = Rejection> {
    fulfill: Fulfill<T, E>,
    reject: Reject<T, E>,
    used: Arc<AtomicBool>,
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub(crate) fn new(fulfill: Fulfill<T, E>, reject: Reject<T, E>) -> Self {
        Self {
            fulfill,
            reject,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resolve with a value or another thenable.
    pub fn resolve(&self, resolution: Resolution<T, E>) {
        if self.claim() {
            resolve_into(resolution, self.fulfill.clone(), self.reject.clone());
        }
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value));
    }

    pub fn reject(&self, error: E) {
        if self.claim() {
            self.reject.complete(error);
        }
    }

    fn claim(&self) -> bool {
        let first = !self.used.swap(true, Ordering::AcqRel);
        if !first {
            debug!(deferred = %self.fulfill.id(), "ignoring repeated thenable resolution");
        }
        first
    }
}

impl<T: 'static, E: 'static> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            fulfill: self.fulfill.clone(),
            reject: self.reject.clone(),
            used: Arc::clone(&self.used),
        }
    }
}

impl<T: 'static, E: 'static> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("fulfill", &self.fulfill)
            .field("used", &self.used.load(Ordering::Acquire))
            .finish()
    }
}

impl<T, E> Thenable<T, E> for DeferredValue<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn subscribe(self: Box<Self>, resolver: Resolver<T, E>) {
        let on_rejected = resolver.clone();
        self.register(
            Box::new(move |value: T| resolver.fulfill(value)),
            Box::new(move |error: E| on_rejected.reject(error)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Settlement;
    use crate::scheduler::TaskQueue;

    fn target(queue: &Arc<TaskQueue>) -> (DeferredValue<i32, String>, Resolver<i32, String>) {
        let value = DeferredValue::pending(queue.clone());
        let (fulfill, reject) = value.capabilities();
        (value, Resolver::new(fulfill, reject))
    }

    #[test]
    fn test_resolver_counts_first_call_only() {
        let queue = Arc::new(TaskQueue::new());
        let (value, resolver) = target(&queue);

        resolver.clone().reject("first".to_string());
        resolver.fulfill(2);
        queue.run_until_idle();

        assert!(matches!(value.peek(), Some(Settlement::Rejected(e)) if e == "first"));
    }

    #[test]
    fn test_adoption_cannot_be_overridden() {
        let queue = Arc::new(TaskQueue::new());
        let (value, resolver) = target(&queue);
        let inner: DeferredValue<i32, String> = DeferredValue::fulfilled(queue.clone(), 7);

        resolver.resolve(Resolution::from(inner));
        resolver.fulfill(99);
        queue.run_until_idle();

        assert!(matches!(value.peek(), Some(Settlement::Fulfilled(7))));
    }

    #[test]
    fn test_adopting_a_rejected_value_rejects() {
        let queue = Arc::new(TaskQueue::new());
        let (value, resolver) = target(&queue);
        let inner: DeferredValue<i32, String> =
            DeferredValue::rejected(queue.clone(), "inner failed".to_string());

        resolver.resolve(Resolution::adopt(inner));
        queue.run_until_idle();

        assert!(matches!(value.peek(), Some(Settlement::Rejected(e)) if e == "inner failed"));
    }

    #[test]
    fn test_resolution_debug() {
        let queue = Arc::new(TaskQueue::new());
        let value: Resolution<i32, String> = Resolution::Value(1);
        let adopt: Resolution<i32, String> =
            DeferredValue::<i32, String>::fulfilled(queue.clone(), 1).into();

        assert_eq!(format!("{value:?}"), "Value(1)");
        assert_eq!(format!("{adopt:?}"), "Adopt(..)");
    }
}
