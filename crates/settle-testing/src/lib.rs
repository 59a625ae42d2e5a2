//! Testing utilities for settle deferred values.
//!
//! - [`Capture`] records how a value settled, without needing an executor.
//! - [`CallLog`] records the order in which callbacks ran.
//! - [`spawn_loop`] starts a [`ChannelScheduler`] loop on the current tokio
//!   runtime.

use settle_core::{
    ChannelScheduler, DeferredValue, HandlerError, Resolution, Scheduler, SchedulerBuilder,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Slot filled when the observed value settles.
pub struct Capture<T, E> {
    slot: Arc<Mutex<Option<Result<T, E>>>>,
}

impl<T, E> Clone for Capture<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T, E> Capture<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<HandlerError> + 'static,
{
    /// Subscribe to `value`. The capture fills once the scheduler delivers
    /// the settlement.
    pub fn attach(value: &DeferredValue<T, E>) -> Self {
        let slot = Arc::new(Mutex::new(None));
        let on_value = Arc::clone(&slot);
        let on_error = Arc::clone(&slot);

        let _observer: DeferredValue<(), E> = value.then(
            move |v| {
                *lock(&on_value) = Some(Ok(v));
                Ok(Resolution::Value(()))
            },
            move |e| {
                *lock(&on_error) = Some(Err(e));
                Ok(Resolution::Value(()))
            },
        );

        Self { slot }
    }

    pub fn get(&self) -> Option<Result<T, E>> {
        lock(&self.slot).clone()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_none()
    }

    /// The fulfilled value, if the observed value fulfilled.
    pub fn fulfilled(&self) -> Option<T> {
        self.get().and_then(Result::ok)
    }

    /// The rejection payload, if the observed value rejected.
    pub fn rejected(&self) -> Option<E> {
        self.get().and_then(Result::err)
    }
}

/// Ordered record of labelled events.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

/// Start a named scheduler loop on the current tokio runtime.
///
/// The join handle resolves to the number of tasks run, once every
/// scheduler handle (including those held by pending values) is dropped.
pub fn spawn_loop(name: &str) -> (Arc<dyn Scheduler>, JoinHandle<u64>) {
    let (scheduler, event_loop): (ChannelScheduler, _) = SchedulerBuilder::new().name(name).build();
    let handle = tokio::spawn(event_loop.run());
    (Arc::new(scheduler), handle)
}
