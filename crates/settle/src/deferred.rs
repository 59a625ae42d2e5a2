//! The settlement state machine.
//!
//! ```text
//!            fulfill(v)          scheduled task
//! Pending ───────────────► [claimed] ───────────► Fulfilled(v)  drain fulfill queue
//!    │
//!    └──────────────────► [claimed] ───────────► Rejected(e)   drain reject queue
//!            reject(e)
//! ```
//!
//! A completion capability only claims the value and schedules the
//! transition. The transition itself, and every handler it notifies, runs
//! later on the [`Scheduler`].

use crate::error::{ConstructionError, Rejection, SettledError};
use crate::scheduler::Scheduler;
use futures::channel::oneshot;
use smallvec::SmallVec;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

/// A subscriber for one outcome of one value.
pub(crate) type Handler<P> = Box<dyn FnOnce(P) + Send + 'static>;

/// Initializer accepted by [`DeferredValue::construct`].
pub type Initializer<T, E = Rejection> = Box<dyn FnOnce(Fulfill<T, E>, Reject<T, E>)>;

// Most values have one or two subscribers.
type Queue<P> = SmallVec<[Handler<P>; 2]>;

#[derive(Debug, Clone)]
pub(crate) enum Settlement<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settlement<T, E> {
    fn label(&self) -> &'static str {
        match self {
            Settlement::Fulfilled(_) => "fulfilled",
            Settlement::Rejected(_) => "rejected",
        }
    }
}

/// State and payload move together: the payload exists exactly when the
/// state is no longer pending.
enum Status<T, E> {
    Pending,
    Settled(Settlement<T, E>),
}

struct Inner<T: 'static, E: 'static> {
    status: Status<T, E>,
    fulfill_queue: Queue<T>,
    reject_queue: Queue<E>,
}

thread_local! {
    /// Queues released while this thread is already tearing down a chain.
    /// `None` when no teardown is running.
    static RELEASED: RefCell<Option<Vec<Box<dyn Any>>>> = const { RefCell::new(None) };
}

// Pending handlers own the capabilities of the next value in the chain, so
// dropping a long pending chain would otherwise recurse once per link.
impl<T: 'static, E: 'static> Drop for Inner<T, E> {
    fn drop(&mut self) {
        if self.fulfill_queue.is_empty() && self.reject_queue.is_empty() {
            return;
        }
        let queues = (
            mem::take(&mut self.fulfill_queue),
            mem::take(&mut self.reject_queue),
        );
        release(Box::new(queues));
    }
}

/// Drop `queues` without recursing into downstream values.
///
/// The outermost call on a thread drains the worklist. Nested calls, made
/// while that drain drops handlers, only push onto it.
fn release(queues: Box<dyn Any>) {
    let first = RELEASED.try_with(|released| {
        let mut released = released.borrow_mut();
        match released.as_mut() {
            Some(pending) => {
                pending.push(queues);
                None
            }
            None => {
                *released = Some(Vec::new());
                Some(queues)
            }
        }
    });

    let queues = match first {
        Ok(Some(queues)) => queues,
        // Queued for the running drain, or thread-local storage is already
        // gone and the queues were dropped in place with the closure.
        Ok(None) | Err(_) => return,
    };

    let _draining = Draining;
    drop(queues);
    while let Ok(Some(queues)) =
        RELEASED.try_with(|released| released.borrow_mut().as_mut().and_then(Vec::pop))
    {
        drop(queues);
    }
}

/// Ends the drain on this thread, also when a handler's destructor panics.
struct Draining;

impl Drop for Draining {
    fn drop(&mut self) {
        let rest = RELEASED
            .try_with(|released| released.borrow_mut().take())
            .ok()
            .flatten();
        drop(rest);
    }
}

pub(crate) struct Shared<T: 'static, E: 'static> {
    id: Uuid,
    scheduler: Arc<dyn Scheduler>,
    /// Set by the first completion call across both capabilities.
    claimed: AtomicBool,
    inner: Mutex<Inner<T, E>>,
}

impl<T, E> Shared<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        // User code never runs under this lock, so a poisoned guard still
        // holds consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(self: &Arc<Self>, settlement: Settlement<T, E>) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            debug!(
                deferred = %self.id,
                outcome = settlement.label(),
                "ignoring repeated completion"
            );
            return;
        }

        trace!(deferred = %self.id, outcome = settlement.label(), "settlement scheduled");
        let shared = Arc::clone(self);
        self.scheduler
            .schedule(Box::new(move || shared.settle(settlement)));
    }

    /// Transition and drain. Runs on the scheduler.
    fn settle(&self, settlement: Settlement<T, E>) {
        let mut inner = self.lock();
        if !matches!(inner.status, Status::Pending) {
            return;
        }

        inner.status = Status::Settled(settlement.clone());
        let fulfill_queue = mem::take(&mut inner.fulfill_queue);
        let reject_queue = mem::take(&mut inner.reject_queue);
        drop(inner);

        match settlement {
            Settlement::Fulfilled(value) => {
                trace!(deferred = %self.id, handlers = fulfill_queue.len(), "fulfilled");
                drop(reject_queue);
                for handler in fulfill_queue {
                    handler(value.clone());
                }
            }
            Settlement::Rejected(error) => {
                if reject_queue.is_empty() {
                    trace!(deferred = %self.id, "rejected with no subscribers");
                } else {
                    trace!(deferred = %self.id, handlers = reject_queue.len(), "rejected");
                }
                drop(fulfill_queue);
                for handler in reject_queue {
                    handler(error.clone());
                }
            }
        }
    }
}

/// A value or error that is not available yet and settles exactly once.
///
/// Cloning produces another handle to the same value.
pub struct DeferredValue<T: 'static, E: 'static = Rejection> {
    pub(crate) shared: Arc<Shared<T, E>>,
}

impl<T: 'static, E: 'static> Clone for DeferredValue<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static, E: 'static> fmt::Debug for DeferredValue<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredValue")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl<T, E> DeferredValue<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a value and run `initializer` before returning.
    ///
    /// The initializer receives the two completion capabilities of the new
    /// value and typically hands them to some asynchronous operation.
    ///
    /// # Panics
    ///
    /// A panic inside `initializer` propagates to the caller. The value is
    /// not rejected on the initializer's behalf.
    pub fn new<F>(scheduler: Arc<dyn Scheduler>, initializer: F) -> Self
    where
        F: FnOnce(Fulfill<T, E>, Reject<T, E>),
    {
        let value = Self::pending(scheduler);
        let (fulfill, reject) = value.capabilities();
        initializer(fulfill, reject);
        value
    }

    /// Like [`new`](Self::new), for an initializer that may be absent.
    ///
    /// Fails with [`ConstructionError::NotInvokable`] before anything is
    /// scheduled when no initializer is given.
    pub fn construct(
        scheduler: Arc<dyn Scheduler>,
        initializer: Option<Initializer<T, E>>,
    ) -> Result<Self, ConstructionError> {
        let initializer = initializer.ok_or(ConstructionError::NotInvokable)?;
        Ok(Self::new(scheduler, initializer))
    }

    /// A value that fulfills with `value` once the scheduler runs.
    pub fn fulfilled(scheduler: Arc<dyn Scheduler>, value: T) -> Self {
        Self::new(scheduler, move |fulfill, _| fulfill.complete(value))
    }

    /// A value that rejects with `error` once the scheduler runs.
    pub fn rejected(scheduler: Arc<dyn Scheduler>, error: E) -> Self {
        Self::new(scheduler, move |_, reject| reject.complete(error))
    }

    pub(crate) fn pending(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                scheduler,
                claimed: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    status: Status::Pending,
                    fulfill_queue: SmallVec::new(),
                    reject_queue: SmallVec::new(),
                }),
            }),
        }
    }

    pub(crate) fn capabilities(&self) -> (Fulfill<T, E>, Reject<T, E>) {
        (
            Fulfill {
                shared: Arc::clone(&self.shared),
            },
            Reject {
                shared: Arc::clone(&self.shared),
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub(crate) fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::clone(&self.shared.scheduler)
    }

    /// Attach one handler per outcome.
    ///
    /// While pending, the handlers join the queues and run when settlement
    /// drains them. Once settled, the matching handler is scheduled right
    /// away, so late subscribers are still notified (and still never inline).
    pub(crate) fn register(&self, on_fulfilled: Handler<T>, on_rejected: Handler<E>) {
        let mut inner = self.shared.lock();
        let settled = match &inner.status {
            Status::Pending => None,
            Status::Settled(settlement) => Some(settlement.clone()),
        };

        match settled {
            None => {
                inner.fulfill_queue.push(on_fulfilled);
                inner.reject_queue.push(on_rejected);
            }
            Some(Settlement::Fulfilled(value)) => {
                drop(inner);
                trace!(deferred = %self.shared.id, "late subscriber, value already fulfilled");
                self.shared
                    .scheduler
                    .schedule(Box::new(move || on_fulfilled(value)));
            }
            Some(Settlement::Rejected(error)) => {
                drop(inner);
                trace!(deferred = %self.shared.id, "late subscriber, value already rejected");
                self.shared
                    .scheduler
                    .schedule(Box::new(move || on_rejected(error)));
            }
        }
    }

    /// Wait for settlement from async code.
    ///
    /// Resolves to [`SettledError::Abandoned`] if the value can no longer
    /// settle: every handle and capability was dropped, or the scheduler
    /// discarded the settlement task.
    pub fn settled(&self) -> impl Future<Output = Result<T, SettledError<E>>> + Send + 'static {
        let (tx, rx) = oneshot::channel::<Result<T, E>>();
        let on_fulfilled = Arc::new(Mutex::new(Some(tx)));
        let on_rejected = Arc::clone(&on_fulfilled);

        self.register(
            Box::new(move |value: T| send_once(&on_fulfilled, Ok(value))),
            Box::new(move |error: E| send_once(&on_rejected, Err(error))),
        );

        async move {
            match rx.await {
                Ok(result) => result.map_err(SettledError::Rejected),
                Err(oneshot::Canceled) => Err(SettledError::Abandoned),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<Settlement<T, E>> {
        match &self.shared.lock().status {
            Status::Pending => None,
            Status::Settled(settlement) => Some(settlement.clone()),
        }
    }
}

fn send_once<P>(slot: &Mutex<Option<oneshot::Sender<P>>>, payload: P) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        // The receiver may have been dropped; nobody is waiting then.
        let _ = sender.send(payload);
    }
}

/// Completion capability that fulfills its value.
///
/// Shares a single "first call wins" flag with the matching [`Reject`]:
/// only the first call across both has any effect.
pub struct Fulfill<T: 'static, E: 'static = Rejection> {
    shared: Arc<Shared<T, E>>,
}

/// Completion capability that rejects its value.
pub struct Reject<T: 'static, E: 'static = Rejection> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Fulfill<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn complete(&self, value: T) {
        self.shared.complete(Settlement::Fulfilled(value));
    }

    pub(crate) fn id(&self) -> Uuid {
        self.shared.id
    }
}

impl<T, E> Reject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn complete(&self, error: E) {
        self.shared.complete(Settlement::Rejected(error));
    }
}

impl<T: 'static, E: 'static> Clone for Fulfill<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static, E: 'static> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static, E: 'static> fmt::Debug for Fulfill<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fulfill").field(&self.shared.id).finish()
    }
}

impl<T: 'static, E: 'static> fmt::Debug for Reject<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reject").field(&self.shared.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskQueue;

    type Slot<T> = Arc<Mutex<Option<(Fulfill<T, String>, Reject<T, String>)>>>;

    fn pending_with_capabilities(queue: &Arc<TaskQueue>) -> (DeferredValue<i32, String>, Slot<i32>) {
        let slot: Slot<i32> = Arc::new(Mutex::new(None));
        let keep = slot.clone();
        let value = DeferredValue::new(queue.clone(), move |fulfill, reject| {
            *keep.lock().unwrap() = Some((fulfill, reject));
        });
        (value, slot)
    }

    fn caps(slot: &Slot<i32>) -> (Fulfill<i32, String>, Reject<i32, String>) {
        slot.lock().unwrap().clone().unwrap()
    }

    fn is_fulfilled_with(value: &DeferredValue<i32, String>, expected: i32) -> bool {
        matches!(value.peek(), Some(Settlement::Fulfilled(v)) if v == expected)
    }

    #[test]
    fn test_initializer_runs_before_new_returns() {
        let queue = Arc::new(TaskQueue::new());
        let mut ran = false;

        let _value: DeferredValue<i32, String> = DeferredValue::new(queue.clone(), |_, _| {
            ran = true;
        });

        assert!(ran);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_completion_only_schedules() {
        let queue = Arc::new(TaskQueue::new());
        let (value, slot) = pending_with_capabilities(&queue);
        let (fulfill, _) = caps(&slot);

        fulfill.complete(1);

        assert!(value.peek().is_none());
        assert_eq!(queue.len(), 1);

        queue.run_until_idle();
        assert!(is_fulfilled_with(&value, 1));
    }

    #[test]
    fn test_first_completion_wins_across_capabilities() {
        let queue = Arc::new(TaskQueue::new());
        let (value, slot) = pending_with_capabilities(&queue);
        let (fulfill, reject) = caps(&slot);

        fulfill.complete(1);
        reject.complete("late".to_string());
        fulfill.complete(2);

        assert_eq!(queue.len(), 1);
        queue.run_until_idle();
        assert!(is_fulfilled_with(&value, 1));
    }

    #[test]
    fn test_redundant_settle_task_is_a_no_op() {
        let queue = Arc::new(TaskQueue::new());
        let (value, _slot) = pending_with_capabilities(&queue);

        value.shared.settle(Settlement::Fulfilled(5));
        value.shared.settle(Settlement::Rejected("ignored".to_string()));

        assert!(is_fulfilled_with(&value, 5));
    }

    #[test]
    fn test_settlement_drains_matching_queue_in_order() {
        let queue = Arc::new(TaskQueue::new());
        let (value, slot) = pending_with_capabilities(&queue);
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["h1", "h2", "h3"] {
            let on_value = log.clone();
            let on_error = log.clone();
            value.register(
                Box::new(move |v: i32| on_value.lock().unwrap().push(format!("{name}:{v}"))),
                Box::new(move |e: String| on_error.lock().unwrap().push(format!("{name}!{e}"))),
            );
        }

        caps(&slot).0.complete(9);
        queue.run_until_idle();

        assert_eq!(*log.lock().unwrap(), vec!["h1:9", "h2:9", "h3:9"]);
        let inner = value.shared.lock();
        assert!(inner.fulfill_queue.is_empty());
        assert!(inner.reject_queue.is_empty());
    }

    #[test]
    fn test_rejection_drains_reject_queue_only() {
        let queue = Arc::new(TaskQueue::new());
        let (value, slot) = pending_with_capabilities(&queue);
        let log = Arc::new(Mutex::new(Vec::new()));

        let on_value = log.clone();
        let on_error = log.clone();
        value.register(
            Box::new(move |v: i32| on_value.lock().unwrap().push(format!("value {v}"))),
            Box::new(move |e: String| on_error.lock().unwrap().push(format!("error {e}"))),
        );

        caps(&slot).1.complete("broken".to_string());
        queue.run_until_idle();

        assert_eq!(*log.lock().unwrap(), vec!["error broken"]);
    }

    #[test]
    fn test_late_registration_is_scheduled_not_inline() {
        let queue = Arc::new(TaskQueue::new());
        let value: DeferredValue<i32, String> = DeferredValue::fulfilled(queue.clone(), 4);
        queue.run_until_idle();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        value.register(
            Box::new(move |v: i32| *sink.lock().unwrap() = Some(v)),
            Box::new(|_: String| unreachable!("value fulfilled")),
        );

        assert!(seen.lock().unwrap().is_none());
        assert_eq!(queue.run_until_idle(), 1);
        assert_eq!(*seen.lock().unwrap(), Some(4));
    }

    #[test]
    fn test_construct_without_initializer_fails_before_scheduling() {
        let queue = Arc::new(TaskQueue::new());

        let result = DeferredValue::<i32, String>::construct(queue.clone(), None);

        assert_eq!(result.unwrap_err(), ConstructionError::NotInvokable);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_construct_with_initializer() {
        let queue = Arc::new(TaskQueue::new());
        let initializer: Initializer<i32, String> = Box::new(|fulfill, _| fulfill.complete(11));

        let value = DeferredValue::construct(queue.clone(), Some(initializer)).unwrap();
        queue.run_until_idle();

        assert!(is_fulfilled_with(&value, 11));
    }

    #[tokio::test]
    async fn test_settled_reports_outcome() {
        let queue = Arc::new(TaskQueue::new());
        let good: DeferredValue<i32, String> = DeferredValue::fulfilled(queue.clone(), 1);
        let bad: DeferredValue<i32, String> = DeferredValue::rejected(queue.clone(), "no".into());

        let good_settled = good.settled();
        let bad_settled = bad.settled();
        queue.run_until_idle();

        assert_eq!(good_settled.await, Ok(1));
        assert_eq!(bad_settled.await, Err(SettledError::Rejected("no".to_string())));
    }

    #[tokio::test]
    async fn test_settled_abandoned_when_value_dropped() {
        let queue = Arc::new(TaskQueue::new());
        let value: DeferredValue<i32, String> = DeferredValue::new(queue.clone(), |_, _| {});

        let settled = value.settled();
        drop(value);

        assert_eq!(settled.await, Err(SettledError::Abandoned));
    }
}
