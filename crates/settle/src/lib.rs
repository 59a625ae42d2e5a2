//! # Settle
//!
//! A deferred value that settles exactly once, notifies later, and flattens
//! nested deferred values.
//!
//! ## Core Concepts
//!
//! - [`DeferredValue`] = a value or error that is not available yet
//! - [`Fulfill`] / [`Reject`] = the two completion capabilities handed to the
//!   initializer; only the first call across both has any effect
//! - [`Scheduler`] = where notification work runs, always after the
//!   completing caller's synchronous code has finished
//! - [`Thenable`] = anything a chain callback can return to have the next
//!   value adopt its outcome
//!
//! ## Architecture
//!
//! ```text
//! external operation (timer, file, socket, thread)
//!     │
//!     ▼ fulfill.complete(v) / reject.complete(e)
//! claim (first call wins) ──► Scheduler.schedule(task)
//!                                   │
//!                                   ▼ later, FIFO
//!                     Pending ─► Fulfilled | Rejected
//!                                   │
//!                                   ▼ drain matching queue in order
//!                     wrapped handler (from then / map / on_rejected ...)
//!                                   │
//!            ┌──────────────────────┼──────────────────────┐
//!            ▼                      ▼                      ▼
//!      pass through          callback -> value      callback -> thenable
//!            │                      │                      │
//!            └──────────► next.fulfill / next.reject ◄─────┘ (adopt)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single settlement** - `Pending -> Fulfilled` or `Pending -> Rejected`,
//!    once, never reversed
//! 2. **Deferred delivery** - no handler runs inside the call that completed
//!    the value
//! 3. **FIFO fan-out** - handlers registered on one value run in registration
//!    order
//! 4. **Late subscribers still fire** - chaining onto a settled value
//!    schedules the matching handler right away
//! 5. **Failures reject** - a callback returning `Err` or panicking rejects the
//!    next value; rejections pass through links that do not handle them
//!
//! ## Example
//!
//! ```ignore
//! use settle_core::{ChannelScheduler, DeferredValue, Rejection};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let (scheduler, event_loop) = ChannelScheduler::new();
//! tokio::spawn(event_loop.run());
//!
//! let letters = DeferredValue::<Vec<char>>::new(Arc::new(scheduler), |fulfill, _reject| {
//!     tokio::spawn(async move {
//!         tokio::time::sleep(Duration::from_millis(10)).await;
//!         fulfill.complete(vec!['a', 'b']);
//!     });
//! });
//!
//! let word = letters
//!     .map(|mut letters| {
//!         letters.reverse();
//!         letters
//!     })
//!     .map(|letters| letters.into_iter().collect::<String>());
//!
//! assert_eq!(word.settled().await?, "ba");
//! ```
//!
//! ## What This Is Not
//!
//! No cancellation, no combinators (race/all/any), no unhandled-rejection
//! reporting, no synchronous state inspection, no streams. A rejection that
//! nobody handles is kept by the settled value and never surfaced.
//!
//! The initializer is not guarded: if it panics, the panic reaches the caller
//! of [`DeferredValue::new`] and no value is returned. Capabilities the
//! initializer already handed out can still complete, but nothing observes it.

// Core modules
mod chain;
mod channel;
mod deferred;
mod error;
mod scheduler;
mod thenable;

// Re-export the deferred value and its capabilities
pub use deferred::{DeferredValue, Fulfill, Initializer, Reject};

// Re-export chaining types
pub use chain::CallbackResult;
pub use thenable::{Resolution, Resolver, Thenable};

// Re-export scheduler types
pub use channel::{ChannelScheduler, SchedulerBuilder, SchedulerLoop};
pub use scheduler::{Scheduler, Task, TaskQueue};

// Re-export error types
pub use error::{ConstructionError, HandlerError, Rejection, SettledError};
