//! Tokio-backed scheduler.
//!
//! [`ChannelScheduler`] handles are cheap to clone and can be used from any
//! thread. They push tasks onto an unbounded channel that a single
//! [`SchedulerLoop`] drains in receive order:
//!
//! ```text
//! Fulfill / Reject (any thread)
//!     │
//!     ▼ schedule()
//! ChannelScheduler ──► mpsc ──► SchedulerLoop::run()
//!                                   │
//!                                   └─► task()  (one at a time, FIFO)
//! ```
//!
//! The loop ends once every scheduler handle is dropped and the channel is
//! empty. Values that are still pending keep their scheduler alive.

use crate::error::HandlerError;
use crate::scheduler::{Scheduler, Task};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const DEFAULT_NAME: &str = "settle";
const DEFAULT_YIELD_EVERY: usize = 64;

/// Builder for a [`ChannelScheduler`] and its [`SchedulerLoop`].
///
/// # Example
///
/// ```ignore
/// let (scheduler, event_loop) = SchedulerBuilder::new()
///     .name("uploads")
///     .yield_every(128)
///     .build();
///
/// tokio::spawn(event_loop.run());
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    name: String,
    yield_every: usize,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            yield_every: DEFAULT_YIELD_EVERY,
        }
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label used in tracing output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Yield to the tokio runtime after this many tasks. `0` never yields.
    pub fn yield_every(mut self, tasks: usize) -> Self {
        self.yield_every = tasks;
        self
    }

    pub fn build(self) -> (ChannelScheduler, SchedulerLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(self.name);
        let scheduler = ChannelScheduler {
            tx,
            name: name.clone(),
        };
        let event_loop = SchedulerLoop {
            rx,
            name,
            yield_every: self.yield_every,
        };
        (scheduler, event_loop)
    }
}

/// Sending half: implements [`Scheduler`].
#[derive(Clone)]
pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<Task>,
    name: Arc<str>,
}

impl ChannelScheduler {
    /// Create a scheduler with default settings.
    pub fn new() -> (Self, SchedulerLoop) {
        SchedulerBuilder::new().build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop has stopped receiving tasks.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Scheduler for ChannelScheduler {
    fn schedule(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!(scheduler = %self.name, "scheduler loop stopped, dropping task");
        }
    }
}

impl std::fmt::Debug for ChannelScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelScheduler")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half: runs scheduled tasks.
pub struct SchedulerLoop {
    rx: mpsc::UnboundedReceiver<Task>,
    name: Arc<str>,
    yield_every: usize,
}

impl SchedulerLoop {
    /// Run tasks until every [`ChannelScheduler`] handle is dropped.
    ///
    /// Returns the number of tasks executed. A panicking task is logged and
    /// does not stop the loop.
    pub async fn run(mut self) -> u64 {
        debug!(scheduler = %self.name, "scheduler loop started");

        let mut executed: u64 = 0;
        while let Some(task) = self.rx.recv().await {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                let error = HandlerError::from_panic(payload);
                error!(scheduler = %self.name, error = %error, "scheduled task panicked");
            }
            executed += 1;

            if self.yield_every > 0 && executed % self.yield_every as u64 == 0 {
                tokio::task::yield_now().await;
            }
        }

        debug!(scheduler = %self.name, executed, "scheduler loop stopped");
        executed
    }

    /// Stop accepting tasks. Already queued tasks still run.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
