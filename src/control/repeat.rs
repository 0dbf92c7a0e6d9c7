//! Bounded repeats of one command.
//!
//! A [`LoopScheduler`] writes its command, waits for the response, evaluates
//! it, and repeats until the planned number of iterations has been counted
//! or the run is aborted.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──► Running ──exhausted──► Completed
//!                    │                       │
//!                    └──abort / closed──► Aborted
//!                                            │
//!        Idle ◄─────────────reset────────────┘
//! ```
//!
//! # Abort Semantics
//!
//! An abort is observed at the start of each iteration, while waiting for a
//! response, and during pacing. A response delivered before the abort is
//! still evaluated; a response arriving after it is ignored. No command is
//! written once the abort has been observed.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{RunId, SubscriptionId};
use crate::protocol::{Event, Message, ReturnKind};
use crate::transport::Connection;
use crate::transport::options::millis;

use super::Criteria;
use super::criteria::strict_statuses;

// ============================================================================
// Types
// ============================================================================

/// Loop observer callback type.
pub type LoopHandler = Arc<dyn Fn(&LoopEvent) + Send + Sync>;

// ============================================================================
// RepeatOptions
// ============================================================================

/// What a [`LoopScheduler`] repeats and how.
///
/// Loadable from JSON, e.g.
/// `{"command": "X", "planned": 10, "intervalMs": 500, "strict": ["hit"]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepeatOptions {
    /// Command written once per iteration.
    pub command: String,

    /// Number of counted iterations to run.
    pub planned: u32,

    /// Pause between iterations.
    #[serde(rename = "intervalMs", deserialize_with = "millis")]
    pub interval: Duration,

    /// Kind of message answering the command.
    pub returns: ReturnKind,

    /// Decides whether a response counts.
    #[serde(rename = "strict", deserialize_with = "strict_statuses")]
    pub criteria: Criteria,
}

impl Default for RepeatOptions {
    fn default() -> Self {
        Self::new("", 1)
    }
}

impl RepeatOptions {
    /// Creates options repeating `command` `planned` times, unpaced.
    #[must_use]
    pub fn new(command: impl Into<String>, planned: u32) -> Self {
        Self {
            command: command.into(),
            planned,
            interval: Duration::ZERO,
            returns: ReturnKind::Result,
            criteria: Criteria::always(),
        }
    }

    /// Loads options from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input, or [`Error::Config`] if
    /// the result does not validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the pause between iterations.
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the kind of message answering the command.
    #[inline]
    #[must_use]
    pub fn with_returns(mut self, returns: ReturnKind) -> Self {
        self.returns = returns;
        self
    }

    /// Sets the evaluation predicate.
    #[inline]
    #[must_use]
    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the command is empty or not one ASCII
    /// line.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::config("repeat command must not be empty"));
        }
        if !self.command.is_ascii() || self.command.contains(['\n', '\r']) {
            return Err(Error::config(format!(
                "repeat command must be one ASCII line: {:?}",
                self.command
            )));
        }
        Ok(())
    }
}

// ============================================================================
// LoopState / LoopEvent / RunSummary
// ============================================================================

/// Lifecycle state of a [`LoopScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    /// Ready to start.
    Idle,
    /// A run is in progress.
    Running,
    /// The last run counted every planned iteration.
    Completed,
    /// The last run was aborted.
    Aborted,
}

impl LoopState {
    /// Returns `true` for `Completed` and `Aborted`.
    #[inline]
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Notification raised by a [`LoopScheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LoopEvent {
    /// An iteration is about to write its command.
    IterationStarting {
        /// Run the iteration belongs to.
        run_id: RunId,
        /// The repeated command.
        command: String,
        /// Planned iteration count.
        planned: u32,
        /// Iterations counted so far.
        index: u32,
    },

    /// The run ended.
    RunDone {
        /// The finished run.
        run_id: RunId,
        /// The repeated command.
        command: String,
        /// Planned iteration count.
        planned: u32,
        /// Iterations actually counted.
        actual: u32,
        /// `Completed` or `Aborted`.
        state: LoopState,
    },
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// The finished run.
    pub run_id: RunId,
    /// The repeated command.
    pub command: String,
    /// Planned iteration count.
    pub planned: u32,
    /// Iterations actually counted.
    pub actual: u32,
    /// `Completed` or `Aborted`.
    pub state: LoopState,
}

// ============================================================================
// Inner State
// ============================================================================

/// Response slot shared by the delivery path and the run task.
#[derive(Debug, Default)]
struct Slot {
    waiting: bool,
    response: Option<Message>,
    aborted: bool,
}

/// What one wake of the run task found.
enum Wake {
    Response(Message),
    Aborted,
}

struct Inner {
    connection: Connection,
    options: RepeatOptions,
    state: Mutex<LoopState>,
    slot: Mutex<Slot>,
    notify: Notify,
    observers: Mutex<Vec<(SubscriptionId, LoopHandler)>>,
    done: watch::Sender<Option<RunSummary>>,
}

impl Inner {
    fn emit(&self, event: &LoopEvent) {
        let observers: Vec<LoopHandler> = self
            .observers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for observer in observers {
            observer(event);
        }
    }

    fn deliver(&self, message: Message) {
        let mut slot = self.slot.lock();
        if !slot.waiting || slot.aborted {
            trace!(body = %message.body, "Response ignored, not waiting");
            return;
        }
        slot.waiting = false;
        slot.response = Some(message);
        drop(slot);
        self.notify.notify_one();
    }

    fn abort(&self) {
        self.slot.lock().aborted = true;
        self.notify.notify_one();
    }

    fn is_aborted(&self) -> bool {
        self.slot.lock().aborted
    }

    /// Arms the slot for the next response, unless aborted.
    fn arm(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.aborted {
            return false;
        }
        slot.waiting = true;
        slot.response = None;
        true
    }

    /// Waits for a response or an abort, whichever was recorded first.
    async fn wait_for_response(&self) -> Wake {
        loop {
            {
                let mut slot = self.slot.lock();
                if let Some(response) = slot.response.take() {
                    return Wake::Response(response);
                }
                if slot.aborted {
                    slot.waiting = false;
                    return Wake::Aborted;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Sleeps for `interval`, cut short by an abort.
    async fn pace(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while !self.is_aborted() {
            tokio::select! {
                () = sleep_until(deadline) => return,
                () = self.notify.notified() => {}
            }
        }
    }
}

// ============================================================================
// LoopScheduler
// ============================================================================

/// Runs bounded repeats of one command over a [`Connection`].
///
/// Cheap to clone; clones control the same scheduler.
#[derive(Clone)]
pub struct LoopScheduler {
    inner: Arc<Inner>,
}

impl LoopScheduler {
    /// Creates an idle scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options do not validate.
    pub fn new(connection: Connection, options: RepeatOptions) -> Result<Self> {
        options.validate()?;
        let (done, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Inner {
                connection,
                options,
                state: Mutex::new(LoopState::Idle),
                slot: Mutex::new(Slot::default()),
                notify: Notify::new(),
                observers: Mutex::new(Vec::new()),
                done,
            }),
        })
    }

    /// Returns the options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &RepeatOptions {
        &self.inner.options
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LoopState {
        *self.inner.state.lock()
    }

    /// Starts a run in the background and returns its id.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] unless the scheduler is `Idle`
    /// - [`Error::NotConnected`] if the connection is not open
    pub fn start(&self) -> Result<RunId> {
        let mut state = self.inner.state.lock();
        if *state != LoopState::Idle {
            return Err(Error::already_running(self.inner.options.command.clone()));
        }
        if !self.inner.connection.is_open() {
            return Err(Error::NotConnected);
        }

        *state = LoopState::Running;
        *self.inner.slot.lock() = Slot::default();
        self.inner.done.send_replace(None);
        drop(state);

        let run_id = RunId::generate();
        let subscription = self.subscribe_responses();
        info!(
            %run_id,
            command = %self.inner.options.command,
            planned = self.inner.options.planned,
            "Loop started"
        );

        tokio::spawn(Self::run(Arc::clone(&self.inner), run_id, subscription));
        Ok(run_id)
    }

    /// Requests the run to stop. Never blocks.
    ///
    /// No command is written after the run observes the abort.
    pub fn abort(&self) {
        if self.state() == LoopState::Running {
            debug!(command = %self.inner.options.command, "Loop abort requested");
        }
        self.inner.abort();
    }

    /// Delivers a response to the waiting iteration.
    ///
    /// A no-op unless an iteration is waiting.
    pub fn update_with_message(&self, message: Message) {
        self.inner.deliver(message);
    }

    /// Waits for the current run to end.
    ///
    /// Returns `None` if the scheduler is idle.
    pub async fn wait(&self) -> Option<RunSummary> {
        let mut done = self.inner.done.subscribe();
        if self.state() == LoopState::Idle {
            return None;
        }
        done.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|summary| summary.clone())
    }

    /// Returns a finished scheduler to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] while a run is in progress.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state == LoopState::Running {
            return Err(Error::already_running(self.inner.options.command.clone()));
        }
        *state = LoopState::Idle;
        self.inner.done.send_replace(None);
        Ok(())
    }

    /// Registers a loop observer.
    pub fn on_event<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LoopEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::generate();
        self.inner.observers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a loop observer.
    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        let mut observers = self.inner.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Feeds matching responses into the scheduler while it runs.
    fn subscribe_responses(&self) -> SubscriptionId {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.connection.subscribe(move |event| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Event::Closed { .. } = event {
                inner.abort();
            } else if let Some(message) = event.message()
                && inner.options.returns.matches(message.kind)
            {
                inner.deliver(message);
            }
        })
    }

    /// Run task.
    async fn run(inner: Arc<Inner>, run_id: RunId, subscription: SubscriptionId) {
        let options = &inner.options;
        let mut counter = 0;

        let state = loop {
            if counter >= options.planned {
                break LoopState::Completed;
            }
            if !inner.arm() {
                break LoopState::Aborted;
            }

            inner.emit(&LoopEvent::IterationStarting {
                run_id,
                command: options.command.clone(),
                planned: options.planned,
                index: counter,
            });

            if let Err(e) = inner.connection.write(&options.command).await {
                warn!(%run_id, error = %e, "Loop write failed");
                inner.slot.lock().waiting = false;
                break LoopState::Aborted;
            }

            let response = match inner.wait_for_response().await {
                Wake::Response(response) => response,
                Wake::Aborted => break LoopState::Aborted,
            };

            if options.criteria.evaluate(&response) {
                counter += 1;
                trace!(%run_id, counter, "Iteration counted");
            } else {
                trace!(%run_id, body = %response.body, "Iteration not counted");
            }

            if options.planned > 1 && !options.interval.is_zero() && counter < options.planned {
                inner.pace(options.interval).await;
            }
        };

        inner.connection.unsubscribe(subscription);

        let summary = RunSummary {
            run_id,
            command: options.command.clone(),
            planned: options.planned,
            actual: counter,
            state,
        };

        // Publish state and summary together, before observers run.
        {
            let mut current = inner.state.lock();
            *current = state;
            inner.done.send_replace(Some(summary.clone()));
        }

        info!(
            %run_id,
            planned = summary.planned,
            actual = summary.actual,
            ?state,
            "Loop done"
        );

        inner.emit(&LoopEvent::RunDone {
            run_id,
            command: summary.command.clone(),
            planned: summary.planned,
            actual: summary.actual,
            state,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
