//! # Workflow Session
//!
//! Client-side state machine for one trigger-and-poll interaction.
//!
//! ```text
//!            submit (valid)          trigger ok
//!   Idle ─────────────────▶ Submitting ─────────▶ Polling ──┬─ field seen ──▶ Succeeded
//!    ▲                          │                           └─ budget spent ─▶ TimedOut
//!    │                          └─ token/trigger error ─▶ Error
//!    └──────────────── reset (from any state) ───────────────────────────────────┘
//! ```
//!
//! Terminal states stay put until [`WorkflowSession::reset`]. Resetting or
//! dropping the session aborts the pending poll; the already-fired trigger is
//! not recalled.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::action::{ContractAction, TriggerReceipt};
use crate::clock::{Clock, SystemClock};
use crate::error::{RelayError, Result};
use crate::events::SessionEvent;
use crate::oauth::TokenBroker;
use crate::poll::{PollConfig, PollOutcome, Poller, Scheduler, TokioScheduler};
use crate::record_store::RecordStore;
use crate::streaming::{EventHub, SessionEventStream};
use crate::trigger::TriggerEndpoint;

/// Default `request_origin` sent with every trigger.
pub const DEFAULT_REQUEST_ORIGIN: &str = "HubSpot Middleware";

/// Where a session currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Submitting,
    Polling {
        attempts: u32,
    },
    Succeeded {
        value: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        recoverable: bool,
    },
    TimedOut {
        attempts: u32,
    },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Error { .. } | Self::TimedOut { .. }
        )
    }

    /// Submitting or polling; the submit action must not be offered.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Submitting | Self::Polling { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Submitting => "submitting",
            Self::Polling { .. } => "polling",
            Self::Succeeded { .. } => "succeeded",
            Self::Error { .. } => "error",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    fn from_error(error: &RelayError) -> Self {
        Self::Error {
            message: error.to_string(),
            status: error.upstream_status(),
            recoverable: error.is_recoverable(),
        }
    }
}

/// State shared with the poll task.
///
/// Every transition carries the generation it was started under; `reset`
/// bumps the generation, so transitions from an abandoned run are dropped.
struct Shared {
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    events: EventHub,
}

impl Shared {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn transition(&self, generation: u64, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Idle -> Submitting, only if nobody else got there first.
    fn begin_submit(&self, generation: u64) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation
                || *state != SessionState::Idle
            {
                return false;
            }
            *state = SessionState::Submitting;
            true
        })
    }

    fn reset(&self) {
        self.state.send_modify(|state| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = SessionState::Idle;
        });
    }
}

/// One user's trigger-and-poll interaction with a workflow.
pub struct WorkflowSession {
    broker: Arc<dyn TokenBroker>,
    trigger: Arc<dyn TriggerEndpoint>,
    store: Arc<dyn RecordStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    poll_config: PollConfig,
    request_origin: String,
    stamp_record: bool,
    shared: Arc<Shared>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    target: Mutex<Option<String>>,
}

impl std::fmt::Debug for WorkflowSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowSession")
            .field("state", &self.state())
            .field("poll_config", &self.poll_config)
            .field("request_origin", &self.request_origin)
            .field("stamp_record", &self.stamp_record)
            .finish()
    }
}

impl WorkflowSession {
    pub fn new(
        broker: Arc<dyn TokenBroker>,
        trigger: Arc<dyn TriggerEndpoint>,
        store: Arc<dyn RecordStore>,
        poll_config: PollConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            broker,
            trigger,
            store,
            scheduler: Arc::new(TokioScheduler),
            clock: Arc::new(SystemClock),
            poll_config,
            request_origin: DEFAULT_REQUEST_ORIGIN.to_string(),
            stamp_record: true,
            shared: Arc::new(Shared {
                state,
                generation: AtomicU64::new(0),
                events: EventHub::new(),
            }),
            poll_task: Mutex::new(None),
            target: Mutex::new(None),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_request_origin(mut self, origin: impl Into<String>) -> Self {
        self.request_origin = origin.into();
        self
    }

    /// Write the trigger stamp fields onto the record after a successful trigger.
    pub fn with_stamp_record(mut self, stamp: bool) -> Self {
        self.stamp_record = stamp;
        self
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn poll_config(&self) -> &PollConfig {
        &self.poll_config
    }

    /// Stream of transition events from now on.
    pub fn subscribe(&self) -> SessionEventStream {
        self.shared.events.subscribe()
    }

    /// Wait until the session reaches a terminal state.
    ///
    /// Only resolves after a submit (or hydrate) has been made; an idle
    /// session never becomes terminal on its own.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        let result = rx.wait_for(SessionState::is_terminal).await.map(|s| s.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Check once whether the workflow already produced a result for this
    /// record, moving straight to `Succeeded` if so.
    pub async fn hydrate(&self, tenant_id: &str, target_id: &str) -> Result<SessionState> {
        let generation = self.shared.generation();
        if self.state() != SessionState::Idle {
            return Ok(self.state());
        }

        let poller = self.poller();
        if let Some((value, _)) = poller.check(tenant_id, target_id).await? {
            if self.shared.transition(
                generation,
                SessionState::Succeeded {
                    value: value.clone(),
                },
            ) {
                self.set_target(Some(target_id.to_string()));
                self.shared.events.publish(SessionEvent::succeeded(
                    target_id,
                    value,
                    std::time::Duration::ZERO,
                ));
            }
        }

        Ok(self.state())
    }

    /// Validate, fire the trigger and start polling.
    ///
    /// Returns once the trigger has been accepted; follow progress with
    /// [`state`](Self::state), [`subscribe`](Self::subscribe) or
    /// [`wait_terminal`](Self::wait_terminal).
    pub async fn submit(&self, action: &ContractAction) -> Result<TriggerReceipt> {
        let current = self.state();
        if current != SessionState::Idle {
            return Err(RelayError::InvalidState(format!(
                "cannot submit while {}",
                current.name()
            )));
        }

        let validated = action.validate()?;

        let generation = self.shared.generation();
        if !self.shared.begin_submit(generation) {
            return Err(RelayError::InvalidState(
                "another submission is already in progress".to_string(),
            ));
        }

        let started = tokio::time::Instant::now();
        let tenant_id = validated.tenant_id.clone();
        let target_id = validated.target_id.clone();
        self.set_target(Some(target_id.clone()));
        self.shared
            .events
            .publish(SessionEvent::submitted(&target_id, validated.action));

        let token = match self.broker.access_token(&tenant_id).await {
            Ok(token) => token,
            Err(e) => return Err(self.fail(generation, &target_id, e)),
        };

        let body = validated.trigger_body(&self.request_origin, self.clock.now_ms());
        let response = match self.trigger.fire(&body, &token).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(generation, &target_id, e)),
        };
        info!(
            tenant = %tenant_id,
            record = %target_id,
            action = validated.action.as_str(),
            "workflow triggered"
        );

        if self.stamp_record {
            let stamp = validated.trigger_stamp(self.clock.now_ms());
            if let Err(e) = self.store.write_fields(&tenant_id, &target_id, &stamp).await {
                warn!(tenant = %tenant_id, record = %target_id, error = %e, "failed to stamp record");
            }
        }

        let receipt = TriggerReceipt {
            tenant_id: tenant_id.clone(),
            target_id: target_id.clone(),
            action: validated.action,
            response,
        };

        if !self
            .shared
            .transition(generation, SessionState::Polling { attempts: 0 })
        {
            // Reset while the trigger was in flight.
            return Ok(receipt);
        }

        let handle = self.spawn_poll(generation, tenant_id, target_id, started);
        self.install_poll(generation, handle);

        Ok(receipt)
    }

    /// Reset and submit again.
    pub async fn retry(&self, action: &ContractAction) -> Result<TriggerReceipt> {
        self.reset();
        self.submit(action).await
    }

    /// Cancel any pending poll and return to `Idle`.
    pub fn reset(&self) {
        // Generation first: a submit that installs its task after this
        // point aborts it in `install_poll`.
        self.shared.reset();
        self.abort_poll();

        let target = self.take_target().unwrap_or_default();
        self.shared.events.publish(SessionEvent::reset(target));
    }

    /// Whether a poll task is still scheduled.
    pub fn is_polling(&self) -> bool {
        self.poll_task
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    fn spawn_poll(
        &self,
        generation: u64,
        tenant_id: String,
        target_id: String,
        started: tokio::time::Instant,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let poller = self.poller();

        tokio::spawn(async move {
            let max_attempts = poller.config().max_attempts;

            let outcome = poller
                .run(&tenant_id, &target_id, |attempt| {
                    if shared.transition(generation, SessionState::Polling { attempts: attempt }) {
                        shared.events.publish(SessionEvent::poll_attempt(
                            &target_id,
                            attempt,
                            max_attempts,
                        ));
                    }
                })
                .await;

            match outcome {
                PollOutcome::Succeeded {
                    value, attempts, ..
                } => {
                    info!(record = %target_id, attempts, "workflow result observed");
                    if shared.transition(
                        generation,
                        SessionState::Succeeded {
                            value: value.clone(),
                        },
                    ) {
                        shared.events.publish(SessionEvent::succeeded(
                            &target_id,
                            value,
                            started.elapsed(),
                        ));
                    }
                }
                PollOutcome::TimedOut { attempts } => {
                    warn!(
                        record = %target_id,
                        attempts,
                        "workflow result not observed in time; it may still complete"
                    );
                    if shared.transition(generation, SessionState::TimedOut { attempts }) {
                        shared
                            .events
                            .publish(SessionEvent::timed_out(&target_id, attempts));
                    }
                }
            }
        })
    }

    fn fail(&self, generation: u64, target_id: &str, error: RelayError) -> RelayError {
        warn!(record = target_id, error = %error, "submission failed");
        if self
            .shared
            .transition(generation, SessionState::from_error(&error))
        {
            self.shared.events.publish(SessionEvent::failed(
                target_id,
                error.to_string(),
                error.is_recoverable(),
            ));
        }
        error
    }

    fn poller(&self) -> Poller {
        Poller::new(
            Arc::clone(&self.store),
            Arc::clone(&self.scheduler),
            self.poll_config.clone(),
        )
    }

    /// Keep `handle` as the session's poll task, unless the run it belongs
    /// to was reset in the meantime.
    fn install_poll(&self, generation: u64, handle: JoinHandle<()>) {
        let Ok(mut task) = self.poll_task.lock() else {
            handle.abort();
            return;
        };
        if self.shared.generation() != generation {
            handle.abort();
            return;
        }
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    fn abort_poll(&self) {
        if let Ok(mut task) = self.poll_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    fn set_target(&self, target: Option<String>) {
        if let Ok(mut current) = self.target.lock() {
            *current = target;
        }
    }

    fn take_target(&self) -> Option<String> {
        self.target.lock().ok().and_then(|mut t| t.take())
    }
}

impl Drop for WorkflowSession {
    fn drop(&mut self) {
        self.abort_poll();
    }
}
