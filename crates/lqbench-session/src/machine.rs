//! The session protocol sequencer.
//!
//! [`ProtocolStateMachine::handle`] maps (stage, event) to a state mutation,
//! the requests to put on the wire, and at most one synthetic follow-up.
//! A stage acts on entry when it receives [`SessionEvent::Continue`] and
//! exits on exactly one real message, so a single inbound frame never
//! satisfies two stages.
//!
//! The machine never blocks and never touches the socket: requests are
//! appended to the caller's outbox and the driver flushes them.

use std::sync::Arc;

use lqbench_core::{
    InboundMessage, MessageKind, RpcRequest, RunId, SubscriptionHandle, classify,
    is_notification,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::correlation::{
    CorrelationIdGenerator, LIVE_QUERY_PURPOSE, SIGNIN_PURPOSE, USE_PURPOSE, WRITE_PURPOSE,
};
use crate::errors::SessionError;
use crate::metrics::{CORRELATION_MISMATCHES_TOTAL, NOTIFICATIONS_TOTAL, WRITES_ACKNOWLEDGED_TOTAL};
use crate::state::{SessionState, Stage, TeardownKind};
use crate::timers::{TimerFired, TimerPurpose, TimerRegistry};
use crate::transcript::RecordedEvent;

/// Input to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A real inbound frame.
    Message(InboundMessage),
    /// Synthetic marker: run the current stage's entry action.
    Continue,
    /// A timer owned by the machine fired.
    Timer(TimerFired),
}

impl SessionEvent {
    fn record(&self) -> RecordedEvent {
        match self {
            Self::Message(m) => RecordedEvent::Inbound {
                message: m.value().clone(),
            },
            Self::Continue => RecordedEvent::Continue,
            Self::Timer(fired) => RecordedEvent::Timer {
                purpose: fired.purpose,
            },
        }
    }
}

/// Result of handling one event: an optional synthetic follow-up.
pub type Step = Result<Option<SessionEvent>, SessionError>;

/// Event-driven sequencer for one session.
pub struct ProtocolStateMachine {
    config: Arc<SessionConfig>,
    ids: CorrelationIdGenerator,
    state: SessionState,
    burst_issued: bool,
}

impl ProtocolStateMachine {
    /// Create a machine in `SigningIn`.
    pub fn new(config: Arc<SessionConfig>, run_id: RunId, timers: TimerRegistry) -> Self {
        Self {
            config,
            ids: CorrelationIdGenerator::new(run_id),
            state: SessionState::new(timers),
            burst_issued: false,
        }
    }

    /// Session state, read-only.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Session state, for the driver's deadline and keepalive installation.
    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Whether teardown has run.
    pub fn is_finished(&self) -> bool {
        self.state.is_torn_down()
    }

    /// Process one event. Requests to send are appended to `outbox`.
    ///
    /// Returns the synthetic follow-up the caller must feed back before
    /// reading the next inbound frame.
    pub fn handle(&mut self, event: SessionEvent, outbox: &mut Vec<RpcRequest>) -> Step {
        let stage = self.state.stage();
        if self.state.is_torn_down() {
            if let SessionEvent::Message(m) = &event {
                warn!(%stage, id = m.id(), "message after teardown ignored");
            }
            return Ok(None);
        }
        self.state.transcript_mut().record(stage, event.record());

        match (stage, event) {
            (Stage::SigningIn, SessionEvent::Continue) => {
                let id = self.ids.fixed(SIGNIN_PURPOSE);
                let request = RpcRequest::signin(id, &self.config.username, &self.config.password);
                self.send_single(stage, request, outbox)
            }
            (Stage::SigningIn, SessionEvent::Message(m)) => self.on_signin(&m),
            (Stage::UsingScope, SessionEvent::Continue) => {
                let id = self.ids.fixed(USE_PURPOSE);
                let request =
                    RpcRequest::use_scope(id, &self.config.namespace, &self.config.database);
                self.send_single(stage, request, outbox)
            }
            (Stage::UsingScope, SessionEvent::Message(m)) => self.on_use(&m),
            (Stage::CreatingSubscription, SessionEvent::Continue) => {
                let id = self.ids.fixed(LIVE_QUERY_PURPOSE);
                let request = RpcRequest::query(id, &self.config.live_query);
                self.send_single(stage, request, outbox)
            }
            (Stage::CreatingSubscription, SessionEvent::Message(m)) => self.on_subscription(m),
            (Stage::GeneratingLoad, SessionEvent::Continue) => self.issue_burst(outbox),
            (Stage::GeneratingLoad, SessionEvent::Message(m)) => self.on_load_message(&m),
            (Stage::GeneratingLoad, SessionEvent::Timer(fired))
                if fired.purpose == TimerPurpose::LoadWait =>
            {
                self.on_load_wait_elapsed()
            }
            (Stage::CleaningUp, SessionEvent::Continue) => self.finish(),
            (stage, SessionEvent::Continue) => Err(SessionError::internal_violation(
                stage,
                "continue with no entry action",
            )),
            (stage, SessionEvent::Timer(fired)) => {
                debug!(%stage, purpose = ?fired.purpose, "timer not relevant to stage");
                Ok(None)
            }
            (stage, SessionEvent::Message(m)) => {
                debug!(%stage, id = m.id(), "message during teardown ignored");
                Ok(None)
            }
        }
    }

    /// Force `TimedOut` and tear down everything except the deadline timer.
    ///
    /// Returns the stage the session was in, or `None` if teardown had
    /// already run.
    pub fn expire(&mut self) -> Option<Stage> {
        if self.state.is_torn_down() {
            return None;
        }
        let stage = self.state.stage();
        self.state.force_timed_out();
        self.teardown(TeardownKind::Expired);
        Some(stage)
    }

    /// Tear down after a protocol or connection failure. No-op once torn down.
    pub fn abort(&mut self) {
        self.teardown(TeardownKind::Aborted);
    }

    fn teardown(&mut self, kind: TeardownKind) {
        // only Completed checks invariants, so other kinds cannot fail
        if let Err(e) = self.state.teardown(kind) {
            warn!(?kind, error = %e, "teardown reported an error");
        }
    }

    // ── Sending ─────────────────────────────────────────────────────

    fn send(&mut self, request: RpcRequest, outbox: &mut Vec<RpcRequest>) {
        trace!(id = %request.id, method = %request.method, "request queued");
        self.state.transcript_mut().attach_sent(request.clone());
        self.state.stats_mut().requests_sent += 1;
        outbox.push(request);
    }

    fn send_single(
        &mut self,
        stage: Stage,
        request: RpcRequest,
        outbox: &mut Vec<RpcRequest>,
    ) -> Step {
        if self.state.awaiting().is_some() {
            return Err(SessionError::internal_violation(
                stage,
                "entry action already ran",
            ));
        }
        self.state.set_awaiting(Some(request.id.clone()));
        debug!(%stage, id = %request.id, method = %request.method, "stage request sent");
        self.send(request, outbox);
        Ok(None)
    }

    /// Id and error checks shared by the single-request stages.
    fn check_awaited(&self, stage: Stage, m: &InboundMessage) -> Result<(), SessionError> {
        let Some(expected) = self.state.awaiting() else {
            return Err(SessionError::violation(
                stage,
                "message arrived before the stage request was sent",
                m,
            ));
        };
        match m.id() {
            Some(id) if id == expected.as_str() => {}
            Some(id) => {
                return Err(SessionError::violation(
                    stage,
                    format!("unexpected response id '{id}', expected '{expected}'"),
                    m,
                ));
            }
            None => {
                return Err(SessionError::violation(stage, "response has no id", m));
            }
        }
        if let Some(error) = m.error() {
            return Err(SessionError::violation(
                stage,
                format!("backend returned an error: {error}"),
                m,
            ));
        }
        Ok(())
    }

    fn complete_single(&mut self, next: Stage) -> Step {
        self.state.set_awaiting(None);
        self.state.advance(next)?;
        Ok(Some(SessionEvent::Continue))
    }

    // ── Stage handlers ──────────────────────────────────────────────

    fn on_signin(&mut self, m: &InboundMessage) -> Step {
        self.check_awaited(Stage::SigningIn, m)?;
        match m.result() {
            Some(result) if !result.is_null() => {}
            _ => {
                return Err(SessionError::violation(
                    Stage::SigningIn,
                    "signin returned no result",
                    m,
                ));
            }
        }
        info!("signed in");
        self.complete_single(Stage::UsingScope)
    }

    fn on_use(&mut self, m: &InboundMessage) -> Step {
        self.check_awaited(Stage::UsingScope, m)?;
        match m.result() {
            Some(Value::Null) => {}
            Some(_) => {
                return Err(SessionError::violation(
                    Stage::UsingScope,
                    "use returned a non-null result",
                    m,
                ));
            }
            None => {
                return Err(SessionError::violation(
                    Stage::UsingScope,
                    "use response has no result",
                    m,
                ));
            }
        }
        debug!(namespace = %self.config.namespace, database = %self.config.database, "scope selected");
        self.complete_single(Stage::CreatingSubscription)
    }

    fn on_subscription(&mut self, m: InboundMessage) -> Step {
        if is_notification(&m) {
            debug!("notification before subscription confirmed, buffering");
            self.state.buffer_notification(m);
            return Ok(None);
        }
        self.check_awaited(Stage::CreatingSubscription, &m)?;
        let Some(handle) = m.nested_handle() else {
            return Err(SessionError::violation(
                Stage::CreatingSubscription,
                "live query response carries no subscription handle",
                &m,
            ));
        };
        self.state.set_subscription(handle.clone())?;
        info!(subscription = %handle, "subscription created");
        self.replay_buffered(&handle);
        self.complete_single(Stage::GeneratingLoad)
    }

    fn replay_buffered(&mut self, handle: &SubscriptionHandle) {
        for m in self.state.take_buffered() {
            if m.notification_target().as_ref() == Some(handle) {
                self.count_notification();
            } else {
                debug!(
                    target_subscription = ?m.notification_target(),
                    "buffered notification for another subscription dropped"
                );
            }
        }
    }

    fn issue_burst(&mut self, outbox: &mut Vec<RpcRequest>) -> Step {
        if self.burst_issued {
            return Err(SessionError::internal_violation(
                Stage::GeneratingLoad,
                "write burst already issued",
            ));
        }
        self.burst_issued = true;

        let config = Arc::clone(&self.config);
        for _ in 0..config.burst_size {
            let id = self.ids.unique(WRITE_PURPOSE);
            self.state.add_pending(id.clone());
            self.send(RpcRequest::query(id, &config.write_query), outbox);
        }
        info!(burst = config.burst_size, "write burst issued");

        if self.state.pending().is_empty() {
            self.state.advance(Stage::CleaningUp)?;
            return Ok(Some(SessionEvent::Continue));
        }
        self.state.start_load_wait(config.load_wait);
        Ok(None)
    }

    fn on_load_message(&mut self, m: &InboundMessage) -> Step {
        match classify(m) {
            MessageKind::Notification => {
                if m.notification_target().as_ref() != self.state.subscription() {
                    return Err(SessionError::violation(
                        Stage::GeneratingLoad,
                        "notification for an unknown subscription",
                        m,
                    ));
                }
                self.count_notification();
                Ok(None)
            }
            MessageKind::Response => self.on_write_ack(m),
            MessageKind::Malformed => Err(SessionError::violation(
                Stage::GeneratingLoad,
                "unrecognized message shape",
                m,
            )),
        }
    }

    fn on_write_ack(&mut self, m: &InboundMessage) -> Step {
        let Some(id) = m.id() else {
            return Err(SessionError::violation(
                Stage::GeneratingLoad,
                "response has no id",
                m,
            ));
        };
        if let Some(error) = m.error() {
            return Err(SessionError::violation(
                Stage::GeneratingLoad,
                format!("write rejected: {error}"),
                m,
            ));
        }
        if !self.state.remove_pending(id) {
            self.state.stats_mut().correlation_mismatches += 1;
            counter!(CORRELATION_MISMATCHES_TOTAL).increment(1);
            warn!(id, "response does not match a pending request");
            return Ok(None);
        }

        self.state.stats_mut().writes_acknowledged += 1;
        counter!(WRITES_ACKNOWLEDGED_TOTAL).increment(1);
        if !self.state.pending().is_empty() {
            return Ok(None);
        }

        self.state.stop_load_wait();
        info!(
            acknowledged = self.state.stats().writes_acknowledged,
            notifications = self.state.stats().notifications,
            "all writes acknowledged"
        );
        self.state.advance(Stage::CleaningUp)?;
        Ok(Some(SessionEvent::Continue))
    }

    fn on_load_wait_elapsed(&mut self) -> Step {
        warn!(
            outstanding = self.state.pending().len(),
            "acknowledgement wait elapsed"
        );
        self.state.advance(Stage::CleaningUp)?;
        Ok(Some(SessionEvent::Continue))
    }

    fn finish(&mut self) -> Step {
        let _ = self.state.teardown(TeardownKind::Completed)?;
        info!(
            requests = self.state.stats().requests_sent,
            timers_cancelled = self.state.stats().timers_cancelled,
            "session cleaned up"
        );
        Ok(None)
    }

    fn count_notification(&mut self) {
        self.state.stats_mut().notifications += 1;
        counter!(NOTIFICATIONS_TOTAL).increment(1);
    }
}
