//! WebSocket session driver.
//!
//! Owns one connection and one [`ProtocolStateMachine`]. Inbound frames and
//! timer expiries are both funnelled through a single `select!` loop, so
//! the machine only ever sees one event at a time. Every synthetic
//! follow-up is processed before the next inbound frame is read.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use lqbench_core::{InboundMessage, RpcRequest, RunId};
use lqbench_settings::DeadlinePolicy;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::machine::{ProtocolStateMachine, SessionEvent};
use crate::metrics::{
    DEADLINE_EXCEEDED_TOTAL, SESSION_DURATION_SECONDS, SESSIONS_COMPLETED_TOTAL,
    SESSIONS_FAILED_TOTAL, SESSIONS_STARTED_TOTAL,
};
use crate::state::{SessionStats, Stage};
use crate::timers::{TimerFired, TimerPurpose, TimerRegistry};
use crate::transcript::Transcript;

/// Upper bound on the closing handshake once the session is over.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Final verdict for one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Reached `CleaningUp` with every invariant holding.
    Passed,
    /// Deadline fired during load generation under the slow-pass policy.
    Slow,
    /// Anything else.
    Failed,
}

impl SessionStatus {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Slow => "slow",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of a single session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// Session run id.
    pub run_id: RunId,
    /// Verdict.
    pub status: SessionStatus,
    /// Machine-readable error code for non-passing sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable error for non-passing sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Stage the session ended in.
    pub final_stage: Stage,
    /// Wall time from start to report.
    pub elapsed_ms: u64,
    /// Session counters.
    pub stats: SessionStats,
    /// Full transcript, kept only for sessions that did not pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
}

impl SessionReport {
    /// Whether the session passed.
    pub fn passed(&self) -> bool {
        self.status == SessionStatus::Passed
    }
}

/// Runs one session against the backend.
pub struct SessionDriver {
    config: Arc<SessionConfig>,
    run_id: RunId,
}

impl SessionDriver {
    /// Driver with a freshly generated run id.
    pub fn new(config: Arc<SessionConfig>) -> Self {
        Self::with_run_id(config, RunId::generate())
    }

    /// Driver with a caller-chosen run id.
    pub fn with_run_id(config: Arc<SessionConfig>, run_id: RunId) -> Self {
        Self { config, run_id }
    }

    /// The session's run id.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Connect to the configured URL and run the session to completion.
    ///
    /// The connection attempt counts against the session deadline.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run(self) -> SessionReport {
        let started = Instant::now();
        counter!(SESSIONS_STARTED_TOTAL).increment(1);
        debug!(url = %self.config.url, "connecting");

        match tokio::time::timeout(self.config.deadline, connect_async(self.config.url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => {
                info!("connected");
                self.drive(ws, started).await
            }
            Ok(Err(e)) => self.unstarted_report(SessionError::Connection(e), started),
            Err(_) => {
                counter!(DEADLINE_EXCEEDED_TOTAL).increment(1);
                let err = SessionError::DeadlineExceeded {
                    stage: Stage::SigningIn,
                    after: self.config.deadline,
                };
                self.unstarted_report(err, started)
            }
        }
    }

    /// Run the session over an already established connection.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run_on<S>(self, ws: WebSocketStream<S>) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        counter!(SESSIONS_STARTED_TOTAL).increment(1);
        self.drive(ws, Instant::now()).await
    }

    async fn drive<S>(self, ws: WebSocketStream<S>, started: Instant) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (timers, mut fired_rx) = TimerRegistry::channel();
        let mut machine =
            ProtocolStateMachine::new(Arc::clone(&self.config), self.run_id.clone(), timers);

        let remaining = self.config.deadline.saturating_sub(started.elapsed());
        let _ = machine.state_mut().install_deadline(remaining);
        if !self.config.keepalive_interval.is_zero() {
            let _ = machine
                .state_mut()
                .timers_mut()
                .schedule_every(TimerPurpose::Keepalive, self.config.keepalive_interval);
        }

        let deadline_at = started + self.config.deadline;
        let (mut sink, mut stream) = ws.split();
        let outcome = self
            .event_loop(&mut machine, &mut sink, &mut stream, &mut fired_rx, deadline_at)
            .await;
        if outcome.is_err() {
            machine.abort();
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => trace!("connection closed"),
            Ok(Err(e)) => debug!(error = %e, "close handshake failed"),
            Err(_) => debug!("close handshake timed out"),
        }

        self.finished_report(machine, outcome, started)
    }

    async fn event_loop<Si, St>(
        &self,
        machine: &mut ProtocolStateMachine,
        sink: &mut Si,
        stream: &mut St,
        fired_rx: &mut mpsc::UnboundedReceiver<TimerFired>,
        deadline_at: Instant,
    ) -> Result<(), SessionError>
    where
        Si: Sink<Message, Error = tungstenite::Error> + Unpin,
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        // Writes can block on a peer that stopped reading, and the timer
        // branch below is not polled meanwhile, so each write carries the
        // deadline itself.
        let mut outbox = Vec::new();
        let written =
            timeout_at(deadline_at, dispatch(machine, SessionEvent::Continue, sink, &mut outbox)).await;
        self.bounded(machine, written)?;

        while !machine.is_finished() {
            tokio::select! {
                biased;

                Some(fired) = fired_rx.recv() => {
                    if !machine.state_mut().timers_mut().acknowledge(&fired) {
                        trace!(id = %fired.id, "stale timer event dropped");
                        continue;
                    }
                    match fired.purpose {
                        TimerPurpose::Deadline => return Err(self.expired(machine)),
                        TimerPurpose::Keepalive => {
                            let written =
                                timeout_at(deadline_at, sink.send(Message::Ping(Vec::new().into()))).await;
                            self.bounded(machine, written)?;
                            trace!("keepalive ping sent");
                        }
                        TimerPurpose::LoadWait => {
                            let event = SessionEvent::Timer(fired);
                            let written =
                                timeout_at(deadline_at, dispatch(machine, event, sink, &mut outbox)).await;
                            self.bounded(machine, written)?;
                        }
                    }
                }

                frame = stream.next() => {
                    let stage = machine.state().stage();
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let event = SessionEvent::Message(parse_frame(stage, text.as_str())?);
                            let written =
                                timeout_at(deadline_at, dispatch(machine, event, sink, &mut outbox)).await;
                            self.bounded(machine, written)?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let text = std::str::from_utf8(&data).map_err(|e| {
                                SessionError::internal_violation(stage, format!("binary frame is not UTF-8: {e}"))
                            })?;
                            let event = SessionEvent::Message(parse_frame(stage, text)?);
                            let written =
                                timeout_at(deadline_at, dispatch(machine, event, sink, &mut outbox)).await;
                            self.bounded(machine, written)?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "close frame received");
                            return Err(SessionError::ConnectionClosed { stage });
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                            trace!("control frame");
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(SessionError::ConnectionClosed { stage }),
                    }
                }
            }
        }
        Ok(())
    }

    /// Expire the machine and build the deadline error.
    fn expired(&self, machine: &mut ProtocolStateMachine) -> SessionError {
        let stage = machine.expire().unwrap_or_else(|| machine.state().stage());
        counter!(DEADLINE_EXCEEDED_TOTAL).increment(1);
        warn!(%stage, deadline = ?self.config.deadline, "session deadline fired");
        SessionError::DeadlineExceeded {
            stage,
            after: self.config.deadline,
        }
    }

    /// Unwrap a deadline-bounded write, expiring the session if it elapsed.
    fn bounded<T, E>(
        &self,
        machine: &mut ProtocolStateMachine,
        written: Result<Result<T, E>, Elapsed>,
    ) -> Result<T, SessionError>
    where
        E: Into<SessionError>,
    {
        match written {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                debug!(stage = %machine.state().stage(), "write blocked past the deadline");
                Err(self.expired(machine))
            }
        }
    }

    fn finished_report(
        &self,
        mut machine: ProtocolStateMachine,
        outcome: Result<(), SessionError>,
        started: Instant,
    ) -> SessionReport {
        let final_stage = machine.state().stage();
        let stats = machine.state().stats().clone();
        let transcript = machine.state_mut().take_transcript();
        self.report(outcome.err(), final_stage, stats, transcript, started)
    }

    fn unstarted_report(&self, err: SessionError, started: Instant) -> SessionReport {
        self.report(
            Some(err),
            Stage::SigningIn,
            SessionStats::default(),
            Transcript::default(),
            started,
        )
    }

    fn report(
        &self,
        error: Option<SessionError>,
        final_stage: Stage,
        stats: SessionStats,
        transcript: Transcript,
        started: Instant,
    ) -> SessionReport {
        let elapsed = started.elapsed();
        let status = match &error {
            None => SessionStatus::Passed,
            Some(SessionError::DeadlineExceeded {
                stage: Stage::GeneratingLoad,
                ..
            }) if self.config.deadline_policy == DeadlinePolicy::SlowPass => SessionStatus::Slow,
            Some(_) => SessionStatus::Failed,
        };

        histogram!(SESSION_DURATION_SECONDS, "status" => status.as_str())
            .record(elapsed.as_secs_f64());

        match &error {
            None => {
                counter!(SESSIONS_COMPLETED_TOTAL).increment(1);
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    writes = stats.writes_acknowledged,
                    notifications = stats.notifications,
                    mismatches = stats.correlation_mismatches,
                    "session passed"
                );
            }
            Some(e) => {
                counter!(SESSIONS_FAILED_TOTAL, "code" => e.code()).increment(1);
                if status == SessionStatus::Slow {
                    warn!(code = e.code(), error = %e, %final_stage, "session slow");
                } else {
                    error!(
                        code = e.code(),
                        error = %e,
                        %final_stage,
                        transcript = %transcript.to_json(),
                        "session failed"
                    );
                }
            }
        }

        SessionReport {
            run_id: self.run_id.clone(),
            status,
            error_code: error.as_ref().map(|e| e.code().to_owned()),
            error_message: error.as_ref().map(ToString::to_string),
            final_stage,
            elapsed_ms: elapsed.as_millis() as u64,
            stats,
            transcript: (status != SessionStatus::Passed).then_some(transcript),
        }
    }
}

fn parse_frame(stage: Stage, text: &str) -> Result<InboundMessage, SessionError> {
    InboundMessage::parse(text).map_err(|e| SessionError::ProtocolViolation {
        stage,
        reason: format!("frame is not valid JSON: {e}"),
        message: Some(Value::String(text.to_owned())),
    })
}

/// Feed one event and its synthetic follow-ups to the machine, flushing
/// requests after each step.
async fn dispatch<Si>(
    machine: &mut ProtocolStateMachine,
    event: SessionEvent,
    sink: &mut Si,
    outbox: &mut Vec<RpcRequest>,
) -> Result<(), SessionError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut next = Some(event);
    while let Some(event) = next.take() {
        next = machine.handle(event, outbox)?;
        flush(machine.state().stage(), sink, outbox).await?;
    }
    Ok(())
}

async fn flush<Si>(
    stage: Stage,
    sink: &mut Si,
    outbox: &mut Vec<RpcRequest>,
) -> Result<(), SessionError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if outbox.is_empty() {
        return Ok(());
    }
    for request in outbox.drain(..) {
        let frame = request.to_frame().map_err(|e| {
            SessionError::internal_violation(stage, format!("request not serializable: {e}"))
        })?;
        sink.feed(Message::Text(frame.into())).await?;
    }
    sink.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_labels() {
        assert_eq!(SessionStatus::Passed.as_str(), "passed");
        assert_eq!(
            serde_json::to_value(SessionStatus::Slow).unwrap(),
            json!("slow")
        );
    }

    #[test]
    fn parse_failure_keeps_raw_text() {
        let err = parse_frame(Stage::UsingScope, "{not json").unwrap_err();
        match err {
            SessionError::ProtocolViolation { stage, message, .. } => {
                assert_eq!(stage, Stage::UsingScope);
                assert_eq!(message, Some(json!("{not json")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_backend_reports_connection_error() {
        let config = Arc::new(SessionConfig {
            url: "ws://127.0.0.1:1/rpc".into(),
            deadline: Duration::from_secs(5),
            ..SessionConfig::default()
        });
        let report = SessionDriver::with_run_id(config, RunId::from("r1")).run().await;
        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(report.final_stage, Stage::SigningIn);
        assert!(report.transcript.is_some());
        assert!(report.error_code.is_some());
    }

    #[test]
    fn passed_report_omits_transcript_and_error() {
        let report = SessionReport {
            run_id: RunId::from("r1"),
            status: SessionStatus::Passed,
            error_code: None,
            error_message: None,
            final_stage: Stage::CleaningUp,
            elapsed_ms: 12,
            stats: SessionStats::default(),
            transcript: None,
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["runId"], "r1");
        assert_eq!(v["finalStage"], "cleaning_up");
        assert!(v.get("transcript").is_none());
        assert!(v.get("errorCode").is_none());
        assert!(report.passed());
    }
}
