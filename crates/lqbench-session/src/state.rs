//! Mutable session record the protocol state machine operates on.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use lqbench_core::{CorrelationId, InboundMessage, SubscriptionHandle};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::SessionError;
use crate::timers::{TimerId, TimerPurpose, TimerRegistry};
use crate::transcript::Transcript;

/// Protocol stage. Declaration order is the forward order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Authenticating.
    SigningIn,
    /// Selecting namespace and database.
    UsingScope,
    /// Creating the live subscription.
    CreatingSubscription,
    /// Issuing the write burst and reconciling acknowledgements.
    GeneratingLoad,
    /// Tearing down after normal completion.
    CleaningUp,
    /// Tearing down after the deadline fired.
    TimedOut,
}

impl Stage {
    /// The single forward successor, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::SigningIn => Some(Self::UsingScope),
            Self::UsingScope => Some(Self::CreatingSubscription),
            Self::CreatingSubscription => Some(Self::GeneratingLoad),
            Self::GeneratingLoad => Some(Self::CleaningUp),
            Self::CleaningUp | Self::TimedOut => None,
        }
    }

    /// Whether the stage is one of the two teardown stages.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CleaningUp | Self::TimedOut)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SigningIn => "SigningIn",
            Self::UsingScope => "UsingScope",
            Self::CreatingSubscription => "CreatingSubscription",
            Self::GeneratingLoad => "GeneratingLoad",
            Self::CleaningUp => "CleaningUp",
            Self::TimedOut => "TimedOut",
        };
        f.write_str(name)
    }
}

/// How a teardown was triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownKind {
    /// `CleaningUp` reached; every timer including the deadline is cancelled
    /// and invariants are checked.
    Completed,
    /// Deadline fired; every timer except the deadline is cancelled.
    Expired,
    /// Protocol or connection failure; every timer is cancelled.
    Aborted,
}

/// Counters reported with each session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Requests put on the wire.
    pub requests_sent: u64,
    /// Burst writes acknowledged without error.
    pub writes_acknowledged: u64,
    /// Notifications matched to the session's subscription.
    pub notifications: u64,
    /// Notifications that arrived before the subscription was confirmed.
    pub buffered_notifications: u64,
    /// Responses whose id was not pending.
    pub correlation_mismatches: u64,
    /// Timers cancelled by teardown.
    pub timers_cancelled: u64,
}

/// Per-session mutable record.
pub struct SessionState {
    stage: Stage,
    subscription: Option<SubscriptionHandle>,
    awaiting: Option<CorrelationId>,
    pending: HashSet<CorrelationId>,
    // Reserved: never populated, never gates completion.
    expected_notifications: HashSet<String>,
    buffered: Vec<InboundMessage>,
    timers: TimerRegistry,
    deadline: Option<TimerId>,
    load_wait: Option<TimerId>,
    transcript: Transcript,
    stats: SessionStats,
    torn_down: bool,
}

impl SessionState {
    /// Fresh state in `SigningIn`.
    pub fn new(timers: TimerRegistry) -> Self {
        Self {
            stage: Stage::SigningIn,
            subscription: None,
            awaiting: None,
            pending: HashSet::new(),
            expected_notifications: HashSet::new(),
            buffered: Vec::new(),
            timers,
            deadline: None,
            load_wait: None,
            transcript: Transcript::default(),
            stats: SessionStats::default(),
            torn_down: false,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Step to the immediate forward successor.
    pub fn advance(&mut self, to: Stage) -> Result<(), SessionError> {
        if self.stage.next() != Some(to) {
            return Err(SessionError::IllegalTransition {
                from: self.stage,
                to,
            });
        }
        debug!(from = %self.stage, %to, "stage advanced");
        self.stage = to;
        Ok(())
    }

    /// Unconditional jump to `TimedOut`.
    pub fn force_timed_out(&mut self) {
        debug!(from = %self.stage, "stage forced to TimedOut");
        self.stage = Stage::TimedOut;
    }

    /// The live subscription handle, once confirmed.
    pub fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.subscription.as_ref()
    }

    /// Record the subscription handle. Only the first call succeeds.
    pub fn set_subscription(&mut self, handle: SubscriptionHandle) -> Result<(), SessionError> {
        if self.subscription.is_some() {
            return Err(SessionError::DuplicateSubscription);
        }
        self.subscription = Some(handle);
        Ok(())
    }

    /// Id of the single in-flight request of the current stage.
    pub fn awaiting(&self) -> Option<&CorrelationId> {
        self.awaiting.as_ref()
    }

    pub(crate) fn set_awaiting(&mut self, id: Option<CorrelationId>) {
        self.awaiting = id;
    }

    /// Outstanding burst acknowledgements.
    pub fn pending(&self) -> &HashSet<CorrelationId> {
        &self.pending
    }

    pub(crate) fn add_pending(&mut self, id: CorrelationId) {
        let _ = self.pending.insert(id);
    }

    pub(crate) fn remove_pending(&mut self, id: &str) -> bool {
        self.pending.remove(id)
    }

    /// Notification keys still expected. Reserved; currently always empty.
    pub fn expected_notifications(&self) -> &HashSet<String> {
        &self.expected_notifications
    }

    pub(crate) fn buffer_notification(&mut self, message: InboundMessage) {
        self.stats.buffered_notifications += 1;
        self.buffered.push(message);
    }

    pub(crate) fn take_buffered(&mut self) -> Vec<InboundMessage> {
        std::mem::take(&mut self.buffered)
    }

    /// The session's timers.
    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Mutable access to the session's timers.
    pub fn timers_mut(&mut self) -> &mut TimerRegistry {
        &mut self.timers
    }

    /// Register the session-wide deadline. Only one is ever installed.
    pub fn install_deadline(&mut self, after: Duration) -> TimerId {
        if let Some(id) = self.deadline {
            return id;
        }
        let id = self.timers.schedule_once(TimerPurpose::Deadline, after);
        self.deadline = Some(id);
        id
    }

    /// Handle of the deadline timer.
    pub fn deadline(&self) -> Option<TimerId> {
        self.deadline
    }

    pub(crate) fn start_load_wait(&mut self, after: Duration) {
        self.load_wait = Some(self.timers.schedule_once(TimerPurpose::LoadWait, after));
    }

    pub(crate) fn stop_load_wait(&mut self) {
        if let Some(id) = self.load_wait.take() {
            let _ = self.timers.cancel(id);
        }
    }

    /// Transcript of processed events.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub(crate) fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    /// Take the transcript, leaving an empty one behind.
    pub fn take_transcript(&mut self) -> Transcript {
        std::mem::take(&mut self.transcript)
    }

    /// Session counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    /// Whether teardown already ran.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Shared teardown routine. Runs at most once; later calls return
    /// `Ok(false)` without side effects.
    ///
    /// Only [`TeardownKind::Completed`] checks invariants: no outstanding
    /// acknowledgements and no live timers once the deadline is cancelled.
    pub fn teardown(&mut self, kind: TeardownKind) -> Result<bool, SessionError> {
        if self.torn_down {
            return Ok(false);
        }
        self.torn_down = true;
        self.load_wait = None;

        let keep = match kind {
            TeardownKind::Expired => self.deadline,
            TeardownKind::Completed | TeardownKind::Aborted => None,
        };
        let cancelled = self.timers.drain(keep);
        self.stats.timers_cancelled += cancelled as u64;
        debug!(?kind, cancelled, stage = %self.stage, "teardown ran");

        if !self.expected_notifications.is_empty() {
            debug!(
                remaining = self.expected_notifications.len(),
                "expected notifications left unobserved"
            );
        }

        if kind == TeardownKind::Completed {
            if !self.pending.is_empty() {
                return Err(SessionError::InvariantViolation(format!(
                    "{} write acknowledgements outstanding",
                    self.pending.len()
                )));
            }
            if !self.timers.is_empty() {
                return Err(SessionError::InvariantViolation(format!(
                    "{} timers still registered",
                    self.timers.len()
                )));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn state() -> SessionState {
        let (timers, _rx) = TimerRegistry::channel();
        SessionState::new(timers)
    }

    #[test]
    fn stage_order_is_forward() {
        let order = [
            Stage::SigningIn,
            Stage::UsingScope,
            Stage::CreatingSubscription,
            Stage::GeneratingLoad,
            Stage::CleaningUp,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(Stage::CleaningUp.next(), None);
        assert_eq!(Stage::TimedOut.next(), None);
        assert!(Stage::TimedOut.is_terminal());
        assert!(!Stage::GeneratingLoad.is_terminal());
    }

    #[tokio::test]
    async fn advance_only_steps_forward_by_one() {
        let mut s = state();
        assert_matches!(
            s.advance(Stage::CreatingSubscription),
            Err(SessionError::IllegalTransition { from: Stage::SigningIn, .. })
        );
        s.advance(Stage::UsingScope).unwrap();
        assert_matches!(
            s.advance(Stage::SigningIn),
            Err(SessionError::IllegalTransition { .. })
        );
        assert_matches!(s.advance(Stage::TimedOut), Err(_));
        assert_eq!(s.stage(), Stage::UsingScope);
    }

    #[tokio::test]
    async fn timed_out_reachable_from_any_stage() {
        let mut s = state();
        s.force_timed_out();
        assert_eq!(s.stage(), Stage::TimedOut);
        assert_matches!(s.advance(Stage::CleaningUp), Err(_));
    }

    #[tokio::test]
    async fn subscription_set_exactly_once() {
        let mut s = state();
        s.set_subscription(SubscriptionHandle::from("a")).unwrap();
        assert_matches!(
            s.set_subscription(SubscriptionHandle::from("b")),
            Err(SessionError::DuplicateSubscription)
        );
        assert_eq!(s.subscription().unwrap().as_str(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn completed_teardown_cancels_everything() {
        let mut s = state();
        let _ = s.install_deadline(Duration::from_secs(60));
        s.start_load_wait(Duration::from_secs(10));
        let _ = s
            .timers_mut()
            .schedule_every(TimerPurpose::Keepalive, Duration::from_secs(1));

        assert!(s.teardown(TeardownKind::Completed).unwrap());
        assert!(s.timers().is_empty());
        assert_eq!(s.stats().timers_cancelled, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_runs_once() {
        let mut s = state();
        let _ = s.install_deadline(Duration::from_secs(60));
        assert!(s.teardown(TeardownKind::Aborted).unwrap());
        assert!(!s.teardown(TeardownKind::Completed).unwrap());
        assert!(!s.teardown(TeardownKind::Expired).unwrap());
        assert_eq!(s.stats().timers_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_teardown_spares_deadline() {
        let mut s = state();
        let deadline = s.install_deadline(Duration::from_secs(60));
        let _ = s
            .timers_mut()
            .schedule_every(TimerPurpose::Keepalive, Duration::from_secs(1));
        s.force_timed_out();

        assert!(s.teardown(TeardownKind::Expired).unwrap());
        assert_eq!(s.timers().len(), 1);
        assert!(s.timers().is_active(deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_teardown_with_pending_is_invariant_violation() {
        let mut s = state();
        s.add_pending(CorrelationId::from("create_x_r"));
        s.start_load_wait(Duration::from_secs(10));

        assert_matches!(
            s.teardown(TeardownKind::Completed),
            Err(SessionError::InvariantViolation(_))
        );
        assert!(s.timers().is_empty());
        assert!(s.is_torn_down());
    }

    #[tokio::test(start_paused = true)]
    async fn install_deadline_is_single() {
        let mut s = state();
        let a = s.install_deadline(Duration::from_secs(1));
        let b = s.install_deadline(Duration::from_secs(2));
        assert_eq!(a, b);
        assert_eq!(s.timers().len(), 1);
    }

    #[test]
    fn stage_serde_and_display() {
        assert_eq!(
            serde_json::to_string(&Stage::CreatingSubscription).unwrap(),
            "\"creating_subscription\""
        );
        assert_eq!(Stage::CreatingSubscription.to_string(), "CreatingSubscription");
    }
}
