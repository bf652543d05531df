//! Metric names recorded by sessions.
//!
//! Recording goes through the `metrics` facade; nothing is exported unless
//! the binary installs a recorder.

/// Sessions started (counter).
pub const SESSIONS_STARTED_TOTAL: &str = "sessions_started_total";
/// Sessions that passed (counter).
pub const SESSIONS_COMPLETED_TOTAL: &str = "sessions_completed_total";
/// Sessions that did not pass (counter, labels: code).
pub const SESSIONS_FAILED_TOTAL: &str = "sessions_failed_total";
/// Session wall time in seconds (histogram, labels: status).
pub const SESSION_DURATION_SECONDS: &str = "session_duration_seconds";
/// Burst writes acknowledged (counter).
pub const WRITES_ACKNOWLEDGED_TOTAL: &str = "session_writes_acknowledged_total";
/// Notifications matched to a subscription (counter).
pub const NOTIFICATIONS_TOTAL: &str = "session_notifications_total";
/// Responses with an unknown correlation id (counter).
pub const CORRELATION_MISMATCHES_TOTAL: &str = "session_correlation_mismatches_total";
/// Sessions stopped by their deadline (counter).
pub const DEADLINE_EXCEEDED_TOTAL: &str = "session_deadline_exceeded_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            SESSIONS_STARTED_TOTAL,
            SESSIONS_COMPLETED_TOTAL,
            SESSIONS_FAILED_TOTAL,
            SESSION_DURATION_SECONDS,
            WRITES_ACKNOWLEDGED_TOTAL,
            NOTIFICATIONS_TOTAL,
            CORRELATION_MISMATCHES_TOTAL,
            DEADLINE_EXCEEDED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
