//! Immutable per-session configuration record.

use std::time::Duration;

use lqbench_settings::{BenchSettings, DeadlinePolicy};

/// Everything a session needs, fixed at session start.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// WebSocket RPC endpoint.
    pub url: String,
    /// Sign-in user.
    pub username: String,
    /// Sign-in password.
    pub password: String,
    /// Namespace selected by `use`.
    pub namespace: String,
    /// Database selected by `use`.
    pub database: String,
    /// Statement creating the live subscription.
    pub live_query: String,
    /// Statement issued per burst write.
    pub write_query: String,
    /// Writes per burst.
    pub burst_size: usize,
    /// Bounded wait for burst acknowledgements.
    pub load_wait: Duration,
    /// Ping cadence.
    pub keepalive_interval: Duration,
    /// Session-wide deadline, measured from session start.
    pub deadline: Duration,
    /// How an expired session is reported.
    pub deadline_policy: DeadlinePolicy,
}

impl SessionConfig {
    /// Derive a session record from loaded settings.
    pub fn from_settings(settings: &BenchSettings) -> Self {
        Self {
            url: settings.target.url.clone(),
            username: settings.target.username.clone(),
            password: settings.target.password.clone(),
            namespace: settings.target.namespace.clone(),
            database: settings.target.database.clone(),
            live_query: settings.workload.live_query.clone(),
            write_query: settings.workload.write_query.clone(),
            burst_size: settings.workload.burst_size,
            load_wait: Duration::from_millis(settings.workload.load_wait_ms),
            keepalive_interval: Duration::from_millis(settings.workload.keepalive_interval_ms),
            deadline: settings.scenario.session_deadline(),
            deadline_policy: settings.deadline_policy,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&BenchSettings::default())
    }
}
