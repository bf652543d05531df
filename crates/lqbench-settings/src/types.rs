//! Settings record: target backend, workload shape, scenario, and policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound on the burst size accepted by [`BenchSettings::validate`].
pub const MAX_BURST_SIZE: usize = 10_000;

/// Root settings record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BenchSettings {
    /// Backend address and credentials.
    pub target: TargetSettings,
    /// Per-session workload.
    pub workload: WorkloadSettings,
    /// Virtual-user scenario.
    pub scenario: ScenarioSettings,
    /// How a session that hits its deadline is reported.
    pub deadline_policy: DeadlinePolicy,
}

/// Backend address, credentials, and working scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetSettings {
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
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/rpc".to_string(),
            username: "root".to_string(),
            password: "root".to_string(),
            namespace: "k6".to_string(),
            database: "k6".to_string(),
        }
    }
}

/// What each session does once signed in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadSettings {
    /// Statement that creates the live subscription.
    pub live_query: String,
    /// Statement issued for every write in the burst.
    pub write_query: String,
    /// Number of writes issued per session.
    pub burst_size: usize,
    /// Upper bound on waiting for burst acknowledgements, in milliseconds.
    pub load_wait_ms: u64,
    /// WebSocket ping interval, in milliseconds.
    pub keepalive_interval_ms: u64,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            live_query: "LIVE SELECT * FROM bench".to_string(),
            write_query: "CREATE bench SET at = time::now()".to_string(),
            burst_size: 50,
            load_wait_ms: 10_000,
            keepalive_interval_ms: 30_000,
        }
    }
}

/// Virtual-user scenario.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScenarioSettings {
    /// Length of the load window in seconds.
    pub duration_secs: u64,
    /// Extra time a session may run past the window before its deadline.
    pub grace_secs: u64,
    /// Concurrent virtual users.
    pub vus: usize,
    /// Time allowed for in-flight sessions after the window closes.
    pub ramp_down_secs: u64,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            grace_secs: 15,
            vus: 1,
            ramp_down_secs: 10,
        }
    }
}

impl ScenarioSettings {
    /// Session-wide deadline: the load window plus grace.
    pub fn session_deadline(&self) -> Duration {
        Duration::from_secs(self.duration_secs.saturating_add(self.grace_secs))
    }

    /// Load window during which virtual users start new sessions.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Reporting policy for a session whose deadline fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeadlinePolicy {
    /// The session is reported failed.
    #[default]
    Fail,
    /// A session that was still generating load without any violation is
    /// reported slow rather than failed.
    SlowPass,
}

impl std::str::FromStr for DeadlinePolicy {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "slowpass" | "slow_pass" | "slow-pass" => Ok(Self::SlowPass),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown deadline policy '{other}'"
            ))),
        }
    }
}

impl BenchSettings {
    /// Reject values no session could run with.
    pub fn validate(&self) -> Result<()> {
        if self.target.url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("target.url is empty".into()));
        }
        if self.workload.burst_size == 0 {
            return Err(SettingsError::InvalidValue(
                "workload.burstSize must be at least 1".into(),
            ));
        }
        if self.workload.burst_size > MAX_BURST_SIZE {
            return Err(SettingsError::InvalidValue(format!(
                "workload.burstSize {} exceeds {MAX_BURST_SIZE}",
                self.workload.burst_size
            )));
        }
        if self.workload.keepalive_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "workload.keepaliveIntervalMs must be positive".into(),
            ));
        }
        if self.scenario.vus == 0 {
            return Err(SettingsError::InvalidValue(
                "scenario.vus must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
