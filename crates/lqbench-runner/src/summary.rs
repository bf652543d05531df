//! End-of-run summary report.

use std::collections::BTreeMap;

use lqbench_session::{SessionReport, SessionStatus};
use lqbench_settings::BenchSettings;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Summary {
    pub generated_at: String,
    pub target: String,
    pub vus: usize,
    pub duration_secs: u64,
    pub burst_size: usize,
    pub totals: Totals,
    pub failures_by_code: BTreeMap<String, usize>,
    pub session_duration_ms: DurationStats,
    pub sessions: Vec<SessionReport>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub sessions: usize,
    pub passed: usize,
    pub slow: usize,
    pub failed: usize,
    pub requests_sent: u64,
    pub writes_acknowledged: u64,
    pub notifications: u64,
    pub correlation_mismatches: u64,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl Summary {
    /// Aggregate session reports. Transcripts are dropped unless asked for.
    pub fn build(
        mut sessions: Vec<SessionReport>,
        settings: &BenchSettings,
        include_transcripts: bool,
    ) -> Self {
        let mut totals = Totals {
            sessions: sessions.len(),
            ..Totals::default()
        };
        let mut failures_by_code = BTreeMap::new();
        let mut durations = Vec::with_capacity(sessions.len());

        for report in &mut sessions {
            match report.status {
                SessionStatus::Passed => totals.passed += 1,
                SessionStatus::Slow => totals.slow += 1,
                SessionStatus::Failed => totals.failed += 1,
            }
            if let Some(code) = &report.error_code {
                *failures_by_code.entry(code.clone()).or_insert(0) += 1;
            }
            totals.requests_sent += report.stats.requests_sent;
            totals.writes_acknowledged += report.stats.writes_acknowledged;
            totals.notifications += report.stats.notifications;
            totals.correlation_mismatches += report.stats.correlation_mismatches;
            durations.push(report.elapsed_ms as f64);

            if !include_transcripts {
                report.transcript = None;
            }
        }

        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            target: settings.target.url.clone(),
            vus: settings.scenario.vus,
            duration_secs: settings.scenario.duration_secs,
            burst_size: settings.workload.burst_size,
            totals,
            failures_by_code,
            session_duration_ms: summarize_durations(&durations),
            sessions,
        }
    }
}

fn summarize_durations(durations_ms: &[f64]) -> DurationStats {
    if durations_ms.is_empty() {
        return DurationStats {
            count: 0,
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
            mean: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }

    let mut sorted = durations_ms.to_vec();
    sorted.sort_by(f64::total_cmp);
    let len = sorted.len();
    let mean = sorted.iter().sum::<f64>() / len as f64;

    DurationStats {
        count: len,
        p50: sorted[percentile_index(len, 0.50)],
        p95: sorted[percentile_index(len, 0.95)],
        p99: sorted[percentile_index(len, 0.99)],
        mean,
        min: sorted[0],
        max: sorted[len - 1],
    }
}

fn percentile_index(len: usize, percentile: f64) -> usize {
    if len <= 1 {
        return 0;
    }
    let rank = ((len - 1) as f64 * percentile).round() as usize;
    rank.min(len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lqbench_core::RunId;
    use lqbench_session::{SessionStats, Stage, Transcript};

    fn report(status: SessionStatus, code: Option<&str>, elapsed_ms: u64) -> SessionReport {
        SessionReport {
            run_id: RunId::generate(),
            status,
            error_code: code.map(str::to_owned),
            error_message: code.map(|c| format!("{c} happened")),
            final_stage: if status == SessionStatus::Passed {
                Stage::CleaningUp
            } else {
                Stage::TimedOut
            },
            elapsed_ms,
            stats: SessionStats {
                requests_sent: 53,
                writes_acknowledged: 50,
                notifications: 50,
                ..SessionStats::default()
            },
            transcript: (status != SessionStatus::Passed).then(Transcript::default),
        }
    }

    #[test]
    fn empty_durations_are_zero() {
        let stats = summarize_durations(&[]);
        assert_eq!(stats.count, 0);
        assert!(stats.p50.abs() < f64::EPSILON);
        assert!(stats.p99.abs() < f64::EPSILON);
        assert!(stats.max.abs() < f64::EPSILON);
    }

    #[test]
    fn percentiles_use_rounded_rank() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let stats = summarize_durations(&values);
        assert!((stats.p50 - 51.0).abs() < f64::EPSILON);
        assert!((stats.p95 - 95.0).abs() < f64::EPSILON);
        assert!((stats.p99 - 99.0).abs() < f64::EPSILON);
        assert_eq!(stats.count, 100);
        assert!((stats.min - 1.0).abs() < f64::EPSILON);
        assert!((stats.max - 100.0).abs() < f64::EPSILON);
        assert!((stats.mean - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn single_sample_percentiles() {
        assert_eq!(percentile_index(1, 0.95), 0);
        assert_eq!(percentile_index(2, 0.95), 1);
    }

    #[test]
    fn totals_and_failure_codes() {
        let sessions = vec![
            report(SessionStatus::Passed, None, 100),
            report(SessionStatus::Passed, None, 120),
            report(SessionStatus::Failed, Some("DEADLINE_EXCEEDED"), 75_000),
            report(SessionStatus::Failed, Some("PROTOCOL_VIOLATION"), 30),
            report(SessionStatus::Slow, Some("DEADLINE_EXCEEDED"), 75_000),
        ];
        let summary = Summary::build(sessions, &BenchSettings::default(), false);

        assert_eq!(summary.totals.sessions, 5);
        assert_eq!(summary.totals.passed, 2);
        assert_eq!(summary.totals.failed, 2);
        assert_eq!(summary.totals.slow, 1);
        assert_eq!(summary.totals.writes_acknowledged, 250);
        assert_eq!(summary.failures_by_code["DEADLINE_EXCEEDED"], 2);
        assert_eq!(summary.failures_by_code["PROTOCOL_VIOLATION"], 1);
        assert_eq!(summary.session_duration_ms.count, 5);
        assert!((summary.session_duration_ms.p99 - 75_000.0).abs() < f64::EPSILON);
        assert!(summary.sessions.iter().all(|s| s.transcript.is_none()));
    }

    #[test]
    fn transcripts_kept_on_request() {
        let sessions = vec![report(SessionStatus::Failed, Some("CONNECTION_ERROR"), 5)];
        let summary = Summary::build(sessions, &BenchSettings::default(), true);
        assert!(summary.sessions[0].transcript.is_some());

        let v = serde_json::to_value(&summary).unwrap();
        assert_eq!(v["totals"]["failed"], 1);
        assert_eq!(v["failures_by_code"]["CONNECTION_ERROR"], 1);
        assert!(v["generated_at"].is_string());
        assert!(v["sessions"][0]["transcript"].is_array());
    }
}
