//! Virtual-user scheduling.
//!
//! Each virtual user runs sessions back to back until the load window
//! closes. Sessions still in flight then get the ramp-down window to
//! finish before they are cancelled.

use std::sync::Arc;
use std::time::Duration;

use lqbench_session::{SessionConfig, SessionDriver, SessionReport};
use lqbench_settings::BenchSettings;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a session that did not pass, so an unreachable backend
/// does not turn into a connect loop.
const FAILURE_BACKOFF: Duration = Duration::from_millis(250);

/// A load scenario: how many virtual users, for how long.
#[derive(Clone, Debug)]
pub struct Scenario {
    config: Arc<SessionConfig>,
    vus: usize,
    window: Duration,
    ramp_down: Duration,
}

impl Scenario {
    /// Scenario with explicit session config and timing.
    pub fn new(config: Arc<SessionConfig>, vus: usize, window: Duration, ramp_down: Duration) -> Self {
        Self {
            config,
            vus,
            window,
            ramp_down,
        }
    }

    /// Scenario from the `scenario` and session sections of `settings`.
    pub fn from_settings(settings: &BenchSettings) -> Self {
        Self::new(
            Arc::new(SessionConfig::from_settings(settings)),
            settings.scenario.vus,
            settings.scenario.window(),
            Duration::from_secs(settings.scenario.ramp_down_secs),
        )
    }

    /// Run every virtual user to completion and collect their reports.
    ///
    /// Cancelling `cancel` stops all users immediately; reports of sessions
    /// cut short that way are not collected.
    pub async fn run(&self, cancel: CancellationToken) -> Vec<SessionReport> {
        let started = Instant::now();
        let window_end = started + self.window;
        let hard_stop = cancel.child_token();

        info!(
            vus = self.vus,
            window_secs = self.window.as_secs(),
            ramp_down_secs = self.ramp_down.as_secs(),
            "scenario started"
        );

        let stopper = {
            let token = hard_stop.clone();
            let at = window_end + self.ramp_down;
            tokio::spawn(async move {
                sleep_until(at).await;
                token.cancel();
            })
        };

        let handles: Vec<JoinHandle<Vec<SessionReport>>> = (0..self.vus)
            .map(|vu| {
                tokio::spawn(virtual_user(
                    vu,
                    Arc::clone(&self.config),
                    window_end,
                    hard_stop.clone(),
                ))
            })
            .collect();

        let mut reports = Vec::new();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(mut batch) => reports.append(&mut batch),
                Err(e) => warn!(error = %e, "virtual user task failed"),
            }
        }
        stopper.abort();

        info!(
            sessions = reports.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            cancelled = cancel.is_cancelled(),
            "scenario finished"
        );
        reports
    }
}

async fn virtual_user(
    vu: usize,
    config: Arc<SessionConfig>,
    window_end: Instant,
    stop: CancellationToken,
) -> Vec<SessionReport> {
    let mut reports = Vec::new();
    while Instant::now() < window_end && !stop.is_cancelled() {
        let driver = SessionDriver::new(Arc::clone(&config));
        let run_id = driver.run_id().clone();
        let report = tokio::select! {
            report = driver.run() => report,
            () = stop.cancelled() => {
                debug!(vu, %run_id, "session cancelled in flight");
                break;
            }
        };

        let passed = report.passed();
        reports.push(report);
        if !passed {
            tokio::select! {
                () = sleep(FAILURE_BACKOFF) => {}
                () = stop.cancelled() => break,
            }
        }
    }
    debug!(vu, sessions = reports.len(), "virtual user done");
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use lqbench_session::SessionStatus;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    /// Backend that answers every connection with a well-behaved session.
    async fn start_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let _conn = tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(tcp).await else { return };
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let req: Value = serde_json::from_str(text.as_str()).unwrap();
                        let id = req["id"].clone();
                        let replies = match req["method"].as_str().unwrap() {
                            "signin" => vec![json!({"id": id, "result": "token"})],
                            "use" => vec![json!({"id": id, "result": null})],
                            _ if req["params"][0].as_str().unwrap().starts_with("LIVE") => {
                                vec![json!({"id": id, "result": [{"result": "sub"}]})]
                            }
                            _ => vec![
                                json!({"result": {"id": "sub", "action": "CREATE"}}),
                                json!({"id": id, "result": [{"status": "OK", "result": []}]}),
                            ],
                        };
                        for reply in replies {
                            if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        format!("ws://{addr}/rpc")
    }

    fn config(url: String) -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            url,
            burst_size: 3,
            deadline: Duration::from_secs(5),
            ..SessionConfig::default()
        })
    }

    #[tokio::test]
    async fn users_loop_until_window_closes() {
        let url = start_backend().await;
        let scenario = Scenario::new(
            config(url),
            2,
            Duration::from_millis(300),
            Duration::from_secs(2),
        );

        let reports = scenario.run(CancellationToken::new()).await;
        assert!(reports.len() >= 2, "got {}", reports.len());
        assert!(reports.iter().all(|r| r.status == SessionStatus::Passed));
        assert!(reports.iter().all(|r| r.stats.writes_acknowledged == 3));
    }

    #[tokio::test]
    async fn cancelled_scenario_starts_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scenario = Scenario::new(
            config("ws://127.0.0.1:1/rpc".into()),
            4,
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        let reports = scenario.run(cancel).await;
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn failing_sessions_back_off() {
        let scenario = Scenario::new(
            config("ws://127.0.0.1:1/rpc".into()),
            1,
            Duration::from_millis(600),
            Duration::from_secs(1),
        );

        let reports = scenario.run(CancellationToken::new()).await;
        assert!(!reports.is_empty());
        assert!(reports.len() <= 4, "got {}", reports.len());
        assert!(reports.iter().all(|r| r.status == SessionStatus::Failed));
    }

    #[test]
    fn from_settings_uses_scenario_section() {
        let mut settings = BenchSettings::default();
        settings.scenario.vus = 7;
        settings.scenario.duration_secs = 30;
        settings.scenario.ramp_down_secs = 4;
        let scenario = Scenario::from_settings(&settings);
        assert_eq!(scenario.vus, 7);
        assert_eq!(scenario.window, Duration::from_secs(30));
        assert_eq!(scenario.ramp_down, Duration::from_secs(4));
        assert_eq!(scenario.config.deadline, Duration::from_secs(45));
    }
}
