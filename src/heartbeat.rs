use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use tracing::debug;

use crate::config::HeartbeatTarget;
use crate::model::{response_time_label, ProbeResult, ProbeStatus};

/// Probes a set of HTTP targets for liveness and latency (C2). Holds one
/// shared, pooled `reqwest::Client` reused across ticks — building a new
/// client per probe would defeat connection reuse and DNS caching.
#[derive(Clone)]
pub struct Prober {
    client: Client,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober {
    pub fn new() -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Probe every target concurrently. Always returns exactly one
    /// `ProbeResult` per input target, in input order.
    pub async fn probe(&self, targets: &[HeartbeatTarget]) -> Vec<ProbeResult> {
        let futures = targets.iter().map(|target| self.probe_one(target));
        join_all(futures).await
    }

    async fn probe_one(&self, target: &HeartbeatTarget) -> ProbeResult {
        let timeout = Duration::from_secs(target.timeout_seconds.max(1));

        let Ok(url) = reqwest::Url::parse(&target.url) else {
            return ProbeResult {
                name: target.name.clone(),
                url: target.url.clone(),
                status: ProbeStatus::Down,
                response_ms: 0,
                response_time_label: response_time_label(0),
                last_checked: Utc::now(),
                error: "malformed url".to_string(),
            };
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.client.get(url).send()).await;
        let response_ms = started.elapsed().as_millis() as i64;
        let last_checked = Utc::now();

        match outcome {
            Ok(Ok(response)) => {
                let code = response.status();
                drop(response); // release the connection without reading the body
                if code.as_u16() < 400 {
                    ProbeResult {
                        name: target.name.clone(),
                        url: target.url.clone(),
                        status: ProbeStatus::Up,
                        response_ms,
                        response_time_label: response_time_label(response_ms),
                        last_checked,
                        error: String::new(),
                    }
                } else {
                    ProbeResult {
                        name: target.name.clone(),
                        url: target.url.clone(),
                        status: ProbeStatus::Down,
                        response_ms,
                        response_time_label: response_time_label(response_ms),
                        last_checked,
                        error: format!("http status {code}"),
                    }
                }
            }
            Ok(Err(err)) => {
                debug!(target = %target.name, error = %err, "probe transport error");
                ProbeResult {
                    name: target.name.clone(),
                    url: target.url.clone(),
                    status: ProbeStatus::Down,
                    response_ms,
                    response_time_label: response_time_label(response_ms),
                    last_checked,
                    error: err.to_string(),
                }
            }
            Err(_) => ProbeResult {
                name: target.name.clone(),
                url: target.url.clone(),
                status: ProbeStatus::Down,
                response_ms,
                response_time_label: response_time_label(response_ms),
                last_checked,
                error: "timed out".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_url_fails_fast_without_blocking_others() {
        let prober = Prober::new();
        let targets = vec![
            HeartbeatTarget {
                name: "bad".into(),
                url: "not a url".into(),
                timeout_seconds: 1,
            },
            HeartbeatTarget {
                name: "refused".into(),
                url: "http://127.0.0.1:1".into(),
                timeout_seconds: 1,
            },
        ];
        let results = prober.probe(&targets).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "bad");
        assert_eq!(results[0].status, ProbeStatus::Down);
        assert!(!results[0].error.is_empty());
        assert_eq!(results[1].name, "refused");
        assert_eq!(results[1].status, ProbeStatus::Down);
    }

    #[tokio::test]
    async fn empty_target_list_returns_empty_results() {
        let prober = Prober::new();
        let results = prober.probe(&[]).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn connection_refused_is_down_with_error_and_recent_timestamp() {
        let prober = Prober::new();
        let targets = vec![HeartbeatTarget {
            name: "refused".into(),
            url: "http://127.0.0.1:1".into(),
            timeout_seconds: 2,
        }];
        let before = Utc::now();
        let results = prober.probe(&targets).await;
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.status, ProbeStatus::Down);
        assert!(!result.error.is_empty());
        assert!((result.last_checked - before).num_seconds() < 3);
    }
}
