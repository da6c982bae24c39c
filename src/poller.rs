//! Status polling loop
//!
//! Fetches the job status at a fixed interval until the job is done. A failed
//! fetch backs off exponentially with jitter; too many failures in a row end
//! the loop with the last error.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{GmailError, Result};
use crate::progress::{JobState, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(300),
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            max_consecutive_failures: 5,
        }
    }
}

impl PollSettings {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Backoff after the `failures`-th consecutive failure, with 50-100% jitter
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let ceiling = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        ceiling.mul_f64(factor)
    }
}

/// Poll `fetch` until the job reaches a terminal state
///
/// `on_status` sees every snapshot. Returns the final snapshot, or the
/// current one straight away if no job has ever run.
pub async fn poll_until_done<F, Fut, C>(
    settings: PollSettings,
    mut fetch: F,
    mut on_status: C,
) -> Result<JobStatus>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobStatus>>,
    C: FnMut(&JobStatus),
{
    let mut failures = 0;

    loop {
        match fetch().await {
            Ok(status) => {
                failures = 0;
                on_status(&status);
                if status.done || status.state == JobState::Idle {
                    return Ok(status);
                }
                tokio::time::sleep(settings.interval).await;
            }
            Err(e) => {
                failures += 1;
                if failures >= settings.max_consecutive_failures {
                    warn!("Giving up after {} failed status fetches: {}", failures, e);
                    return Err(e);
                }
                let delay = settings.backoff(failures);
                debug!("Status fetch failed ({}), retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Fetch the status of a running server
pub async fn fetch_remote_status(client: &reqwest::Client, base_url: &str) -> Result<JobStatus> {
    let url = format!("{}/api/status", base_url.trim_end_matches('/'));
    let response = client.get(&url).send().await.map_err(|e| {
        GmailError::NetworkError(format!("GET {} failed: {}", url, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(GmailError::ServerError {
            status: status.as_u16(),
            message: format!("GET {} returned {}", url, status),
        });
    }

    response
        .json::<JobStatus>()
        .await
        .map_err(|e| GmailError::InvalidRequest(format!("unexpected status payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn fast() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_consecutive_failures: 3,
        }
    }

    fn running(progress: u8) -> JobStatus {
        JobStatus {
            state: JobState::Running,
            progress,
            ..Default::default()
        }
    }

    fn finished() -> JobStatus {
        JobStatus {
            state: JobState::Done,
            progress: 100,
            done: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_is_jittered_and_capped() {
        let settings = PollSettings::default();
        for failures in 1..10 {
            let delay = settings.backoff(failures);
            let exponent = (failures - 1).min(16);
            let ceiling = (settings.base_backoff * (1u32 << exponent)).min(settings.max_backoff);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[tokio::test]
    async fn test_polls_until_done() {
        let script = Mutex::new(VecDeque::from(vec![running(10), running(60), finished()]));
        let mut seen = Vec::new();

        let last = poll_until_done(
            fast(),
            || {
                let next = script.lock().unwrap().pop_front();
                async move { next.ok_or_else(|| GmailError::Unknown("script empty".into())) }
            },
            |s| seen.push(s.progress),
        )
        .await
        .unwrap();

        assert!(last.done);
        assert_eq!(seen, vec![10, 60, 100]);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let script = Mutex::new(VecDeque::from(vec![
            Err(GmailError::NetworkError("down".into())),
            Err(GmailError::NetworkError("down".into())),
            Ok(finished()),
        ]));

        let last = poll_until_done(
            fast(),
            || {
                let next = script.lock().unwrap().pop_front();
                async move { next.unwrap_or_else(|| Err(GmailError::Unknown("empty".into()))) }
            },
            |_| {},
        )
        .await
        .unwrap();

        assert!(last.done);
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_failures() {
        let mut calls = 0;
        let result = poll_until_done(
            fast(),
            || {
                calls += 1;
                async { Err::<JobStatus, _>(GmailError::NetworkError("down".into())) }
            },
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(GmailError::NetworkError(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_idle_returns_immediately() {
        let status = poll_until_done(
            fast(),
            || async { Ok(JobStatus::default()) },
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(status.state, JobState::Idle);
    }
}
