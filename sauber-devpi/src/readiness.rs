//! Waits for the server's status endpoint to answer.

use std::future::Future;

use reqwest::StatusCode;
use tokio::time::{Duration, Instant, sleep, timeout_at};
use tracing::{error, info, trace};
use url::Url;

use crate::util::endpoint;

/// Fixed delay between probes. Also bounds each individual probe request.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// devpi's JSON API description, served once startup has finished.
pub const STATUS_PATH: &str = "+api";

/// Run `check` every `interval` until it succeeds or `timeout` elapses.
///
/// A `false` result is never returned before `timeout` has elapsed. The last
/// check starts no later than the deadline and is abandoned one `interval`
/// after it, so the total wait never exceeds `timeout + interval`.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let attempts = async {
        loop {
            if check().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(interval.min(deadline - now)).await;
        }
    };
    timeout_at(deadline + interval, attempts)
        .await
        .unwrap_or(false)
}

/// One status request. Connection errors and non-200 answers are "not ready".
pub async fn probe(http: &reqwest::Client, status_url: &Url) -> bool {
    match http
        .get(status_url.clone())
        .timeout(POLL_INTERVAL)
        .send()
        .await
    {
        Ok(response) if response.status() == StatusCode::OK => true,
        Ok(response) => {
            trace!(status = %response.status(), "server not ready yet");
            false
        }
        Err(err) => {
            trace!(error = %err, "server not reachable yet");
            false
        }
    }
}

/// Poll `<base>/+api` once per second until it answers 200 or `timeout`
/// elapses.
pub async fn wait_for_server(
    http: &reqwest::Client,
    base: &Url,
    timeout: Duration,
) -> bool {
    let status_url = match endpoint(base, STATUS_PATH) {
        Ok(url) => url,
        Err(err) => {
            error!(base = %base, error = %err, "Invalid status endpoint");
            return false;
        }
    };

    info!(url = %base, "Waiting for server to become ready...");
    let status_url = &status_url;
    let ready =
        poll_until(timeout, POLL_INTERVAL, || probe(http, status_url)).await;
    if ready {
        info!("Server is ready.");
    } else {
        error!(
            timeout = %humantime::format_duration(timeout),
            "Server did not become ready in time."
        );
    }
    ready
}
