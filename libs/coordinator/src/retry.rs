//! Rate-limit-aware request retries.
//!
//! Every call loops up to `max_attempts`. A response is retried when its
//! status is one of {408, 429, 500, 502, 503, 504} or at least 512. The wait
//! before the next attempt comes from, in order: the `RateLimit-ResetTime`
//! header (RFC1123 absolute time), the `Retry-After` header (integer
//! seconds), or capped exponential backoff with jitter. Retryable response
//! bodies are fully drained before the next attempt. Dropping the returned
//! future aborts any in-progress wait.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Response, StatusCode};
use tracing::{debug, warn};

use crate::transport::TransportError;

const BACKOFF_MIN_DELAY: Duration = Duration::from_millis(100);
const BACKOFF_MAX_DELAY: Duration = Duration::from_secs(60);
const BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS: usize = 5;

const RATE_LIMIT_RESET_HEADER: &str = "RateLimit-ResetTime";
const RETRY_AFTER_HEADER: &str = "Retry-After";

pub(crate) struct RetryPolicy {
    max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Issue the request built by `build`, retrying retryable responses.
    /// Transport-level errors are returned immediately.
    pub(crate) async fn execute<F>(&self, build: F) -> Result<Response, TransportError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = Backoff::new();
        let mut attempt = 0;

        loop {
            let response = build().send().await?;
            attempt += 1;

            if !should_retry(response.status()) || attempt >= self.max_attempts {
                return Ok(response);
            }

            let status = response.status();
            let wait = wait_time(&response, &mut backoff);

            // Drain the body before the connection is reused.
            let _ = response.bytes().await;

            debug!(
                status = status.as_u16(),
                wait_ms = wait.as_millis() as u64,
                attempt,
                "Waiting before making the next call"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

pub(crate) fn should_retry(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504) || status.as_u16() >= 512
}

fn wait_time(response: &Response, backoff: &mut Backoff) -> Duration {
    if let Some(wait) = parse_reset_time(response) {
        return wait;
    }
    if let Some(wait) = parse_retry_after(response) {
        return wait;
    }
    backoff.next_delay()
}

fn parse_reset_time(response: &Response) -> Option<Duration> {
    let value = response
        .headers()
        .get(RATE_LIMIT_RESET_HEADER)?
        .to_str()
        .ok()?;

    // RFC1123 timestamps parse as RFC2822 ("Wed, 21 Oct 2015 07:28:00 GMT").
    let reset_time = match DateTime::parse_from_rfc2822(value) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                header = RATE_LIMIT_RESET_HEADER,
                value,
                error = %err,
                "Couldn't parse rate limit header"
            );
            return None;
        }
    };

    let delta = reset_time.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok().filter(|d| !d.is_zero())
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    let value = response
        .headers()
        .get(RETRY_AFTER_HEADER)?
        .to_str()
        .ok()?;

    match value.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(err) => {
            warn!(
                header = RETRY_AFTER_HEADER,
                value,
                error = %err,
                "Couldn't parse retry after header"
            );
            None
        }
    }
}

/// Exponential backoff with jitter: each delay is drawn uniformly between
/// the minimum and the current ceiling, which doubles per attempt up to the
/// maximum.
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn next_delay(&mut self) -> Duration {
        let ceiling = BACKOFF_MIN_DELAY.as_secs_f64() * BACKOFF_FACTOR.powi(self.attempt as i32);
        let ceiling = ceiling.min(BACKOFF_MAX_DELAY.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let min = BACKOFF_MIN_DELAY.as_secs_f64();
        let jittered = if ceiling > min {
            rand::rng().random_range(min..=ceiling)
        } else {
            ceiling
        };
        Duration::from_secs_f64(jittered)
    }
}
