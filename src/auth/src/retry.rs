// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::Result;
use crate::errors::{CredentialsError, from_http_error};
use gax::backoff_policy::BackoffPolicy;
use gax::error::Error;
use gax::exponential_backoff::ExponentialBackoffBuilder;
use gax::retry_loop_internal::retry_loop;
use gax::retry_policy::{RetryPolicy, RetryPolicyExt};
use gax::retry_result::RetryResult;
use gax::retry_state::RetryState;
use gax::retry_throttler::{AdaptiveThrottler, RetryThrottlerArg, SharedRetryThrottler};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Controls how calls to the IAM credentials service are retried.
///
/// Only server errors (HTTP 5xx) are retried. Client errors fail on the first
/// attempt. The delay between attempts grows exponentially, starting at
/// `initial_delay`, multiplied by `multiplier` after each attempt, and capped
/// at `max_delay`. Each delay is randomized (full jitter) between zero and the
/// computed value.
///
/// The backoff is clamped to sane ranges when it is used: `max_delay` to
/// `[1s, 1 day]`, `initial_delay` to `[1ms, max_delay]`, and `multiplier` to
/// `[1.0, 32.0]`.
///
/// # Example
/// ```
/// # use google_cloud_credentials::retry::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::default()
///     .with_max_attempts(2)
///     .with_initial_delay(Duration::from_millis(100));
/// assert_eq!(config.max_attempts(), 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryConfig {
    /// Four attempts in total, with delays starting at 1s and doubling up to 10s.
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Sets the total number of attempts, including the first one.
    ///
    /// Values below 1 are treated as 1.
    pub fn with_max_attempts(mut self, v: u32) -> Self {
        self.max_attempts = v.max(1);
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_delay(mut self, v: Duration) -> Self {
        self.initial_delay = v;
        self
    }

    /// Sets the upper bound for the delay between attempts.
    pub fn with_max_delay(mut self, v: Duration) -> Self {
        self.max_delay = v;
        self
    }

    /// Sets the growth factor for the delay. Values below 1.0 are treated as 1.0.
    pub fn with_multiplier(mut self, v: f64) -> Self {
        self.multiplier = if v.is_finite() { v.max(1.0) } else { 1.0 };
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub(crate) fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        Arc::new(ServerErrors.with_attempt_limit(self.max_attempts))
    }

    pub(crate) fn backoff_policy(&self) -> Arc<dyn BackoffPolicy> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_delay(self.initial_delay)
            .with_maximum_delay(self.max_delay)
            .with_scaling(self.multiplier)
            .clamp();
        Arc::new(backoff)
    }
}

/// Retries server errors (HTTP 5xx) and nothing else.
#[derive(Debug)]
struct ServerErrors;

impl RetryPolicy for ServerErrors {
    fn on_error(&self, _state: &RetryState, error: Error) -> RetryResult {
        match error.http_status_code() {
            Some(code) if (500..600).contains(&code) => RetryResult::Continue(error),
            _ => RetryResult::Permanent(error),
        }
    }
}

/// A throttler shared by all the calls made through one client.
pub(crate) fn new_throttler() -> SharedRetryThrottler {
    let throttler: RetryThrottlerArg = AdaptiveThrottler::default().into();
    throttler.into()
}

/// Sends a request, retrying on server errors as configured.
///
/// `send` is invoked once per attempt and must produce an identical request
/// each time. Any response other than a server error is returned to the
/// caller, who is responsible for interpreting it.
pub(crate) async fn send_with_retry<F, Fut>(
    config: &RetryConfig,
    throttler: SharedRetryThrottler,
    operation: &str,
    mut send: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>> + Send,
{
    let sleep = async |d| tokio::time::sleep(d).await;
    let attempts = AtomicU32::new(0);
    let result = retry_loop(
        async |_| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let response = send().await.map_err(|e| {
                Error::io(from_http_error(
                    e,
                    &format!("failed to send {operation} request"),
                ))
            })?;
            let status = response.status();
            if !status.is_server_error() {
                return Ok(response);
            }
            tracing::warn!(operation, attempt, %status, "request failed with a server error");
            let headers = response.headers().clone();
            let payload = response.bytes().await.unwrap_or_default();
            Err(Error::http(status.as_u16(), headers, payload))
        },
        sleep,
        true,
        throttler,
        config.retry_policy(),
        config.backoff_policy(),
    )
    .await;
    result.map_err(|e| as_credentials_error(e, operation, attempts.load(Ordering::Relaxed)))
}

fn as_credentials_error(error: Error, operation: &str, attempts: u32) -> CredentialsError {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(&error);
    while let Some(e) = current {
        if let Some(e) = e.downcast_ref::<CredentialsError>() {
            return e.clone();
        }
        if let Some(e) = e.downcast_ref::<Error>() {
            if let Some(status) = e.http_status_code() {
                let body = e
                    .http_payload()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                return CredentialsError::from_msg(
                    true,
                    format!(
                        "{operation} failed after {attempts} attempts, last status={status}, body=<{body}>"
                    ),
                );
            }
        }
        current = e.source();
    }
    CredentialsError::new(false, format!("{operation} failed"), error)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http::HeaderMap;
    use httptest::cycle;
    use httptest::matchers::request;
    use httptest::responders::status_code;
    use httptest::{Expectation, Server};
    use test_case::test_case;

    /// Retries after (at most) a millisecond.
    pub(crate) fn no_delay() -> RetryConfig {
        RetryConfig::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_multiplier(1.0)
    }

    fn http_error(code: u16) -> Error {
        Error::http(code, HeaderMap::new(), "body".into())
    }

    #[test]
    fn defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(10));
        assert_eq!(config.multiplier(), 2.0);
    }

    #[test]
    fn setters_clamp() {
        let config = RetryConfig::default()
            .with_max_attempts(0)
            .with_multiplier(0.5);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.multiplier(), 1.0);

        let config = RetryConfig::default().with_multiplier(f64::NAN);
        assert_eq!(config.multiplier(), 1.0);
    }

    #[test_case(500)]
    #[test_case(502)]
    #[test_case(503)]
    #[test_case(504)]
    fn server_errors_continue(code: u16) {
        let got = ServerErrors.on_error(&RetryState::new(true), http_error(code));
        assert!(matches!(got, RetryResult::Continue(_)), "{got:?}");
    }

    #[test_case(400)]
    #[test_case(401)]
    #[test_case(403)]
    #[test_case(404)]
    #[test_case(429)]
    fn client_errors_are_permanent(code: u16) {
        let got = ServerErrors.on_error(&RetryState::new(true), http_error(code));
        assert!(matches!(got, RetryResult::Permanent(_)), "{got:?}");
    }

    #[test]
    fn io_errors_are_permanent() {
        let got = ServerErrors.on_error(&RetryState::new(true), Error::io("connection reset"));
        assert!(matches!(got, RetryResult::Permanent(_)), "{got:?}");
    }

    #[test]
    fn attempt_limit() {
        let policy = RetryConfig::default().retry_policy();

        let state = RetryState::new(true).set_attempt_count(3_u32);
        let got = policy.on_error(&state, http_error(503));
        assert!(matches!(got, RetryResult::Continue(_)), "{got:?}");

        let state = RetryState::new(true).set_attempt_count(4_u32);
        let got = policy.on_error(&state, http_error(503));
        assert!(matches!(got, RetryResult::Exhausted(_)), "{got:?}");

        let state = RetryState::new(true).set_attempt_count(1_u32);
        let got = policy.on_error(&state, http_error(400));
        assert!(matches!(got, RetryResult::Permanent(_)), "{got:?}");
    }

    #[tokio::test]
    async fn client_error_is_returned() -> anyhow::Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/test"))
                .times(1)
                .respond_with(status_code(404)),
        );
        let client = reqwest::Client::new();
        let url = server.url("/test").to_string();
        let response = send_with_retry(&no_delay(), new_throttler(), "test", || {
            client.get(&url).send()
        })
        .await?;
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn server_error_then_success() -> anyhow::Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/test"))
                .times(2)
                .respond_with(cycle![status_code(503), status_code(200).body("ok")]),
        );
        let client = reqwest::Client::new();
        let url = server.url("/test").to_string();
        let response = send_with_retry(&no_delay(), new_throttler(), "test", || {
            client.get(&url).send()
        })
        .await?;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await?, "ok");
        Ok(())
    }

    #[tokio::test]
    async fn exhausted() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/test"))
                .times(2)
                .respond_with(cycle![
                    status_code(500).body("first"),
                    status_code(502).body("second"),
                ]),
        );
        let client = reqwest::Client::new();
        let url = server.url("/test").to_string();
        let config = no_delay().with_max_attempts(2);
        let err = send_with_retry(&config, new_throttler(), "test", || {
            client.get(&url).send()
        })
        .await
        .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        let msg = err.to_string();
        assert!(msg.contains("after 2 attempts"), "{msg}");
        assert!(msg.contains("502"), "{msg}");
        assert!(msg.contains("second"), "{msg}");
    }

    #[tokio::test]
    async fn transport_error_is_not_retried() {
        let server = Server::run();
        let url = server.url("/test").to_string();
        drop(server);
        let client = reqwest::Client::new();
        let err = send_with_retry(&no_delay(), new_throttler(), "test", || {
            client.get(&url).send()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to send test request"), "{err}");
    }
}
