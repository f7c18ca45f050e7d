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

//! Credentials holding a fixed access token.
//!
//! Use these credentials when the application obtains the access token by
//! some other means. The credentials cannot refresh the token, once it
//! expires every request fails.
//!
//! ```
//! # use google_cloud_credentials::credentials::access_token::Builder;
//! # use google_cloud_credentials::token::AccessToken;
//! # tokio_test::block_on(async {
//! let credentials = Builder::new(AccessToken::new("my-access-token")).build();
//! let headers = credentials.headers().await?;
//! assert_eq!(headers.get("authorization").unwrap(), "Bearer my-access-token");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::credentials::{Credentials, CredentialsProvider};
use crate::errors::CredentialsError;
use crate::headers_util::build_bearer_headers;
use crate::token::AccessToken;
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;

/// A builder for credentials holding a fixed access token.
#[derive(Debug)]
pub struct Builder {
    token: AccessToken,
    quota_project_id: Option<String>,
    clock: Arc<dyn Clock>,
}

impl Builder {
    /// Creates a builder for the given token.
    pub fn new(token: AccessToken) -> Self {
        Self {
            token,
            quota_project_id: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets the clock used to detect an expired token.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    pub fn build(self) -> Credentials {
        Credentials::from(StaticTokenCredentials {
            token: self.token,
            quota_project_id: self.quota_project_id,
            clock: self.clock,
        })
    }
}

#[derive(Debug)]
struct StaticTokenCredentials {
    token: AccessToken,
    quota_project_id: Option<String>,
    clock: Arc<dyn Clock>,
}

impl StaticTokenCredentials {
    fn current(&self) -> Result<AccessToken> {
        if self.token.expires_within(self.clock.now(), Duration::ZERO) {
            return Err(CredentialsError::illegal_state(
                "the access token has expired and these credentials cannot refresh it",
            ));
        }
        Ok(self.token.clone())
    }
}

impl CredentialsProvider for StaticTokenCredentials {
    async fn headers(&self, _uri: Option<&str>) -> Result<HeaderMap> {
        build_bearer_headers(&self.current()?, &self.quota_project_id)
    }

    async fn access_token(&self) -> Result<AccessToken> {
        self.current()
    }

    fn cached_headers(&self, _uri: Option<&str>) -> Option<Result<HeaderMap>> {
        Some(
            self.current()
                .and_then(|t| build_bearer_headers(&t, &self.quota_project_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::FakeClock;
    use crate::headers_util::QUOTA_PROJECT_KEY;
    use http::header::AUTHORIZATION;
    use std::time::SystemTime;

    type TestResult = anyhow::Result<()>;

    #[tokio::test]
    async fn headers() -> TestResult {
        let credentials = Builder::new(AccessToken::new("test-token"))
            .with_quota_project_id("test-project")
            .build();
        let headers = credentials.headers().await?;
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
        assert!(headers.get(AUTHORIZATION).unwrap().is_sensitive());
        assert_eq!(headers.get(QUOTA_PROJECT_KEY).unwrap(), "test-project");
        Ok(())
    }

    #[tokio::test]
    async fn refresh_is_illegal_state() {
        let credentials = Builder::new(AccessToken::new("test-token")).build();
        let err = credentials.refresh().await.unwrap_err();
        assert!(err.is_illegal_state(), "{err:?}");
        assert!(!err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn expired_token_is_not_returned() -> TestResult {
        let now = SystemTime::now();
        let clock = FakeClock::new(now);
        let token = AccessToken::new("test-token").with_expires_at(now + Duration::from_secs(60));
        let credentials = Builder::new(token.clone()).with_clock(clock.clone()).build();
        assert_eq!(credentials.access_token().await?, token);

        clock.advance(Duration::from_secs(60));
        let err = credentials.headers().await.unwrap_err();
        assert!(err.is_illegal_state(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn callback_is_inline() {
        let credentials = Builder::new(AccessToken::new("test-token")).build();
        let called = Arc::new(std::sync::Mutex::new(false));
        let flag = called.clone();
        credentials.request_metadata_with_callback(
            None,
            &tokio::runtime::Handle::current(),
            move |h| {
                assert!(h.is_ok(), "{h:?}");
                *flag.lock().unwrap() = true;
            },
        );
        assert!(*called.lock().unwrap());
    }

    #[test]
    fn debug_censors_token() {
        let credentials = Builder::new(AccessToken::new("secret-test-token")).build();
        let fmt = format!("{credentials:?}");
        assert!(!fmt.contains("secret-test-token"), "{fmt}");
    }
}
