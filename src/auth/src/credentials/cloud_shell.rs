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

//! [Cloud Shell] credentials.
//!
//! Cloud Shell runs a local service that hands out access tokens for the
//! signed-in user. The service listens on the port named by the
//! `DEVSHELL_CLIENT_PORT` environment variable.
//!
//! [Cloud Shell]: https://cloud.google.com/shell/docs

use crate::build_errors::Error as BuilderError;
use crate::credentials::{CachedCredentials, Credentials};
use crate::errors::CredentialsError;
use crate::token::{AccessToken, TokenProvider};
use crate::{BuildResult, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEVSHELL_CLIENT_PORT: &str = "DEVSHELL_CLIENT_PORT";
const GET_AUTH_TOKEN_REQUEST: &[u8] = b"2\n[]\n";
const ACCESS_TOKEN_INDEX: usize = 2;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_LENGTH: usize = 64 * 1024;
const MSG: &str = "failed to fetch token from the Cloud Shell service";

/// Returns the Cloud Shell port, if `DEVSHELL_CLIENT_PORT` is set.
pub(crate) fn port_from_env() -> BuildResult<Option<u16>> {
    match std::env::var(DEVSHELL_CLIENT_PORT) {
        Ok(port) if !port.is_empty() => port.trim().parse().map(Some).map_err(|e| {
            BuilderError::parsing(format!("invalid {DEVSHELL_CLIENT_PORT} value <{port}>: {e}"))
        }),
        _ => Ok(None),
    }
}

/// A builder for Cloud Shell [Credentials].
#[derive(Debug)]
pub struct Builder {
    port: u16,
    quota_project_id: Option<String>,
}

impl Builder {
    /// Creates a builder for the service listening on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            quota_project_id: None,
        }
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    pub fn build(self) -> Credentials {
        Credentials::from(CachedCredentials::new(
            CloudShellTokenProvider { port: self.port },
            self.quota_project_id,
        ))
    }
}

#[derive(Debug)]
struct CloudShellTokenProvider {
    port: u16,
}

impl CloudShellTokenProvider {
    async fn fetch(&self) -> Result<String> {
        let mut stream = TcpStream::connect(("localhost", self.port))
            .await
            .map_err(|e| CredentialsError::new(true, MSG, e))?;
        stream
            .write_all(GET_AUTH_TOKEN_REQUEST)
            .await
            .map_err(|e| CredentialsError::new(true, MSG, e))?;

        // The response is `{length}\n{json array of length bytes}`.
        let mut reader = BufReader::new(stream);
        let mut header = String::new();
        reader
            .read_line(&mut header)
            .await
            .map_err(|e| CredentialsError::new(true, MSG, e))?;
        let length: usize = header.trim().parse().map_err(|e| {
            CredentialsError::new(false, format!("{MSG}, invalid length <{}>", header.trim()), e)
        })?;
        if length > MAX_RESPONSE_LENGTH {
            return Err(CredentialsError::from_msg(
                false,
                format!("{MSG}, response length {length} exceeds {MAX_RESPONSE_LENGTH} bytes"),
            ));
        }
        let mut body = vec![0_u8; length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| CredentialsError::new(true, MSG, e))?;

        let message: Vec<serde_json::Value> = serde_json::from_slice(&body)
            .map_err(|e| CredentialsError::new(false, format!("{MSG}, invalid response"), e))?;
        match message.get(ACCESS_TOKEN_INDEX) {
            Some(serde_json::Value::String(token)) => Ok(token.clone()),
            _ => Err(CredentialsError::from_msg(
                false,
                format!("{MSG}, the response has no access token"),
            )),
        }
    }
}

#[async_trait]
impl TokenProvider for CloudShellTokenProvider {
    async fn token(&self) -> Result<AccessToken> {
        tracing::debug!(port = self.port, "fetching access token from Cloud Shell");
        let token = tokio::time::timeout(READ_TIMEOUT, self.fetch())
            .await
            .map_err(|e| CredentialsError::new(true, MSG, e))??;
        Ok(AccessToken::new(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_env::ScopedEnv;
    use serial_test::serial;
    use tokio::net::TcpListener;

    type TestResult = anyhow::Result<()>;

    /// Serves a single request, replying with `response`.
    async fn fake_shell<S: Into<String>>(
        response: S,
    ) -> anyhow::Result<(u16, tokio::task::JoinHandle<Vec<u8>>)> {
        let response = response.into();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0_u8; GET_AUTH_TOKEN_REQUEST.len()];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        Ok((port, handle))
    }

    #[tokio::test]
    async fn token_success() -> TestResult {
        let body = r#"["test-user","test-project","test-access-token",3600]"#;
        let (port, server) = fake_shell(format!("{}\n{body}", body.len())).await?;

        let credentials = Builder::new(port)
            .with_quota_project_id("test-quota-project")
            .build();
        let headers = credentials.headers().await?;
        assert_eq!(
            headers.get(http::header::AUTHORIZATION).unwrap(),
            "Bearer test-access-token"
        );
        assert_eq!(
            headers.get(crate::headers_util::QUOTA_PROJECT_KEY).unwrap(),
            "test-quota-project"
        );
        assert_eq!(server.await?, GET_AUTH_TOKEN_REQUEST.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn token_missing() -> TestResult {
        let (port, _server) = fake_shell("4\n[\"\"]").await?;
        let credentials = Builder::new(port).build();
        let err = credentials.access_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn length_too_large() -> TestResult {
        let (port, _server) = fake_shell(format!("{}\n[]", MAX_RESPONSE_LENGTH + 1)).await?;
        let credentials = Builder::new(port).build();
        let err = credentials.access_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("exceeds"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn bad_length() -> TestResult {
        let (port, _server) = fake_shell("abc\n[]").await?;
        let credentials = Builder::new(port).build();
        let err = credentials.access_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("invalid length"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn connection_refused() -> TestResult {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        drop(listener);
        let credentials = Builder::new(port).build();
        let err = credentials.access_token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        Ok(())
    }

    #[test]
    #[serial]
    fn port_env() -> TestResult {
        let _e = ScopedEnv::remove(DEVSHELL_CLIENT_PORT);
        assert_eq!(port_from_env()?, None);

        let _e = ScopedEnv::set(DEVSHELL_CLIENT_PORT, "");
        assert_eq!(port_from_env()?, None);

        let _e = ScopedEnv::set(DEVSHELL_CLIENT_PORT, "4242");
        assert_eq!(port_from_env()?, Some(4242));

        let _e = ScopedEnv::set(DEVSHELL_CLIENT_PORT, "not-a-port");
        let err = port_from_env().unwrap_err();
        assert!(err.is_parsing(), "{err:?}");
        Ok(())
    }

    #[test]
    fn debug() {
        let credentials = Builder::new(4242).build();
        let fmt = format!("{credentials:?}");
        assert!(fmt.contains("CloudShellTokenProvider"), "{fmt}");
        assert!(fmt.contains("4242"), "{fmt}");
    }
}
