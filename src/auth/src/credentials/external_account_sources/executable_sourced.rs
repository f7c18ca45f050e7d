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

//! Subject tokens produced by an executable, as described in [AIP-4117].
//!
//! [AIP-4117]: https://google.aip.dev/auth/4117#determining-the-subject-token-in-executable-sourced-credentials

use super::SubjectTokenContext;
use crate::build_errors::Error as BuilderError;
use crate::constants::{ID_TOKEN_TYPE, JWT_TOKEN_TYPE, SAML2_TOKEN_TYPE};
use crate::credentials::subject_token::{Builder as SubjectTokenBuilder, SubjectToken};
use crate::errors::{PluggableAuthError, PluggableAuthErrorCode};
use crate::{BuildResult, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::process::Command;

const ALLOW_EXECUTABLES_ENV: &str = "GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_TIMEOUT_MILLIS: u64 = 5_000;
const MAX_TIMEOUT_MILLIS: u64 = 120_000;
const SUPPORTED_VERSION: i64 = 1;

/// The `executable` section of the credential source, as found in the
/// configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct ExecutableConfig {
    pub command: Option<String>,
    pub timeout_millis: Option<u64>,
    pub output_file: Option<String>,
}

/// The inputs to an [ExecutableHandler].
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutableOptions {
    /// The command line, the program followed by its arguments separated by
    /// whitespace.
    pub command: String,
    /// How long to wait for the executable to finish.
    pub timeout: Duration,
    /// The file where the executable caches its response, if any.
    pub output_file: Option<String>,
    /// Environment variables set for the executable, in addition to the
    /// environment of the current process.
    pub environment: HashMap<String, String>,
}

/// Runs the executable configured in executable-sourced credentials.
///
/// The default implementation is [PluggableAuthHandler]. Applications can
/// provide their own, for example, to run the executable in a sandbox.
#[async_trait::async_trait]
pub trait ExecutableHandler: std::fmt::Debug + Send + Sync {
    /// Returns the subject token produced by the executable.
    async fn retrieve_token(
        &self,
        options: &ExecutableOptions,
    ) -> std::result::Result<String, PluggableAuthError>;
}

/// The response written by the executable to its standard output, or to the
/// output file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutableResponse {
    /// The version of the response format, only `1` is supported.
    pub version: i64,
    /// Whether the executable obtained a token.
    pub success: bool,
    /// The type of the subject token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// The expiration time of the subject token, in seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<i64>,
    /// The subject token, for OIDC token types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// The subject token, for SAML token types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saml_response: Option<String>,
    /// The error code, for unsuccessful responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// The error message, for unsuccessful responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutableResponse {
    fn is_expired(&self, now: i64) -> bool {
        self.expiration_time.is_some_and(|t| t <= now)
    }

    /// Validates the response and returns the subject token.
    fn into_subject_token(
        self,
        now: i64,
        output_file_configured: bool,
    ) -> std::result::Result<String, PluggableAuthError> {
        use PluggableAuthErrorCode as Code;
        if self.version != SUPPORTED_VERSION {
            return Err(PluggableAuthError::new(
                Code::UnsupportedVersion,
                format!(
                    "Executable returned unsupported version {}, the only supported version is {SUPPORTED_VERSION}.",
                    self.version
                ),
            ));
        }
        if !self.success {
            return match (self.code, self.message) {
                (Some(code), Some(message)) => {
                    Err(PluggableAuthError::new(Code::Executable(code), message))
                }
                _ => Err(PluggableAuthError::new(
                    Code::InvalidResponse,
                    "The executable response must contain `code` and `message` fields when unsuccessful.",
                )),
            };
        }
        if self.expiration_time.is_none() && output_file_configured {
            return Err(PluggableAuthError::new(
                Code::InvalidResponse,
                "The executable response must contain the `expiration_time` field for successful responses when an output_file has been specified in the configuration.",
            ));
        }
        if self.is_expired(now) {
            return Err(PluggableAuthError::new(
                Code::InvalidResponse,
                "The executable response is expired.",
            ));
        }
        let token_type = self.token_type.unwrap_or_default();
        let token = match token_type.as_str() {
            JWT_TOKEN_TYPE | ID_TOKEN_TYPE => self.id_token,
            SAML2_TOKEN_TYPE => self.saml_response,
            _ => {
                return Err(PluggableAuthError::new(
                    Code::InvalidResponse,
                    format!("Executable returned unsupported token type <{token_type}>."),
                ));
            }
        };
        token.filter(|t| !t.is_empty()).ok_or_else(|| {
            PluggableAuthError::new(
                Code::InvalidResponse,
                format!("The executable response does not contain a subject token for type <{token_type}>."),
            )
        })
    }
}

/// The default [ExecutableHandler].
///
/// Runs the executable only if `GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES` is
/// set to `1`. A successful, unexpired response in the output file is used
/// without running the executable.
#[derive(Debug, Default)]
pub struct PluggableAuthHandler;

impl PluggableAuthHandler {
    /// Returns the response cached in the output file, if it is still valid.
    async fn cached_response(
        output_file: &str,
        now: i64,
    ) -> std::result::Result<Option<ExecutableResponse>, PluggableAuthError> {
        let contents = match tokio::fs::read_to_string(output_file).await {
            Ok(c) if !c.trim().is_empty() => c,
            _ => return Ok(None),
        };
        let response: ExecutableResponse = serde_json::from_str(&contents).map_err(|e| {
            PluggableAuthError::new(
                PluggableAuthErrorCode::InvalidOutputFile,
                format!("The output file contains an invalid response: {e}"),
            )
        })?;
        if !response.success || response.is_expired(now) {
            tracing::debug!(
                output_file,
                success = response.success,
                "ignoring unusable executable response in output file"
            );
            return Ok(None);
        }
        Ok(Some(response))
    }

    async fn run(options: &ExecutableOptions) -> std::result::Result<ExecutableResponse, PluggableAuthError> {
        use PluggableAuthErrorCode as Code;
        let mut parts = options.command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            PluggableAuthError::new(Code::InvalidResponse, "The executable command is empty.")
        })?;
        let mut command = Command::new(program);
        command
            .args(parts)
            .envs(&options.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program, "running executable to fetch subject token");
        let child = command.spawn().map_err(|e| {
            PluggableAuthError::new(Code::Interrupted, format!("Failed to start the executable: {e}"))
        })?;
        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(options.timeout, child.wait_with_output()).await {
            Err(_) => {
                return Err(PluggableAuthError::new(
                    Code::TimeoutExceeded,
                    format!(
                        "The executable failed to finish within the timeout of {}ms.",
                        options.timeout.as_millis()
                    ),
                ));
            }
            Ok(Err(e)) => {
                return Err(PluggableAuthError::new(
                    Code::Interrupted,
                    format!("The execution was interrupted: {e}"),
                ));
            }
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(PluggableAuthError::new(
                Code::ExitCode,
                format!("The executable failed with exit code {code}."),
            ));
        }
        serde_json::from_slice::<ExecutableResponse>(&output.stdout).map_err(|e| {
            PluggableAuthError::new(
                Code::InvalidResponse,
                format!("The executable returned an invalid response: {e}"),
            )
        })
    }
}

#[async_trait::async_trait]
impl ExecutableHandler for PluggableAuthHandler {
    async fn retrieve_token(
        &self,
        options: &ExecutableOptions,
    ) -> std::result::Result<String, PluggableAuthError> {
        if std::env::var(ALLOW_EXECUTABLES_ENV).ok().as_deref() != Some("1") {
            return Err(PluggableAuthError::new(
                PluggableAuthErrorCode::PluggableAuthDisabled,
                format!(
                    "Pluggable Auth executables need to be explicitly allowed to run by setting the {ALLOW_EXECUTABLES_ENV} environment variable to 1."
                ),
            ));
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let cached = match &options.output_file {
            Some(f) => Self::cached_response(f, now).await?,
            None => None,
        };
        let response = match cached {
            Some(r) => r,
            None => Self::run(options).await?,
        };
        response.into_subject_token(now, options.output_file.is_some())
    }
}

/// Runs an executable to obtain the subject token.
#[derive(Debug, Clone)]
pub(crate) struct ExecutableSourcedCredentials {
    pub command: String,
    pub timeout: Duration,
    pub output_file: Option<String>,
    handler: Arc<dyn ExecutableHandler>,
}

impl PartialEq for ExecutableSourcedCredentials {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command
            && self.timeout == other.timeout
            && self.output_file == other.output_file
    }
}

impl ExecutableSourcedCredentials {
    pub(crate) fn new(config: ExecutableConfig) -> BuildResult<Self> {
        let command = config
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| BuilderError::missing_field("credential_source.executable.command"))?;
        let timeout = match config.timeout_millis {
            None => DEFAULT_TIMEOUT,
            Some(t) if (MIN_TIMEOUT_MILLIS..=MAX_TIMEOUT_MILLIS).contains(&t) => {
                Duration::from_millis(t)
            }
            Some(t) => {
                return Err(BuilderError::invalid_configuration(format!(
                    "The executable timeout must be between {MIN_TIMEOUT_MILLIS} and {MAX_TIMEOUT_MILLIS} milliseconds, got {t}."
                )));
            }
        };
        Ok(Self {
            command,
            timeout,
            output_file: config.output_file,
            handler: Arc::new(PluggableAuthHandler),
        })
    }

    pub(crate) fn with_handler(mut self, handler: Arc<dyn ExecutableHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut executable = json!({
            "command": self.command,
            "timeout_millis": self.timeout.as_millis() as u64,
        });
        if let Some(f) = &self.output_file {
            executable["output_file"] = json!(f);
        }
        json!({ "executable": executable })
    }

    fn options(&self, context: &SubjectTokenContext) -> ExecutableOptions {
        let mut environment = HashMap::from([
            (
                "GOOGLE_EXTERNAL_ACCOUNT_AUDIENCE".to_string(),
                context.audience.clone(),
            ),
            (
                "GOOGLE_EXTERNAL_ACCOUNT_TOKEN_TYPE".to_string(),
                context.subject_token_type.clone(),
            ),
            (
                "GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE".to_string(),
                "0".to_string(),
            ),
        ]);
        if let Some(email) = &context.service_account_email {
            environment.insert(
                "GOOGLE_EXTERNAL_ACCOUNT_IMPERSONATED_EMAIL".to_string(),
                email.clone(),
            );
        }
        if let Some(f) = &self.output_file {
            environment.insert("GOOGLE_EXTERNAL_ACCOUNT_OUTPUT_FILE".to_string(), f.clone());
        }
        ExecutableOptions {
            command: self.command.clone(),
            timeout: self.timeout,
            output_file: self.output_file.clone(),
            environment,
        }
    }

    pub(crate) async fn subject_token(&self, context: &SubjectTokenContext) -> Result<SubjectToken> {
        let options = self.options(context);
        let token = self.handler.retrieve_token(&options).await?;
        Ok(SubjectTokenBuilder::new(token).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_env::ScopedEnv;
    use serial_test::{parallel, serial};
    use std::error::Error as _;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use test_case::test_case;

    type TestResult = anyhow::Result<()>;

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn valid_response(token: &str) -> Value {
        json!({
            "version": 1,
            "success": true,
            "token_type": JWT_TOKEN_TYPE,
            "id_token": token,
            "expiration_time": now() + 3600,
        })
    }

    fn options(command: String, output_file: Option<String>) -> ExecutableOptions {
        ExecutableOptions {
            command,
            timeout: Duration::from_secs(5),
            output_file,
            environment: HashMap::new(),
        }
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> anyhow::Result<String> {
        let path = dir.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path.to_string_lossy().to_string())
    }

    #[cfg(unix)]
    fn script(dir: &TempDir, body: &str) -> anyhow::Result<String> {
        use std::os::unix::fs::PermissionsExt;
        let path = write(dir, "executable.sh", &format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        Ok(path)
    }

    #[tokio::test]
    #[serial]
    async fn disabled_by_default() -> TestResult {
        let _e = ScopedEnv::remove(ALLOW_EXECUTABLES_ENV);
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("marker");
        let command = format!("touch {}", marker.display());
        let err = PluggableAuthHandler
            .retrieve_token(&options(command, None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), &PluggableAuthErrorCode::PluggableAuthDisabled);
        assert!(!marker.exists(), "the executable must not run");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn token_from_command() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let response = write(&dir, "response.json", &valid_response("an_example_token").to_string())?;
        let token = PluggableAuthHandler
            .retrieve_token(&options(format!("cat {response}"), None))
            .await?;
        assert_eq!(token, "an_example_token");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn command_environment() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let body = format!(
            r#"printf '{{"version":1,"success":true,"token_type":"{JWT_TOKEN_TYPE}","id_token":"%s|%s|%s|%s"}}' "$GOOGLE_EXTERNAL_ACCOUNT_AUDIENCE" "$GOOGLE_EXTERNAL_ACCOUNT_TOKEN_TYPE" "$GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE" "$GOOGLE_EXTERNAL_ACCOUNT_IMPERSONATED_EMAIL""#
        );
        let command = script(&dir, &body)?;
        let source = ExecutableSourcedCredentials::new(ExecutableConfig {
            command: Some(command),
            ..ExecutableConfig::default()
        })?;
        let context = SubjectTokenContext {
            audience: "test-audience".into(),
            subject_token_type: JWT_TOKEN_TYPE.into(),
            service_account_email: Some("sa@example.com".into()),
        };
        let token = source.subject_token(&context).await?;
        assert_eq!(
            token.token,
            format!("test-audience|{JWT_TOKEN_TYPE}|0|sa@example.com")
        );
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn valid_output_file_skips_command() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let output = write(&dir, "output.json", &valid_response("cached_token").to_string())?;
        let marker = dir.path().join("marker");
        let command = format!("touch {}", marker.display());
        let token = PluggableAuthHandler
            .retrieve_token(&options(command, Some(output)))
            .await?;
        assert_eq!(token, "cached_token");
        assert!(!marker.exists(), "the executable must not run");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn expired_output_file_runs_command() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let mut expired = valid_response("expired_token");
        expired["expiration_time"] = json!(now() - 60);
        let output = write(&dir, "output.json", &expired.to_string())?;
        let response = write(&dir, "response.json", &valid_response("fresh_token").to_string())?;
        let token = PluggableAuthHandler
            .retrieve_token(&options(format!("cat {response}"), Some(output)))
            .await?;
        assert_eq!(token, "fresh_token");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn failed_output_file_runs_command() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let failed = json!({"version": 1, "success": false, "code": "401", "message": "x"});
        let output = write(&dir, "output.json", &failed.to_string())?;
        let response = write(&dir, "response.json", &valid_response("fresh_token").to_string())?;
        let token = PluggableAuthHandler
            .retrieve_token(&options(format!("cat {response}"), Some(output)))
            .await?;
        assert_eq!(token, "fresh_token");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn missing_output_file_runs_command() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("not-yet-written.json");
        let response = write(&dir, "response.json", &valid_response("fresh_token").to_string())?;
        let token = PluggableAuthHandler
            .retrieve_token(&options(
                format!("cat {response}"),
                Some(output.to_string_lossy().to_string()),
            ))
            .await?;
        assert_eq!(token, "fresh_token");
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn malformed_output_file() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let output = write(&dir, "output.json", "not json")?;
        let err = PluggableAuthHandler
            .retrieve_token(&options("unused".into(), Some(output)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), &PluggableAuthErrorCode::InvalidOutputFile);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn exit_code() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let command = script(&dir, "exit 3")?;
        let err = PluggableAuthHandler
            .retrieve_token(&options(command, None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), &PluggableAuthErrorCode::ExitCode);
        assert!(err.message().contains("exit code 3"), "{err}");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn timeout_exceeded() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let command = script(&dir, "sleep 30")?;
        let opts = ExecutableOptions {
            timeout: Duration::from_millis(200),
            ..options(command, None)
        };
        let err = PluggableAuthHandler.retrieve_token(&opts).await.unwrap_err();
        assert_eq!(err.code(), &PluggableAuthErrorCode::TimeoutExceeded);

        let err = crate::errors::CredentialsError::from(err);
        assert!(err.is_transient(), "{err:?}");
        assert!(err.source().is_some(), "{err:?}");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn invalid_command_output() -> TestResult {
        let _e = ScopedEnv::set(ALLOW_EXECUTABLES_ENV, "1");
        let dir = tempfile::tempdir()?;
        let command = script(&dir, "echo not-json")?;
        let err = PluggableAuthHandler
            .retrieve_token(&options(command, None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), &PluggableAuthErrorCode::InvalidResponse);
        Ok(())
    }

    const EXPIRED: i64 = -1;
    const VALID: i64 = 1;

    #[test_case(json!({"version": 2, "success": true, "token_type": JWT_TOKEN_TYPE, "id_token": "t", "expiration_time": VALID}),
        PluggableAuthErrorCode::UnsupportedVersion; "unsupported version")]
    #[test_case(json!({"version": 1, "success": false, "code": "401", "message": "Caller not authorized."}),
        PluggableAuthErrorCode::Executable("401".into()); "executable failure")]
    #[test_case(json!({"version": 1, "success": false}),
        PluggableAuthErrorCode::InvalidResponse; "failure without code")]
    #[test_case(json!({"version": 1, "success": true, "token_type": JWT_TOKEN_TYPE, "id_token": "t", "expiration_time": EXPIRED}),
        PluggableAuthErrorCode::InvalidResponse; "expired")]
    #[test_case(json!({"version": 1, "success": true, "token_type": JWT_TOKEN_TYPE, "saml_response": "t", "expiration_time": VALID}),
        PluggableAuthErrorCode::InvalidResponse; "missing id token")]
    #[test_case(json!({"version": 1, "success": true, "token_type": SAML2_TOKEN_TYPE, "id_token": "t", "expiration_time": VALID}),
        PluggableAuthErrorCode::InvalidResponse; "missing saml response")]
    #[test_case(json!({"version": 1, "success": true, "token_type": "unknown", "id_token": "t", "expiration_time": VALID}),
        PluggableAuthErrorCode::InvalidResponse; "unknown token type")]
    #[parallel]
    fn invalid_response(mut input: Value, want: PluggableAuthErrorCode) -> TestResult {
        let now = now();
        if let Some(t) = input.get_mut("expiration_time") {
            *t = json!(now + t.as_i64().unwrap_or_default() * 3600);
        }
        let response: ExecutableResponse = serde_json::from_value(input)?;
        let err = response.into_subject_token(now, false).unwrap_err();
        assert_eq!(err.code(), &want, "{err}");
        Ok(())
    }

    #[test]
    #[parallel]
    fn saml_response() -> TestResult {
        let response: ExecutableResponse = serde_json::from_value(json!({
            "version": 1,
            "success": true,
            "token_type": SAML2_TOKEN_TYPE,
            "saml_response": "saml-assertion",
        }))?;
        assert_eq!(response.into_subject_token(now(), false)?, "saml-assertion");
        Ok(())
    }

    #[test]
    #[parallel]
    fn missing_expiration_with_output_file() -> TestResult {
        let response: ExecutableResponse = serde_json::from_value(json!({
            "version": 1,
            "success": true,
            "token_type": JWT_TOKEN_TYPE,
            "id_token": "t",
        }))?;
        let err = response.into_subject_token(now(), true).unwrap_err();
        assert_eq!(err.code(), &PluggableAuthErrorCode::InvalidResponse);
        Ok(())
    }

    #[test_case(None, Duration::from_secs(30); "default")]
    #[test_case(Some(5_000), Duration::from_secs(5); "minimum")]
    #[test_case(Some(120_000), Duration::from_secs(120); "maximum")]
    #[parallel]
    fn timeout_config(input: Option<u64>, want: Duration) -> TestResult {
        let source = ExecutableSourcedCredentials::new(ExecutableConfig {
            command: Some("cat /some/file".into()),
            timeout_millis: input,
            output_file: None,
        })?;
        assert_eq!(source.timeout, want);
        Ok(())
    }

    #[test_case(Some(4_999); "too short")]
    #[test_case(Some(120_001); "too long")]
    #[parallel]
    fn timeout_config_invalid(input: Option<u64>) {
        let err = ExecutableSourcedCredentials::new(ExecutableConfig {
            command: Some("cat /some/file".into()),
            timeout_millis: input,
            output_file: None,
        })
        .unwrap_err();
        assert!(err.is_invalid_configuration(), "{err:?}");
    }

    #[test]
    #[parallel]
    fn missing_command() {
        let err = ExecutableSourcedCredentials::new(ExecutableConfig::default()).unwrap_err();
        assert!(err.is_missing_field(), "{err:?}");
    }

    #[derive(Debug, Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<ExecutableOptions>>,
    }

    #[async_trait::async_trait]
    impl ExecutableHandler for RecordingHandler {
        async fn retrieve_token(
            &self,
            options: &ExecutableOptions,
        ) -> std::result::Result<String, PluggableAuthError> {
            self.calls.lock().unwrap().push(options.clone());
            Ok("handled-token".into())
        }
    }

    #[tokio::test]
    #[parallel]
    async fn custom_handler() -> TestResult {
        let handler = Arc::new(RecordingHandler::default());
        let source = ExecutableSourcedCredentials::new(ExecutableConfig {
            command: Some("/usr/bin/fetch-token --flag".into()),
            timeout_millis: Some(10_000),
            output_file: Some("/tmp/cache.json".into()),
        })?
        .with_handler(handler.clone());
        let context = SubjectTokenContext {
            audience: "test-audience".into(),
            subject_token_type: JWT_TOKEN_TYPE.into(),
            service_account_email: None,
        };
        let token = source.subject_token(&context).await?;
        assert_eq!(token.token, "handled-token");

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let got = &calls[0];
        assert_eq!(got.command, "/usr/bin/fetch-token --flag");
        assert_eq!(got.timeout, Duration::from_secs(10));
        assert_eq!(got.output_file.as_deref(), Some("/tmp/cache.json"));
        assert_eq!(
            got.environment.get("GOOGLE_EXTERNAL_ACCOUNT_OUTPUT_FILE").map(String::as_str),
            Some("/tmp/cache.json")
        );
        assert_eq!(
            got.environment.get("GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE").map(String::as_str),
            Some("0")
        );
        assert!(
            !got.environment.contains_key("GOOGLE_EXTERNAL_ACCOUNT_IMPERSONATED_EMAIL"),
            "{got:?}"
        );
        Ok(())
    }

    #[test]
    #[parallel]
    fn to_json() -> TestResult {
        let source = ExecutableSourcedCredentials::new(ExecutableConfig {
            command: Some("cat /some/file".into()),
            timeout_millis: None,
            output_file: Some("/some/file".into()),
        })?;
        assert_eq!(
            source.to_json(),
            json!({"executable": {"command": "cat /some/file", "timeout_millis": 30000, "output_file": "/some/file"}})
        );
        Ok(())
    }
}
