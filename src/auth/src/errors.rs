// Copyright 2024 Google LLC
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

//! Errors created while using [Credentials].
//!
//! Problems detected while *building* credentials are reported with
//! [build_errors::Error][crate::build_errors::Error]. Everything in this module
//! is reported at refresh time, when the credentials try to obtain a token.
//!
//! [Credentials]: crate::credentials::Credentials

use http::StatusCode;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter, Result};
use std::sync::Arc;

/// Represents an error using [Credentials](crate::credentials::Credentials).
///
/// The credentials may experience problems while fetching or refreshing an
/// access token. Examples include a temporary failure to contact the token
/// endpoint, a rejection from the Security Token Service, or an executable
/// that did not produce a valid response.
///
/// # Example
/// ```
/// # use google_cloud_credentials::errors::CredentialsError;
/// let err = CredentialsError::from_msg(
///     true, "simulated retryable error while trying to create credentials");
/// assert!(err.is_transient());
/// assert!(format!("{err}").contains("simulated retryable error"));
/// ```
#[derive(Clone, Debug)]
pub struct CredentialsError {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn Error + Send + Sync>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ErrorKind {
    Transient,
    Permanent,
    IllegalState,
}

impl CredentialsError {
    /// Creates a new `CredentialsError` with a message and a source.
    ///
    /// # Arguments
    /// * `is_transient` - whether future attempts may succeed.
    /// * `message` - a description of the operation that failed.
    /// * `source` - the underlying error that caused the failure.
    pub fn new<M, T>(is_transient: bool, message: M, source: T) -> Self
    where
        M: Into<String>,
        T: Error + Send + Sync + 'static,
    {
        Self {
            kind: ErrorKind::from(is_transient),
            message: Some(message.into()),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new `CredentialsError` from a message.
    pub fn from_msg<T: Into<String>>(is_transient: bool, message: T) -> Self {
        Self {
            kind: ErrorKind::from(is_transient),
            message: Some(message.into()),
            source: None,
        }
    }

    /// Creates a new `CredentialsError` from a source error.
    pub fn from_source<T: Error + Send + Sync + 'static>(is_transient: bool, source: T) -> Self {
        Self {
            kind: ErrorKind::from(is_transient),
            message: None,
            source: Some(Arc::new(source)),
        }
    }

    /// The operation is not valid for these credentials, such as refreshing a
    /// credential that holds a fixed access token.
    pub(crate) fn illegal_state<T: Into<String>>(message: T) -> Self {
        Self {
            kind: ErrorKind::IllegalState,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Returns `true` if future attempts may succeed.
    ///
    /// Applications and client libraries should use [Exponential backoff]
    /// when retrying these errors.
    ///
    /// [Exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// Returns `true` if the operation is not supported by the credentials.
    ///
    /// This is not a network error. Retrying the operation never succeeds.
    pub fn is_illegal_state(&self) -> bool {
        self.kind == ErrorKind::IllegalState
    }
}

impl From<bool> for ErrorKind {
    fn from(is_transient: bool) -> Self {
        if is_transient {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

impl std::error::Error for CredentialsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

const DEFAULT_MSG: &str = "cannot create access token";
const RETRYABLE_MSG: &str = "but future attempts may succeed";
const NON_RETRYABLE_MSG: &str = "and future attempts will not succeed";

impl Display for CredentialsError {
    /// Formats the error message to include retryability and source.
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let message = self.message.as_deref().unwrap_or(DEFAULT_MSG);
        let msg = if self.is_transient() {
            RETRYABLE_MSG
        } else {
            NON_RETRYABLE_MSG
        };
        write!(f, "{message}, {msg}")?;
        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }
        Ok(())
    }
}

/// A rejection from an OAuth 2.0 endpoint, such as the Security Token Service.
///
/// The fields follow [RFC 6749 Section 5.2].
///
/// [RFC 6749 Section 5.2]: https://datatracker.ietf.org/doc/html/rfc6749#section-5.2
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct OAuthError {
    #[serde(rename = "error")]
    code: String,
    #[serde(rename = "error_description")]
    description: Option<String>,
    #[serde(rename = "error_uri")]
    uri: Option<String>,
}

impl OAuthError {
    pub(crate) fn new<S: Into<String>>(
        code: S,
        description: Option<String>,
        uri: Option<String>,
    ) -> Self {
        Self {
            code: code.into(),
            description,
            uri,
        }
    }

    /// The error code, for example `invalid_grant`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The optional human-readable description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The optional URI identifying a page with more information.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }
}

impl Display for OAuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "Error code {}", self.code)?;
        if let Some(description) = &self.description {
            write!(f, ": {description}")?;
        }
        if let Some(uri) = &self.uri {
            write!(f, " - {uri}")?;
        }
        Ok(())
    }
}

impl std::error::Error for OAuthError {}

/// The error codes reported by executable-sourced credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PluggableAuthErrorCode {
    /// `GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES` is not set to `1`.
    PluggableAuthDisabled,
    /// The executable did not finish within the configured timeout.
    TimeoutExceeded,
    /// The executable finished with a non-zero exit code.
    ExitCode,
    /// The executable could not be started or waited on.
    Interrupted,
    /// The executable produced a response that cannot be used.
    InvalidResponse,
    /// The output file contains a response that cannot be used.
    InvalidOutputFile,
    /// The response uses a version other than `1`.
    UnsupportedVersion,
    /// The executable reported a failure with its own code.
    Executable(String),
}

impl PluggableAuthErrorCode {
    /// The string form of the code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::PluggableAuthDisabled => "PLUGGABLE_AUTH_DISABLED",
            Self::TimeoutExceeded => "TIMEOUT_EXCEEDED",
            Self::ExitCode => "EXIT_CODE",
            Self::Interrupted => "INTERRUPTED",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::InvalidOutputFile => "INVALID_OUTPUT_FILE",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::Executable(code) => code.as_str(),
        }
    }
}

impl Display for PluggableAuthErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.as_str())
    }
}

/// An error running the executable configured in executable-sourced
/// credentials.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("Error code {code}: {message}")]
pub struct PluggableAuthError {
    code: PluggableAuthErrorCode,
    message: String,
}

impl PluggableAuthError {
    pub(crate) fn new<S: Into<String>>(code: PluggableAuthErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error code.
    pub fn code(&self) -> &PluggableAuthErrorCode {
        &self.code
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// A timeout may resolve itself, all other failures require changes in
    /// the executable or its configuration.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self.code, PluggableAuthErrorCode::TimeoutExceeded)
    }
}

impl From<PluggableAuthError> for CredentialsError {
    fn from(value: PluggableAuthError) -> Self {
        let is_transient = value.is_transient();
        CredentialsError::new(is_transient, "failed to read subject token", value)
    }
}

/// Errors returned by application-provided [SubjectTokenProvider]s.
///
/// [SubjectTokenProvider]: crate::credentials::subject_token::SubjectTokenProvider
pub trait SubjectTokenProviderError: Error + Send + Sync + 'static {
    /// Returns `true` if future attempts to fetch the subject token may succeed.
    fn is_transient(&self) -> bool;
}

impl SubjectTokenProviderError for CredentialsError {
    fn is_transient(&self) -> bool {
        CredentialsError::is_transient(self)
    }
}

pub(crate) fn is_retryable(c: StatusCode) -> bool {
    match c {
        // Internal server errors do not indicate that there is anything wrong
        // with our request, so we retry them.
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => true,
        _ => false,
    }
}

pub(crate) fn from_http_error(err: reqwest::Error, msg: &str) -> CredentialsError {
    let transient = err.is_timeout() || err.is_connect() || err.status().is_some_and(is_retryable);
    CredentialsError::new(transient, msg, err)
}

pub(crate) async fn from_http_response(response: reqwest::Response, msg: &str) -> CredentialsError {
    let status = response.status();
    let transient = is_retryable(status);
    match response.text().await {
        Ok(body) => CredentialsError::from_msg(
            transient,
            format!("{msg}, status={status}, body=<{body}>"),
        ),
        Err(e) => CredentialsError::new(transient, format!("{msg}, status={status}"), e),
    }
}

/// Converts an error response from an OAuth 2.0 endpoint.
///
/// Responses in the [RFC 6749 Section 5.2] format keep the [OAuthError] as
/// the source, anything else is reported with its body.
///
/// [RFC 6749 Section 5.2]: https://datatracker.ietf.org/doc/html/rfc6749#section-5.2
pub(crate) async fn from_oauth_response(response: reqwest::Response, msg: &str) -> CredentialsError {
    let status = response.status();
    let transient = is_retryable(status);
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return CredentialsError::new(transient, format!("{msg}, status={status}"), e),
    };
    match serde_json::from_str::<OAuthError>(&body) {
        Ok(oauth) => CredentialsError::new(transient, format!("{msg}, status={status}"), oauth),
        Err(_) => CredentialsError::from_msg(
            transient,
            format!("{msg}, status={status}, body=<{body}>"),
        ),
    }
}
