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

//! [Impersonated service account] credentials.
//!
//! When the principal you are using doesn't have the permissions you need to
//! accomplish your task, or you want to use a service account in a development
//! environment, you can use service account impersonation. The typical principals
//! used to impersonate a service account are [User Account] or another [Service Account].
//!
//! The principal that is trying to impersonate a target service account should have
//! [Service Account Token Creator Role] on the target service account.
//!
//! Calls to the IAM credentials service are retried on server errors, see
//! [RetryConfig] for the defaults.
//!
//! ## Example: Creating credentials from a JSON object
//!
//! ```
//! # use google_cloud_credentials::credentials::impersonated;
//! # use serde_json::json;
//! # use std::time::Duration;
//! #
//! # tokio_test::block_on(async {
//! let source_credentials = json!({
//!     "type": "authorized_user",
//!     "client_id": "test-client-id",
//!     "client_secret": "test-client-secret",
//!     "refresh_token": "test-refresh-token"
//! });
//!
//! let impersonated_credential = json!({
//!     "type": "impersonated_service_account",
//!     "service_account_impersonation_url": "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/test-principal:generateAccessToken",
//!     "source_credentials": source_credentials,
//! });
//!
//! let credentials = impersonated::Builder::new(impersonated_credential)
//!     .with_lifetime(Duration::from_secs(900))
//!     .build()?;
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [Impersonated service account]: https://cloud.google.com/docs/authentication/use-service-account-impersonation
//! [User Account]: https://cloud.google.com/docs/authentication#user-accounts
//! [Service Account]: https://cloud.google.com/iam/docs/service-account-overview
//! [Service Account Token Creator Role]: https://cloud.google.com/docs/authentication/use-service-account-impersonation#required-roles

use crate::build_errors::Error as BuilderError;
use crate::clock::{Clock, SystemClock};
use crate::constants::{DEFAULT_SCOPE, IAM_CREDENTIALS_ENDPOINT};
use crate::credentials::internal::iam::{
    GenerateAccessTokenRequest, IamClient, service_account_url,
};
use crate::credentials::{CachedCredentials, Credentials, build_from_json};
use crate::retry::RetryConfig;
use crate::signer::Signer;
use crate::signer::iam::{IamSigner, SignBlobClient};
use crate::token::{AccessToken, TokenProvider};
use crate::{BuildResult, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);
/// The IAM credentials service rejects longer lifetimes.
pub(crate) const MAX_LIFETIME: Duration = Duration::from_secs(43200);

enum BuilderSource {
    FromJson(Value),
    FromCredentials(Credentials),
}

/// A builder for constructing Impersonated Service Account [Credentials] instance.
///
/// # Example
/// ```
/// # use google_cloud_credentials::credentials::impersonated::Builder;
/// let impersonated_credential = serde_json::json!({
///     "type": "impersonated_service_account",
///     "service_account_impersonation_url": "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/test-principal:generateAccessToken",
///     "source_credentials": {
///         "type": "authorized_user",
///         "client_id": "test-client-id",
///         "client_secret": "test-client-secret",
///         "refresh_token": "test-refresh-token"
///     }
/// });
/// let credentials = Builder::new(impersonated_credential).build();
/// ```
pub struct Builder {
    source: BuilderSource,
    service_account_impersonation_url: Option<String>,
    delegates: Option<Vec<String>>,
    scopes: Option<Vec<String>>,
    quota_project_id: Option<String>,
    lifetime: Option<Duration>,
    retry_config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl Builder {
    /// Creates a new builder using `impersonated_service_account` JSON value.
    ///
    /// The `impersonated_service_account` JSON is typically generated using
    /// a [gcloud command] for [application default login].
    ///
    /// [gcloud command]: https://cloud.google.com/docs/authentication/use-service-account-impersonation#adc
    /// [application default login]: https://cloud.google.com/sdk/gcloud/reference/auth/application-default/login
    pub fn new(impersonated_credential: Value) -> Self {
        Self::with_source(BuilderSource::FromJson(impersonated_credential))
    }

    /// Creates a new builder with a source credentials object.
    ///
    /// The target principal must be set with [Builder::with_target_principal].
    ///
    /// # Example
    /// ```
    /// # use google_cloud_credentials::credentials::impersonated;
    /// # use google_cloud_credentials::credentials::user_account;
    /// # use serde_json::json;
    /// let source_credentials = user_account::Builder::new(json!({ /* add details here */ })).build()?;
    ///
    /// let creds = impersonated::Builder::from_source_credentials(source_credentials)
    ///     .with_target_principal("test-principal")
    ///     .build()?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_source_credentials(source_credentials: Credentials) -> Self {
        Self::with_source(BuilderSource::FromCredentials(source_credentials))
    }

    fn with_source(source: BuilderSource) -> Self {
        Self {
            source,
            service_account_impersonation_url: None,
            delegates: None,
            scopes: None,
            quota_project_id: None,
            lifetime: None,
            retry_config: RetryConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the target principal, the email of the service account to
    /// impersonate. This is required when using `from_source_credentials`.
    pub fn with_target_principal<S: Into<String>>(mut self, target_principal: S) -> Self {
        self.service_account_impersonation_url = Some(service_account_url(
            IAM_CREDENTIALS_ENDPOINT,
            &target_principal.into(),
            "generateAccessToken",
        ));
        self
    }

    /// Sets the chain of delegates.
    ///
    /// Each service account in the chain must have the Token Creator role on
    /// the next one, the last delegate on the target principal.
    pub fn with_delegates<I, S>(mut self, delegates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delegates = Some(delegates.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the [scopes] for these credentials.
    ///
    /// Any value set here overrides a `scopes` value from the
    /// input `impersonated_service_account` JSON.
    ///
    /// By default `https://www.googleapis.com/auth/cloud-platform` scope is used.
    ///
    /// [scopes]: https://developers.google.com/identity/protocols/oauth2/scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// For some services, you can use an account in
    /// one project for authentication and authorization, and charge
    /// the usage to a different project. This requires that the
    /// target service account has `serviceusage.services.use`
    /// permissions on the quota project.
    ///
    /// Any value set here overrides a `quota_project_id` value from the
    /// input `impersonated_service_account` JSON.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets the lifetime for the impersonated credentials.
    ///
    /// Defaults to one hour, at most 12 hours are allowed.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Configures the retries for calls to the IAM credentials service.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Sets the clock used to detect stale tokens.
    ///
    /// The expiration time of impersonated tokens is set by the IAM service.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] for one of the following cases:
    /// - If the `impersonated_service_account` provided to [`Builder::new`] cannot
    ///   be successfully deserialized into the expected format.
    /// - If the `impersonated_service_account` provided to [`Builder::new`] has a
    ///   `source_credentials` of `impersonated_service_account` type.
    /// - If `service_account_impersonation_url` is not provided after initializing
    ///   the builder with [`Builder::from_source_credentials`].
    /// - If the lifetime exceeds 12 hours.
    pub fn build(self) -> BuildResult<Credentials> {
        let lifetime = self.lifetime.unwrap_or(DEFAULT_LIFETIME);
        if lifetime.is_zero() || lifetime > MAX_LIFETIME {
            return Err(BuilderError::invalid_configuration(format!(
                "the lifetime must be between 1 and {} seconds, got {}",
                MAX_LIFETIME.as_secs(),
                lifetime.as_secs()
            )));
        }
        let components = build_components(self.source, self.service_account_impersonation_url)?;
        let quota_project_id = self.quota_project_id.or(components.quota_project_id);
        let token_provider = ImpersonatedTokenProvider {
            source_credentials: components.source_credentials,
            service_account_impersonation_url: components.service_account_impersonation_url,
            delegates: self.delegates.or(components.delegates),
            scopes: self
                .scopes
                .or(components.scopes)
                .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]),
            lifetime,
            client: IamClient::new(self.retry_config),
        };
        Ok(Credentials::from(
            CachedCredentials::new(token_provider, quota_project_id).with_clock(self.clock),
        ))
    }

    /// Returns a [Signer] for the target principal.
    ///
    /// The signer calls the IAM `signBlob` method, authenticated with the
    /// source credentials.
    pub fn build_signer(self) -> BuildResult<Signer> {
        let components = build_components(self.source, self.service_account_impersonation_url)?;
        let url = &components.service_account_impersonation_url;
        let client_email = principal_from_url(url).ok_or_else(|| {
            BuilderError::parsing(format!(
                "cannot find the target principal in `service_account_impersonation_url`: {url}"
            ))
        })?;
        let client = SignBlobClient::new(components.source_credentials.clone(), self.retry_config)
            .with_endpoint(endpoint_from_url(url)?);
        Ok(Signer::from(IamSigner::new(client_email.to_string(), client)))
    }
}

/// The settings common to impersonated access tokens, ID tokens, and signers.
pub(crate) struct ImpersonatedCredentialComponents {
    pub(crate) source_credentials: Credentials,
    pub(crate) service_account_impersonation_url: String,
    pub(crate) delegates: Option<Vec<String>>,
    pub(crate) quota_project_id: Option<String>,
    pub(crate) scopes: Option<Vec<String>>,
}

fn build_components(
    source: BuilderSource,
    service_account_impersonation_url: Option<String>,
) -> BuildResult<ImpersonatedCredentialComponents> {
    match source {
        BuilderSource::FromJson(json) => build_components_from_json(json),
        BuilderSource::FromCredentials(source_credentials) => {
            build_components_from_credentials(source_credentials, service_account_impersonation_url)
        }
    }
}

pub(crate) fn build_components_from_json(
    json: Value,
) -> BuildResult<ImpersonatedCredentialComponents> {
    let config =
        serde_json::from_value::<ImpersonatedConfig>(json).map_err(BuilderError::parsing)?;

    let source_type = config.source_credentials.get("type").and_then(Value::as_str);
    if source_type == Some("impersonated_service_account") {
        return Err(BuilderError::parsing(
            "source credential of type `impersonated_service_account` is not supported. \
                        Use the `delegates` field to specify a delegation chain.",
        ));
    }

    // Scopes and quota project apply to the target, not the source credentials.
    let source_credentials = build_from_json(config.source_credentials, None, None)?;

    Ok(ImpersonatedCredentialComponents {
        source_credentials,
        service_account_impersonation_url: config.service_account_impersonation_url,
        delegates: config.delegates,
        quota_project_id: config.quota_project_id,
        scopes: config.scopes,
    })
}

pub(crate) fn build_components_from_credentials(
    source_credentials: Credentials,
    service_account_impersonation_url: Option<String>,
) -> BuildResult<ImpersonatedCredentialComponents> {
    let url = service_account_impersonation_url.ok_or_else(|| {
        BuilderError::parsing(
            "`service_account_impersonation_url` is required when building from source credentials",
        )
    })?;
    Ok(ImpersonatedCredentialComponents {
        source_credentials,
        service_account_impersonation_url: url,
        delegates: None,
        quota_project_id: None,
        scopes: None,
    })
}

/// Extracts the service account email from an IAM credentials URL.
pub(crate) fn principal_from_url(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("/serviceAccounts/")?;
    let (email, _) = rest.split_once(':')?;
    Some(email).filter(|e| !e.is_empty())
}

/// Returns the scheme, host, and port of an IAM credentials URL.
pub(crate) fn endpoint_from_url(url: &str) -> BuildResult<String> {
    let parsed = url::Url::parse(url).map_err(BuilderError::parsing)?;
    Ok(parsed.origin().ascii_serialization())
}

#[derive(serde::Deserialize, Debug, PartialEq)]
struct ImpersonatedConfig {
    service_account_impersonation_url: String,
    source_credentials: Value,
    delegates: Option<Vec<String>>,
    quota_project_id: Option<String>,
    scopes: Option<Vec<String>>,
}

struct ImpersonatedTokenProvider {
    source_credentials: Credentials,
    service_account_impersonation_url: String,
    delegates: Option<Vec<String>>,
    scopes: Vec<String>,
    lifetime: Duration,
    client: IamClient,
}

impl Debug for ImpersonatedTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonatedTokenProvider")
            .field("source_credentials", &self.source_credentials)
            .field(
                "service_account_impersonation_url",
                &self.service_account_impersonation_url,
            )
            .field("delegates", &self.delegates)
            .field("scopes", &self.scopes)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

#[async_trait]
impl TokenProvider for ImpersonatedTokenProvider {
    async fn token(&self) -> Result<AccessToken> {
        let source_headers = self.source_credentials.headers().await?;
        let request = GenerateAccessTokenRequest::new(
            self.delegates.clone(),
            self.scopes.clone(),
            self.lifetime,
        );
        tracing::debug!(
            url = self.service_account_impersonation_url,
            "generating impersonated access token"
        );
        let token = self
            .client
            .generate_access_token(&self.service_account_impersonation_url, source_headers, &request)
            .await?;
        Ok(token.with_scopes(self.scopes.iter().cloned()))
    }
}
