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

//! Obtain [OIDC ID tokens] using [impersonated service accounts].
//!
//! When the principal you are using doesn't have the permissions you need to
//! accomplish your task, or you want to use a service account in a development
//! environment, you can use service account impersonation. The typical principals
//! used to impersonate a service account are [User Account] or another [Service Account].
//!
//! The principal that is trying to impersonate a target service account should have
//! [Service Account Token Creator Role] on the target service account.
//!
//! ## Example: Creating impersonated credentials from a JSON object with target audience and sending ID Tokens.
//!
//! ```no_run
//! # use google_cloud_credentials::credentials::idtoken;
//! # use serde_json::json;
//! # use reqwest;
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
//! let audience = "https://example.com";
//! let credentials = idtoken::impersonated::Builder::new(audience, impersonated_credential)
//!     .build()?;
//! let id_token = credentials.id_token().await?;
//!
//! // Make request with ID Token as Bearer Token.
//! let client = reqwest::Client::new();
//! let target_url = format!("{audience}/api/method");
//! client.get(target_url)
//!     .bearer_auth(id_token)
//!     .send()
//!     .await?;
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [Impersonated service accounts]: https://cloud.google.com/docs/authentication/use-service-account-impersonation
//! [OIDC ID tokens]: https://cloud.google.com/docs/authentication/token-types#identity-tokens
//! [User Account]: https://cloud.google.com/docs/authentication#user-accounts
//! [Service Account]: https://cloud.google.com/iam/docs/service-account-overview
//! [Service Account Token Creator Role]: https://cloud.google.com/docs/authentication/use-service-account-impersonation#required-roles

use crate::build_errors::Error as BuilderError;
use crate::constants::IAM_CREDENTIALS_ENDPOINT;
use crate::credentials::Credentials;
use crate::credentials::idtoken::{IdTokenCredentials, IdTokenProvider};
use crate::credentials::impersonated::{
    ImpersonatedCredentialComponents, build_components_from_credentials,
    build_components_from_json, endpoint_from_url, principal_from_url,
};
use crate::credentials::internal::iam::{GenerateIdTokenRequest, IamClient, service_account_url};
use crate::retry::RetryConfig;
use crate::{BuildResult, Result};
use serde_json::Value;

enum BuilderSource {
    FromJson(Value),
    FromCredentials(Credentials),
}

/// Creates [IdTokenCredentials] instances that call the IAM
/// `generateIdToken` method, authenticated with the source credentials.
pub struct Builder {
    source: BuilderSource,
    target_audience: String,
    service_account_impersonation_url: Option<String>,
    delegates: Option<Vec<String>>,
    include_email: bool,
    retry_config: RetryConfig,
}

impl Builder {
    /// Creates a new builder using an `impersonated_service_account` JSON
    /// value.
    pub fn new<S: Into<String>>(target_audience: S, impersonated_credential: Value) -> Self {
        Self::with_source(target_audience.into(), BuilderSource::FromJson(impersonated_credential))
    }

    /// Creates a new builder with a source credentials object.
    ///
    /// The target principal must be set with [Builder::with_target_principal].
    pub fn from_source_credentials<S: Into<String>>(
        target_audience: S,
        source_credentials: Credentials,
    ) -> Self {
        Self::with_source(
            target_audience.into(),
            BuilderSource::FromCredentials(source_credentials),
        )
    }

    fn with_source(target_audience: String, source: BuilderSource) -> Self {
        Self {
            source,
            target_audience,
            service_account_impersonation_url: None,
            delegates: None,
            include_email: false,
            retry_config: RetryConfig::default(),
        }
    }

    /// Sets the target principal, the email of the service account to
    /// impersonate.
    pub fn with_target_principal<S: Into<String>>(mut self, target_principal: S) -> Self {
        self.service_account_impersonation_url = Some(service_account_url(
            IAM_CREDENTIALS_ENDPOINT,
            &target_principal.into(),
            "generateIdToken",
        ));
        self
    }

    /// Sets the chain of delegates.
    pub fn with_delegates<I, S>(mut self, delegates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delegates = Some(delegates.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Includes the `email` and `email_verified` claims in the token.
    pub fn with_include_email(mut self) -> Self {
        self.include_email = true;
        self
    }

    /// Configures the retries for calls to the IAM credentials service.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Returns an [IdTokenCredentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] if the JSON cannot be deserialized, if the
    /// source credentials are invalid, or if the target principal is missing.
    pub fn build(self) -> BuildResult<IdTokenCredentials> {
        let components = match self.source {
            BuilderSource::FromJson(json) => build_components_from_json(json)?,
            BuilderSource::FromCredentials(source_credentials) => {
                build_components_from_credentials(
                    source_credentials,
                    self.service_account_impersonation_url,
                )?
            }
        };
        let ImpersonatedCredentialComponents {
            source_credentials,
            service_account_impersonation_url: url,
            delegates,
            ..
        } = components;
        let principal = principal_from_url(&url).ok_or_else(|| {
            BuilderError::parsing(format!(
                "cannot find the target principal in `service_account_impersonation_url`: {url}"
            ))
        })?;
        let url = service_account_url(&endpoint_from_url(&url)?, principal, "generateIdToken");
        Ok(IdTokenCredentials::from(ImpersonatedIdTokenProvider {
            source_credentials,
            url,
            request: GenerateIdTokenRequest {
                audience: self.target_audience,
                include_email: self.include_email,
                delegates: self.delegates.or(delegates),
            },
            client: IamClient::new(self.retry_config),
        }))
    }
}

#[derive(Debug)]
struct ImpersonatedIdTokenProvider {
    source_credentials: Credentials,
    url: String,
    request: GenerateIdTokenRequest,
    client: IamClient,
}

impl IdTokenProvider for ImpersonatedIdTokenProvider {
    async fn id_token(&self) -> Result<String> {
        let source_headers = self.source_credentials.headers().await?;
        tracing::debug!(url = self.url, "generating impersonated ID token");
        self.client
            .generate_id_token(&self.url, source_headers, &self.request)
            .await
    }
}
