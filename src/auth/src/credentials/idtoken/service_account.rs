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

//! Obtain [OIDC ID tokens] using [Service Accounts].
//!
//! While the Google Cloud client libraries for Rust automatically use the types
//! in this module when ADC finds a service account key file, you may want to
//! use these types directly when the service account key is obtained from
//! Cloud Secret Manager or a similar service.
//!
//! `IdTokenCredentials` obtain OIDC ID tokens, which are commonly
//! used for [service to service authentication]. For example, when the
//! target service is hosted in Cloud Run or mediated by Identity-Aware Proxy (IAP).
//!
//! Unlike access tokens, ID tokens are not used to authorize access to
//! Google Cloud APIs but to verify the identity of a principal.
//!
//! # Example: Creating Service Account sourced credentials with target audience and sending ID Tokens.
//! ```no_run
//! # use google_cloud_credentials::credentials::idtoken;
//! # use reqwest;
//! # tokio_test::block_on(async {
//! let service_account_key = serde_json::json!({
//!     "client_email": "test-client-email",
//!     "private_key_id": "test-private-key-id",
//!     "private_key": "<YOUR_PKCS8_PEM_KEY_HERE>",
//!     "project_id": "test-project-id",
//!     "universe_domain": "test-universe-domain",
//! });
//! let audience = "https://example.com";
//! let credentials = idtoken::service_account::Builder::new(audience, service_account_key)
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
//! [OIDC ID tokens]: https://cloud.google.com/docs/authentication/token-types#identity-tokens
//! [Service Accounts]: https://cloud.google.com/iam/docs/service-account-overview
//! [service to service authentication]: https://cloud.google.com/run/docs/authenticating/service-to-service

use crate::build_errors::Error as BuilderError;
use crate::credentials::idtoken::{IdTokenCredentials, IdTokenProvider};
use crate::credentials::service_account::jws::JwsClaims;
use crate::credentials::service_account::{JWT_BEARER_GRANT_TYPE, ServiceAccountKey};
use crate::errors::{CredentialsError, from_http_error, from_oauth_response};
use crate::{BuildResult, Result};
use reqwest::Client;
use serde_json::Value;

const MSG: &str = "failed to exchange the service account assertion for an ID token";

/// Creates [IdTokenCredentials] instances that sign an assertion with the
/// service account key, and exchange it for an ID token.
#[derive(Debug)]
pub struct Builder {
    service_account_key: Value,
    target_audience: String,
    token_uri: Option<String>,
}

impl Builder {
    /// Creates a new builder for ID tokens with the given `target_audience`,
    /// using a [service account key] JSON value.
    ///
    /// [service account key]: https://cloud.google.com/iam/docs/keys-create-delete#creating
    pub fn new<S: Into<String>>(target_audience: S, service_account_key: Value) -> Self {
        Self {
            service_account_key,
            target_audience: target_audience.into(),
            token_uri: None,
        }
    }

    /// Overrides the OAuth 2.0 token endpoint.
    ///
    /// Defaults to the `token_uri` in the key, or
    /// `https://oauth2.googleapis.com/token`.
    pub fn with_token_uri<S: Into<String>>(mut self, token_uri: S) -> Self {
        self.token_uri = Some(token_uri.into());
        self
    }

    /// Returns an [IdTokenCredentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] if the key cannot be deserialized. The
    /// private key itself is only loaded when a token is needed.
    pub fn build(self) -> BuildResult<IdTokenCredentials> {
        let key = serde_json::from_value::<ServiceAccountKey>(self.service_account_key)
            .map_err(BuilderError::parsing)?;
        let token_uri = self
            .token_uri
            .unwrap_or_else(|| key.token_uri().to_string());
        Ok(IdTokenCredentials::from(ServiceAccountIdTokenProvider {
            key,
            target_audience: self.target_audience,
            token_uri,
            client: Client::new(),
        }))
    }
}

#[derive(Debug)]
struct ServiceAccountIdTokenProvider {
    key: ServiceAccountKey,
    target_audience: String,
    token_uri: String,
    client: Client,
}

#[derive(serde::Deserialize)]
struct IdTokenResponse {
    id_token: String,
}

impl ServiceAccountIdTokenProvider {
    fn assertion(&self) -> Result<String> {
        let claims = JwsClaims {
            aud: Some(self.token_uri.clone()),
            target_audience: Some(self.target_audience.clone()),
            ..JwsClaims::new(&self.key.client_email)
        };
        self.key.signed_jwt(&claims)
    }
}

impl IdTokenProvider for ServiceAccountIdTokenProvider {
    async fn id_token(&self) -> Result<String> {
        let assertion = self.assertion()?;
        let response = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| from_http_error(e, MSG))?;
        if !response.status().is_success() {
            return Err(from_oauth_response(response, MSG).await);
        }
        let response = response.json::<IdTokenResponse>().await.map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::new(retryable, MSG, e)
        })?;
        Ok(response.id_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::idtoken::tests::test_id_token;
    use crate::credentials::service_account::tests::{decode_jwt, test_key_json};
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use serde_json::json;
    use std::time::{Duration, SystemTime};

    type TestResult = anyhow::Result<()>;

    const AUDIENCE: &str = "https://example.com";

    #[tokio::test]
    async fn id_token_success() -> TestResult {
        let token = test_id_token(AUDIENCE, SystemTime::now() + Duration::from_secs(3600));
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(url_decoded(contains(("grant_type", JWT_BEARER_GRANT_TYPE)))),
                request::body(url_decoded(contains(key("assertion")))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({"id_token": token}))),
        );

        let credentials = Builder::new(AUDIENCE, test_key_json())
            .with_token_uri(server.url("/token").to_string())
            .build()?;
        assert_eq!(credentials.id_token().await?, token);
        // Served from the cache.
        assert_eq!(credentials.id_token().await?, token);
        Ok(())
    }

    #[test]
    fn assertion_claims() -> TestResult {
        let provider = ServiceAccountIdTokenProvider {
            key: serde_json::from_value(test_key_json())?,
            target_audience: AUDIENCE.to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            client: Client::new(),
        };
        let (header, claims) = decode_jwt(&provider.assertion()?);
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "test-private-key-id");
        assert_eq!(claims["iss"], "test-client-email");
        assert_eq!(claims["aud"], "https://oauth2.googleapis.com/token");
        assert_eq!(claims["target_audience"], AUDIENCE);
        assert!(claims.get("scope").is_none(), "{claims:?}");
        Ok(())
    }

    #[tokio::test]
    async fn oauth_error() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token")).respond_with(
                status_code(400).body(
                    json!({"error": "invalid_grant", "error_description": "bad assertion"})
                        .to_string(),
                ),
            ),
        );
        let credentials = Builder::new(AUDIENCE, test_key_json())
            .with_token_uri(server.url("/token").to_string())
            .build()?;
        let err = credentials.id_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn invalid_private_key() -> TestResult {
        let mut key = test_key_json();
        key["private_key"] = json!("not a PEM");
        // No expectations, the assertion fails before any request.
        let server = Server::run();
        let credentials = Builder::new(AUDIENCE, key)
            .with_token_uri(server.url("/token").to_string())
            .build()?;
        let err = credentials.id_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        Ok(())
    }

    #[test]
    fn missing_fields() {
        let err = Builder::new(AUDIENCE, json!({"client_email": "a"}))
            .build()
            .unwrap_err();
        assert!(err.is_parsing(), "{err:?}");
    }
}
