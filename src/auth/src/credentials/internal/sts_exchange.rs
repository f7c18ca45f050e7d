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
use crate::constants::{ACCESS_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT_TYPE};
use crate::errors::{CredentialsError, from_http_error, from_oauth_response};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;

/// Handles OAuth2 Secure Token Service (STS) exchange.
/// Reference: https://datatracker.ietf.org/doc/html/rfc8693
#[derive(Clone, Debug, Default)]
pub(crate) struct StsHandler {
    client: reqwest::Client,
}

impl StsHandler {
    /// Performs an oauth2 token exchange with the provided [ExchangeTokenRequest] information.
    pub(crate) async fn exchange_token(&self, req: ExchangeTokenRequest) -> Result<TokenResponse> {
        let mut params: HashMap<&str, String> = HashMap::new();

        params.insert("grant_type", TOKEN_EXCHANGE_GRANT_TYPE.to_string());
        params.insert(
            "requested_token_type",
            req.requested_token_type
                .unwrap_or_else(|| ACCESS_TOKEN_TYPE.to_string()),
        );
        params.insert("subject_token", req.subject_token);
        params.insert("subject_token_type", req.subject_token_type);

        if !req.scope.is_empty() {
            params.insert("scope", req.scope.join(" "));
        }
        if let Some(audience) = req.audience {
            params.insert("audience", audience);
        }
        if let Some(resource) = req.resource {
            params.insert("resource", resource);
        }
        if let Some(actor_token) = req.actor_token {
            params.insert("actor_token", actor_token);
        }
        if let Some(actor_token_type) = req.actor_token_type {
            params.insert("actor_token_type", actor_token_type);
        }
        if let Some(options) = req.options {
            params.insert("options", options);
        }

        self.execute(req.url, req.authentication, req.headers, params)
            .await
    }

    async fn execute(
        &self,
        url: String,
        client_auth: ClientAuthentication,
        mut headers: http::HeaderMap,
        params: HashMap<&str, String>,
    ) -> Result<TokenResponse> {
        client_auth.inject_auth(&mut headers)?;

        let res = self
            .client
            .post(url)
            .form(&params)
            .headers(headers)
            .send()
            .await
            .map_err(|e| from_http_error(e, "failed to send the STS token exchange request"))?;

        if !res.status().is_success() {
            return Err(from_oauth_response(res, "the STS token exchange failed").await);
        }
        res.json::<TokenResponse>().await.map_err(|e| {
            CredentialsError::new(false, "cannot parse the STS token exchange response", e)
        })
    }
}

/// TokenResponse is used to decode the remote server response during
/// an oauth2 token exchange.
#[derive(Deserialize, Default, PartialEq, Debug)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) issued_token_type: String,
    pub(crate) token_type: String,
    pub(crate) expires_in: u64,
    pub(crate) scope: Option<String>,
    pub(crate) refresh_token: Option<String>,
}

/// ClientAuthentication represents an OAuth client ID and secret, sent using
/// the HTTP Basic authentication scheme as stated in
/// https://datatracker.ietf.org/doc/html/rfc6749#section-2.3.1.
#[derive(Clone, Default, PartialEq)]
pub(crate) struct ClientAuthentication {
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
}

impl std::fmt::Debug for ClientAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuthentication")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[censored]"))
            .finish()
    }
}

impl ClientAuthentication {
    pub(crate) fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    // Add authentication to a Secure Token Service exchange request.
    fn inject_auth(&self, headers: &mut http::HeaderMap) -> Result<()> {
        if let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) {
            let plain_header = format!("{client_id}:{client_secret}");
            let encoded = base64::engine::general_purpose::STANDARD.encode(plain_header);
            let mut value = http::HeaderValue::from_str(&format!("Basic {encoded}"))
                .map_err(|e| CredentialsError::new(false, "invalid client credentials", e))?;
            value.set_sensitive(true);
            headers.insert(http::header::AUTHORIZATION, value);
        }
        Ok(())
    }
}

/// Information required to perform an oauth2 token exchange with the provided endpoint.
#[derive(Default)]
pub(crate) struct ExchangeTokenRequest {
    pub(crate) url: String,
    pub(crate) authentication: ClientAuthentication,
    pub(crate) headers: http::HeaderMap,
    pub(crate) resource: Option<String>,
    pub(crate) subject_token: String,
    pub(crate) subject_token_type: String,
    pub(crate) requested_token_type: Option<String>,
    pub(crate) audience: Option<String>,
    pub(crate) scope: Vec<String>,
    pub(crate) actor_token: Option<String>,
    pub(crate) actor_token_type: Option<String>,
    /// An opaque, already serialized, `options` field.
    pub(crate) options: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_SCOPE, JWT_TOKEN_TYPE};
    use crate::errors::OAuthError;
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use std::error::Error as _;
    use tokio_test::assert_err;

    type TestResult = anyhow::Result<()>;

    const RESPONSE_BODY: &str = r#"{"access_token":"an_example_token","issued_token_type":"urn:ietf:params:oauth:token-type:access_token","token_type":"Bearer","expires_in":3600,"scope":"https://www.googleapis.com/auth/cloud-platform"}"#;

    fn expected_response() -> TokenResponse {
        TokenResponse {
            access_token: "an_example_token".to_string(),
            refresh_token: None,
            issued_token_type: ACCESS_TOKEN_TYPE.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            scope: Some(DEFAULT_SCOPE.to_string()),
        }
    }

    #[tokio::test]
    async fn exchange_token() -> TestResult {
        let client_auth = ClientAuthentication {
            client_id: Some("client_id".to_string()),
            client_secret: Some("supersecret".to_string()),
        };

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/sts"),
                request::body(url_decoded(contains((
                    "grant_type",
                    TOKEN_EXCHANGE_GRANT_TYPE
                )))),
                request::body(url_decoded(contains(("subject_token", "an_example_token")))),
                request::body(url_decoded(contains((
                    "requested_token_type",
                    ACCESS_TOKEN_TYPE
                )))),
                request::body(url_decoded(contains((
                    "subject_token_type",
                    JWT_TOKEN_TYPE
                )))),
                request::body(url_decoded(contains((
                    "audience",
                    "32555940559.apps.googleusercontent.com"
                )))),
                request::body(url_decoded(contains(("scope", "scope-a scope-b")))),
                request::body(url_decoded(not(contains(key("resource"))))),
                request::body(url_decoded(not(contains(key("actor_token"))))),
                request::body(url_decoded(not(contains(key("actor_token_type"))))),
                request::body(url_decoded(not(contains(key("options"))))),
                request::headers(contains((
                    "authorization",
                    "Basic Y2xpZW50X2lkOnN1cGVyc2VjcmV0"
                ))),
                request::headers(contains((
                    "content-type",
                    "application/x-www-form-urlencoded"
                ))),
                request::headers(contains(("x-test-header", "test-value"))),
            ])
            .respond_with(status_code(200).body(RESPONSE_BODY)),
        );

        let mut headers = http::HeaderMap::new();
        headers.insert("x-test-header", http::HeaderValue::from_static("test-value"));
        let token_req = ExchangeTokenRequest {
            url: server.url("/sts").to_string(),
            headers,
            authentication: client_auth,
            audience: Some("32555940559.apps.googleusercontent.com".to_string()),
            scope: vec!["scope-a".to_string(), "scope-b".to_string()],
            subject_token: "an_example_token".to_string(),
            subject_token_type: JWT_TOKEN_TYPE.to_string(),
            ..ExchangeTokenRequest::default()
        };
        let handler = StsHandler::default();
        let resp = handler.exchange_token(token_req).await?;
        assert_eq!(resp, expected_response());

        Ok(())
    }

    #[tokio::test]
    async fn exchange_token_optional_fields() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/sts"),
                request::body(url_decoded(contains((
                    "requested_token_type",
                    "urn:test:requested"
                )))),
                request::body(url_decoded(contains(("resource", "test-resource")))),
                request::body(url_decoded(contains(("actor_token", "test-actor-token")))),
                request::body(url_decoded(contains(("actor_token_type", "urn:test:actor")))),
                request::body(url_decoded(contains((
                    "options",
                    r#"{"userProject":"test-project"}"#
                )))),
                request::body(url_decoded(not(contains(key("scope"))))),
                request::body(url_decoded(not(contains(key("audience"))))),
                request::headers(not(contains(key("authorization")))),
            ])
            .respond_with(status_code(200).body(RESPONSE_BODY)),
        );

        let token_req = ExchangeTokenRequest {
            url: server.url("/sts").to_string(),
            subject_token: "an_example_token".to_string(),
            subject_token_type: JWT_TOKEN_TYPE.to_string(),
            requested_token_type: Some("urn:test:requested".to_string()),
            resource: Some("test-resource".to_string()),
            actor_token: Some("test-actor-token".to_string()),
            actor_token_type: Some("urn:test:actor".to_string()),
            options: Some(r#"{"userProject":"test-project"}"#.to_string()),
            ..ExchangeTokenRequest::default()
        };
        let resp = StsHandler::default().exchange_token(token_req).await?;
        assert_eq!(resp, expected_response());
        Ok(())
    }

    #[tokio::test]
    async fn exchange_token_oauth_error() -> TestResult {
        let response_body = serde_json::json!({
            "error": "invalid_grant",
            "error_description": "the subject token is expired",
            "error_uri": "https://example.com/errors",
        });

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/fail"))
                .respond_with(status_code(400).body(response_body.to_string())),
        );

        let token_req = ExchangeTokenRequest {
            url: server.url("/fail").to_string(),
            subject_token: "an_example_token".to_string(),
            subject_token_type: JWT_TOKEN_TYPE.to_string(),
            ..ExchangeTokenRequest::default()
        };
        let err = assert_err!(StsHandler::default().exchange_token(token_req).await);
        assert!(!err.is_transient(), "{err:?}");
        let oauth = err
            .source()
            .and_then(|e| e.downcast_ref::<OAuthError>())
            .expect("source should be an OAuthError");
        assert_eq!(oauth.code(), "invalid_grant");
        assert_eq!(oauth.description(), Some("the subject token is expired"));
        assert_eq!(oauth.uri(), Some("https://example.com/errors"));
        assert_eq!(
            oauth.to_string(),
            "Error code invalid_grant: the subject token is expired - https://example.com/errors"
        );
        Ok(())
    }

    #[tokio::test]
    async fn exchange_token_oauth_error_code_only() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/fail"))
                .respond_with(status_code(503).body(r#"{"error":"temporarily_unavailable"}"#)),
        );

        let token_req = ExchangeTokenRequest {
            url: server.url("/fail").to_string(),
            ..ExchangeTokenRequest::default()
        };
        let err = assert_err!(StsHandler::default().exchange_token(token_req).await);
        assert!(err.is_transient(), "{err:?}");
        let oauth = err
            .source()
            .and_then(|e| e.downcast_ref::<OAuthError>())
            .expect("source should be an OAuthError");
        assert_eq!(oauth.to_string(), "Error code temporarily_unavailable");
        Ok(())
    }

    #[tokio::test]
    async fn exchange_token_unstructured_error() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/fail"))
                .respond_with(status_code(401).body("go away")),
        );

        let token_req = ExchangeTokenRequest {
            url: server.url("/fail").to_string(),
            ..ExchangeTokenRequest::default()
        };
        let err = assert_err!(StsHandler::default().exchange_token(token_req).await);
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.source().is_none(), "{err:?}");
        let msg = err.to_string();
        assert!(msg.contains("401"), "{msg}");
        assert!(msg.contains("go away"), "{msg}");
        Ok(())
    }

    #[tokio::test]
    async fn exchange_token_transport_error() -> TestResult {
        // Find a port with nothing listening on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let token_req = ExchangeTokenRequest {
            url: format!("http://{addr}/sts"),
            ..ExchangeTokenRequest::default()
        };
        let err = assert_err!(StsHandler::default().exchange_token(token_req).await);
        assert!(err.is_transient(), "{err:?}");
        let source = err.source().and_then(|e| e.downcast_ref::<reqwest::Error>());
        assert!(source.is_some_and(|e| e.is_connect()), "{err:?}");
        Ok(())
    }

    #[test]
    fn client_authentication_debug() {
        let auth = ClientAuthentication {
            client_id: Some("test-client-id".to_string()),
            client_secret: Some("test-client-secret".to_string()),
        };
        let fmt = format!("{auth:?}");
        assert!(fmt.contains("test-client-id"), "{fmt}");
        assert!(!fmt.contains("test-client-secret"), "{fmt}");
        assert!(auth.is_configured());
        assert!(!ClientAuthentication::default().is_configured());
    }
}
