// Copyright 2026 Google LLC
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

use crate::clock::Clock;
use crate::errors::{self, CredentialsError};
use crate::token::{AccessToken, expires_in};
use reqwest::{Client as ReqwestClient, RequestBuilder};

/// A client for the Compute Engine metadata service.
#[derive(Clone, Debug)]
pub(crate) struct Client {
    endpoint: String,
    inner: ReqwestClient,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub(crate) struct MDSTokenResponse {
    pub(crate) access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) expires_in: Option<u64>,
    pub(crate) token_type: String,
}

/// The `format` parameter for ID tokens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum IdTokenFormat {
    Standard,
    Full,
}

impl IdTokenFormat {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }
}

impl Client {
    /// Creates a new client for the metadata service.
    ///
    /// `GCE_METADATA_HOST` takes precedence over `endpoint_override`.
    pub(crate) fn new(endpoint_override: Option<String>) -> Self {
        let endpoint = Self::resolve_endpoint(endpoint_override);
        let endpoint = endpoint.trim_end_matches('/').to_string();
        Self {
            endpoint,
            inner: ReqwestClient::new(),
        }
    }

    fn resolve_endpoint(endpoint_override: Option<String>) -> String {
        if let Ok(host) = std::env::var(super::GCE_METADATA_HOST_ENV_VAR) {
            return format!("http://{host}");
        }
        endpoint_override.unwrap_or_else(|| super::METADATA_ROOT.to_string())
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.endpoint, path);
        self.inner
            .get(url)
            .header(super::METADATA_FLAVOR, super::METADATA_FLAVOR_VALUE)
    }

    /// Fetches an access token for the default service account.
    ///
    /// The expiration time is relative to `clock`.
    pub(crate) async fn access_token(
        &self,
        scopes: Option<&[String]>,
        clock: &dyn Clock,
    ) -> crate::Result<AccessToken> {
        let path = format!("{}/token", super::MDS_DEFAULT_URI);
        let request = self.get(&path);
        // Without `scopes` the service uses the scopes of the instance.
        let request = match scopes {
            Some(s) => request.query(&[("scopes", s.join(","))]),
            None => request,
        };

        let error_message = "failed to fetch access token";
        let response = request
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, error_message))?;
        let response = Self::check_response_status(response, error_message).await?;

        let response = response.json::<MDSTokenResponse>().await.map_err(|e| {
            // A response that does not parse usually means the request went
            // to something other than the metadata service.
            CredentialsError::new(!e.is_decode(), "cannot parse the access token response", e)
        })?;

        let mut token = AccessToken::new(response.access_token);
        token.token_type = response.token_type;
        token.expires_at = response.expires_in.map(|s| expires_in(clock, s));
        if let Some(s) = scopes {
            token = token.with_scopes(s.iter().cloned());
        }
        Ok(token)
    }

    /// Fetches an ID token for the default service account.
    pub(crate) async fn id_token(
        &self,
        target_audience: &str,
        format: Option<IdTokenFormat>,
        licenses: Option<bool>,
    ) -> crate::Result<String> {
        let path = format!("{}/identity", super::MDS_DEFAULT_URI);
        let mut request = self.get(&path).query(&[("audience", target_audience)]);
        if let Some(f) = format {
            request = request.query(&[("format", f.as_str())]);
        }
        if let Some(l) = licenses {
            request = request.query(&[("licenses", if l { "TRUE" } else { "FALSE" })]);
        }

        let error_message = "failed to fetch id token";
        let response = request
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, error_message))?;
        let response = Self::check_response_status(response, error_message).await?;
        response
            .text()
            .await
            .map_err(|e| CredentialsError::from_source(!e.is_decode(), e))
    }

    /// Fetches the email of the default service account.
    pub(crate) async fn email(&self) -> crate::Result<String> {
        let path = format!("{}/email", super::MDS_DEFAULT_URI);
        let error_message = "failed to fetch email";
        let response = self
            .get(&path)
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, error_message))?;
        let response = Self::check_response_status(response, error_message).await?;
        let email = response
            .text()
            .await
            .map_err(|e| CredentialsError::from_source(!e.is_decode(), e))?;
        Ok(email.trim().to_string())
    }

    async fn check_response_status(
        response: reqwest::Response,
        error_message: &str,
    ) -> crate::Result<reqwest::Response> {
        if !response.status().is_success() {
            return Err(errors::from_http_response(response, error_message).await);
        }
        Ok(response)
    }
}
