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

//! A client for the [IAM Service Account Credentials API].
//!
//! Every call is retried on server errors, as configured by [RetryConfig].
//! All calls made through one client share an adaptive retry throttler.
//!
//! [IAM Service Account Credentials API]: https://cloud.google.com/iam/docs/reference/credentials/rest

use crate::Result;
use crate::errors::{CredentialsError, from_http_response};
use crate::retry::{RetryConfig, new_throttler, send_with_retry};
use crate::token::AccessToken;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use gax::retry_throttler::SharedRetryThrottler;
use http::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Returns the URL for `method` on the service account `email`.
pub(crate) fn service_account_url(endpoint: &str, email: &str, method: &str) -> String {
    format!(
        "{}/v1/projects/-/serviceAccounts/{email}:{method}",
        endpoint.trim_end_matches('/')
    )
}

#[derive(Clone, Debug)]
pub(crate) struct IamClient {
    client: reqwest::Client,
    retry: RetryConfig,
    throttler: SharedRetryThrottler,
}

impl IamClient {
    pub(crate) fn new(retry: RetryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            retry,
            throttler: new_throttler(),
        }
    }

    /// Calls `generateAccessToken`, authenticated with `source_headers`.
    pub(crate) async fn generate_access_token(
        &self,
        url: &str,
        source_headers: HeaderMap,
        request: &GenerateAccessTokenRequest,
    ) -> Result<AccessToken> {
        let response: GenerateAccessTokenResponse = self
            .post("generateAccessToken", url, source_headers, request)
            .await?;
        let expire_time = OffsetDateTime::parse(&response.expire_time, &Rfc3339).map_err(|e| {
            CredentialsError::new(false, "invalid expireTime in generateAccessToken response", e)
        })?;
        Ok(AccessToken::new(response.access_token).with_expires_at(SystemTime::from(expire_time)))
    }

    /// Calls `generateIdToken`, authenticated with `source_headers`.
    pub(crate) async fn generate_id_token(
        &self,
        url: &str,
        source_headers: HeaderMap,
        request: &GenerateIdTokenRequest,
    ) -> Result<String> {
        let response: GenerateIdTokenResponse = self
            .post("generateIdToken", url, source_headers, request)
            .await?;
        Ok(response.token)
    }

    /// Calls `signBlob`, authenticated with `source_headers`.
    pub(crate) async fn sign_blob(
        &self,
        url: &str,
        source_headers: HeaderMap,
        payload: &[u8],
    ) -> Result<SignedBlob> {
        let request = SignBlobRequest {
            payload: BASE64_STANDARD.encode(payload),
        };
        let response: SignBlobResponse = self
            .post("signBlob", url, source_headers, &request)
            .await?;
        let signature = BASE64_STANDARD.decode(&response.signed_blob).map_err(|e| {
            CredentialsError::new(false, "invalid signedBlob in signBlob response", e)
        })?;
        Ok(SignedBlob {
            key_id: response.key_id,
            signature,
        })
    }

    async fn post<Req, Resp>(
        &self,
        operation: &str,
        url: &str,
        source_headers: HeaderMap,
        body: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = send_with_retry(&self.retry, self.throttler.clone(), operation, || {
            self.client
                .post(url)
                .headers(source_headers.clone())
                .json(body)
                .send()
        })
        .await?;
        if !response.status().is_success() {
            return Err(from_http_response(response, &format!("{operation} failed")).await);
        }
        response.json::<Resp>().await.map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::new(retryable, format!("cannot parse the {operation} response"), e)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct GenerateAccessTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) delegates: Option<Vec<String>>,
    pub(crate) scope: Vec<String>,
    pub(crate) lifetime: String,
}

impl GenerateAccessTokenRequest {
    pub(crate) fn new(delegates: Option<Vec<String>>, scope: Vec<String>, lifetime: Duration) -> Self {
        Self {
            delegates,
            scope,
            lifetime: format!("{}s", lifetime.as_secs()),
        }
    }
}

#[derive(serde::Deserialize)]
struct GenerateAccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct GenerateIdTokenRequest {
    pub(crate) audience: String,
    #[serde(rename = "includeEmail")]
    pub(crate) include_email: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) delegates: Option<Vec<String>>,
}

#[derive(serde::Deserialize)]
struct GenerateIdTokenResponse {
    token: String,
}

#[derive(Serialize)]
struct SignBlobRequest {
    payload: String,
}

#[derive(serde::Deserialize)]
struct SignBlobResponse {
    #[serde(rename = "keyId", default)]
    key_id: String,
    #[serde(rename = "signedBlob")]
    signed_blob: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SignedBlob {
    pub(crate) key_id: String,
    pub(crate) signature: Vec<u8>,
}
