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

use crate::constants::IAM_CREDENTIALS_ENDPOINT;
use crate::credentials::Credentials;
use crate::credentials::internal::iam::{IamClient, service_account_url};
use crate::retry::RetryConfig;
use crate::signer::{Result, SigningError, SigningProvider};

/// Calls IAM `signBlob`, authenticating with existing [Credentials].
#[derive(Debug)]
pub(crate) struct SignBlobClient {
    credentials: Credentials,
    endpoint: String,
    client: IamClient,
}

impl SignBlobClient {
    pub(crate) fn new(credentials: Credentials, retry: RetryConfig) -> Self {
        Self {
            credentials,
            endpoint: IAM_CREDENTIALS_ENDPOINT.to_string(),
            client: IamClient::new(retry),
        }
    }

    pub(crate) fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Signs `content` as the service account `client_email`.
    pub(crate) async fn sign_as(&self, client_email: &str, content: &[u8]) -> Result<Vec<u8>> {
        let headers = self
            .credentials
            .headers()
            .await
            .map_err(SigningError::transport)?;
        let url = service_account_url(&self.endpoint, client_email, "signBlob");
        let signed = self
            .client
            .sign_blob(&url, headers, content)
            .await
            .map_err(SigningError::transport)?;
        Ok(signed.signature)
    }
}

// Implements Signer using IAM signBlob API for a known service account.
#[derive(Debug)]
pub(crate) struct IamSigner {
    client_email: String,
    inner: SignBlobClient,
}

impl IamSigner {
    pub(crate) fn new(client_email: String, inner: SignBlobClient) -> Self {
        Self {
            client_email,
            inner,
        }
    }
}

impl SigningProvider for IamSigner {
    async fn client_email(&self) -> Result<String> {
        Ok(self.client_email.clone())
    }

    async fn sign(&self, content: &[u8]) -> Result<Vec<u8>> {
        self.inner.sign_as(&self.client_email, content).await
    }
}
