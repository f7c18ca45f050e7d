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

use crate::mds::client::Client as MDSClient;
use crate::signer::iam::SignBlobClient;
use crate::signer::{Result, SigningError, SigningProvider};
use tokio::sync::OnceCell;

// Implements Signer for the metadata service, the email of the default
// service account is fetched on first use.
#[derive(Debug)]
pub(crate) struct MDSSigner {
    client: MDSClient,
    client_email: OnceCell<String>,
    inner: SignBlobClient,
}

impl MDSSigner {
    pub(crate) fn new(client: MDSClient, inner: SignBlobClient) -> Self {
        Self {
            client,
            client_email: OnceCell::new(),
            inner,
        }
    }
}

impl SigningProvider for MDSSigner {
    async fn client_email(&self) -> Result<String> {
        let email = self
            .client_email
            .get_or_try_init(|| self.client.email())
            .await
            .map_err(SigningError::transport)?;
        Ok(email.clone())
    }

    async fn sign(&self, content: &[u8]) -> Result<Vec<u8>> {
        let client_email = self.client_email().await?;
        self.inner.sign_as(&client_email, content).await
    }
}
