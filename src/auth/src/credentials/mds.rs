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

//! [Metadata Service] Credentials type.
//!
//! Google Cloud environments such as [Google Compute Engine (GCE)][gce-link],
//! [Google Kubernetes Engine (GKE)][gke-link], or [Cloud Run] provide a metadata service.
//! This is a local service to the VM (or pod) which (as the name implies) provides
//! metadata information about the VM. The service also provides access
//! tokens associated with the [default service account] for the corresponding
//! VM.
//!
//! You can use this access token to securely authenticate with Google Cloud,
//! without having to download secrets or other credentials.
//!
//! The `GCE_METADATA_HOST` environment variable, if set, overrides the host
//! of the metadata service.
//!
//! Example usage:
//!
//! ```
//! # use google_cloud_credentials::credentials::mds::Builder;
//! # tokio_test::block_on(async {
//! let credentials = Builder::default()
//!     .with_quota_project_id("my-quota-project")
//!     .build();
//! # });
//! ```
//!
//! [Cloud Run]: https://cloud.google.com/run
//! [default service account]: https://cloud.google.com/iam/docs/service-account-types#default
//! [gce-link]: https://cloud.google.com/products/compute
//! [gke-link]: https://cloud.google.com/kubernetes-engine
//! [Metadata Service]: https://cloud.google.com/compute/docs/metadata/overview

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::credentials::{CachedCredentials, Credentials};
use crate::mds::client::Client as MDSClient;
use crate::retry::RetryConfig;
use crate::signer::Signer;
use crate::signer::iam::SignBlobClient;
use crate::signer::mds::MDSSigner;
use crate::token::{AccessToken, TokenProvider};
use async_trait::async_trait;
use std::sync::Arc;

/// Creates [Credentials] instances backed by the [Metadata Service].
///
/// While the Google Cloud client libraries for Rust default to credentials
/// backed by the metadata service, some applications may need to:
/// * Customize the metadata service credentials in some way
/// * Bypass the [Application Default Credentials] lookup and only
///   use the metadata server credentials
/// * Use the credentials directly outside the client libraries
///
/// [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials
/// [Metadata Service]: https://cloud.google.com/compute/docs/metadata/overview
#[derive(Debug, Default)]
pub struct Builder {
    endpoint: Option<String>,
    quota_project_id: Option<String>,
    scopes: Option<Vec<String>>,
    retry_config: RetryConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl Builder {
    /// Sets the endpoint for these credentials.
    ///
    /// If not set, the credentials use `http://metadata.google.internal`.
    /// The `GCE_METADATA_HOST` environment variable takes precedence.
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// In some services, you can use a service account in
    /// one project for authentication and authorization, and charge
    /// the usage to a different project. This may require that the
    /// service account has `serviceusage.services.use` permissions on the quota project.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets the [scopes] for these credentials.
    ///
    /// Metadata server issues tokens based on the requested scopes.
    /// If no scopes are specified, the credentials default to all
    /// scopes configured for the [default service account] on the instance.
    ///
    /// [default service account]: https://cloud.google.com/iam/docs/service-account-types#default
    /// [scopes]: https://developers.google.com/identity/protocols/oauth2/scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Configures the retries for the IAM calls made by [Builder::build_signer].
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Sets the clock used to compute token expiration and detect stale tokens.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    pub fn build(self) -> Credentials {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let token_provider = MDSAccessTokenProvider {
            client: MDSClient::new(self.endpoint),
            scopes: self.scopes,
            clock: clock.clone(),
        };
        Credentials::from(
            CachedCredentials::new(token_provider, self.quota_project_id).with_clock(clock),
        )
    }

    /// Returns a [Signer] for the default service account.
    ///
    /// The signer fetches the service account email from the metadata
    /// service, and signs content with the IAM `signBlob` method.
    pub fn build_signer(self) -> Signer {
        let client = MDSClient::new(self.endpoint.clone());
        let retry_config = self.retry_config.clone();
        let credentials = self.build();
        Signer::from(MDSSigner::new(
            client,
            SignBlobClient::new(credentials, retry_config),
        ))
    }
}

#[derive(Debug)]
struct MDSAccessTokenProvider {
    client: MDSClient,
    scopes: Option<Vec<String>>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl TokenProvider for MDSAccessTokenProvider {
    async fn token(&self) -> Result<AccessToken> {
        tracing::debug!("fetching access token from the metadata service");
        self.client
            .access_token(self.scopes.as_deref(), self.clock.as_ref())
            .await
    }
}
