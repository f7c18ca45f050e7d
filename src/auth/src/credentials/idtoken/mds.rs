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

//! Obtain [OIDC ID tokens] using [Metadata Service].
//!
//! Google Cloud environments such as [Google Compute Engine (GCE)][gce-link],
//! [Google Kubernetes Engine (GKE)][gke-link], or [Cloud Run] provide a metadata service.
//! This is a local service to the VM (or pod) which (as the name implies) provides
//! metadata information about the environment. The service also provides access
//! tokens associated with the [default service account] for the corresponding
//! VM. This module provides a builder for `IdTokenCredentials`
//! from such metadata service.
//!
//! The default host name of the metadata service is `metadata.google.internal`.
//! If you would like to use a different hostname, you can set it using the
//! `GCE_METADATA_HOST` environment variable.
//!
//! `IdTokenCredentials` obtain OIDC ID tokens, which are commonly
//! used for [service to service authentication]. For example, when the
//! target service is hosted in Cloud Run or mediated by Identity-Aware Proxy (IAP).
//!
//! Unlike access tokens, ID tokens are not used to authorize access to
//! Google Cloud APIs but to verify the identity of a principal.
//!
//! ## Example: Creating MDS sourced credentials with target audience and sending ID Tokens.
//!
//! ```
//! # use google_cloud_credentials::credentials::idtoken;
//! # use reqwest;
//! # tokio_test::block_on(async {
//! let audience = "https://example.com";
//! let credentials = idtoken::mds::Builder::new(audience)
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
//! [service to service authentication]: https://cloud.google.com/run/docs/authenticating/service-to-service
//! [Cloud Run]: https://cloud.google.com/run
//! [default service account]: https://cloud.google.com/iam/docs/service-account-types#default
//! [gce-link]: https://cloud.google.com/products/compute
//! [gke-link]: https://cloud.google.com/kubernetes-engine
//! [Metadata Service]: https://cloud.google.com/compute/docs/metadata/overview

use crate::credentials::idtoken::{IdTokenCredentials, IdTokenProvider};
use crate::mds::client::{Client as MDSClient, IdTokenFormat};
use crate::{BuildResult, Result};

/// Specifies what assertions are included in ID Tokens fetched from the Metadata Service.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Format {
    /// Omit project and instance details from the payload. It's the default value.
    Standard,
    /// Include project and instance details in the payload.
    Full,
}

impl From<Format> for IdTokenFormat {
    fn from(value: Format) -> Self {
        match value {
            Format::Standard => IdTokenFormat::Standard,
            Format::Full => IdTokenFormat::Full,
        }
    }
}

/// Creates [IdTokenCredentials] instances that fetch ID tokens from the
/// metadata service.
#[derive(Debug)]
pub struct Builder {
    endpoint: Option<String>,
    format: Option<Format>,
    licenses: Option<bool>,
    target_audience: String,
}

impl Builder {
    /// Creates a new `Builder`.
    ///
    /// The `target_audience` is a required parameter that specifies the
    /// intended audience of the ID token. This is typically the URL of the
    /// service that will be receiving the token.
    pub fn new<S: Into<String>>(target_audience: S) -> Self {
        Builder {
            format: None,
            endpoint: None,
            licenses: None,
            target_audience: target_audience.into(),
        }
    }

    /// Sets the endpoint for this credentials.
    ///
    /// If not set, the credentials use `http://metadata.google.internal`.
    /// The `GCE_METADATA_HOST` environment variable takes precedence.
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the [format] of the token.
    ///
    /// Specifies whether or not the project and instance details are included in the payload.
    /// Specify `full` to include this information in the payload or `standard` to omit the information
    /// from the payload. The default value is `standard`.
    ///
    /// [format]: https://cloud.google.com/compute/docs/instances/verifying-instance-identity#token_format
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Whether to include the [license codes] of the instance in the token.
    ///
    /// Specify `true` to include this information or `false` to omit this information from the payload.
    /// The default value is `false`. Has no effect unless format is `full`.
    ///
    /// [license codes]: https://cloud.google.com/compute/docs/reference/rest/v1/images/get#body.Image.FIELDS.license_code
    pub fn with_licenses(mut self, licenses: bool) -> Self {
        self.licenses = Some(licenses);
        self
    }

    /// Returns an [IdTokenCredentials] instance with the configured settings.
    pub fn build(self) -> BuildResult<IdTokenCredentials> {
        Ok(IdTokenCredentials::from(MDSIdTokenProvider {
            client: MDSClient::new(self.endpoint),
            target_audience: self.target_audience,
            format: self.format,
            licenses: self.licenses,
        }))
    }
}

#[derive(Debug)]
struct MDSIdTokenProvider {
    client: MDSClient,
    target_audience: String,
    format: Option<Format>,
    licenses: Option<bool>,
}

impl IdTokenProvider for MDSIdTokenProvider {
    async fn id_token(&self) -> Result<String> {
        tracing::debug!(
            audience = self.target_audience,
            "fetching ID token from the metadata service"
        );
        self.client
            .id_token(
                &self.target_audience,
                self.format.map(IdTokenFormat::from),
                self.licenses,
            )
            .await
    }
}
