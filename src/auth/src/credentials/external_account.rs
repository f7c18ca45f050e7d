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

//! [Workload] and [workforce] identity federation credentials.
//!
//! External account credentials exchange a token issued by a third-party
//! identity provider (the *subject token*) for a Google Cloud access token,
//! using the [Security Token Service]. Optionally, the result is used to
//! impersonate a service account.
//!
//! The subject token comes from one of the following sources, selected by
//! the `credential_source` field of the configuration:
//! - a file, as plain text or as a JSON object,
//! - a URL, typically a local metadata server,
//! - AWS, as a signed `GetCallerIdentity` request,
//! - an executable, see [PluggableAuthHandler],
//! - an X.509 certificate.
//!
//! Applications with other token sources use the [ProgrammaticBuilder].
//!
//! [Workload]: https://cloud.google.com/iam/docs/workload-identity-federation
//! [workforce]: https://cloud.google.com/iam/docs/workforce-identity-federation
//! [Security Token Service]: https://cloud.google.com/iam/docs/reference/sts/rest

use crate::build_errors::Error as BuilderError;
use crate::clock::{Clock, SystemClock};
use crate::constants::{DEFAULT_SCOPE, STS_TOKEN_URL};
use crate::credentials::external_account_sources::SubjectTokenContext;
use crate::credentials::external_account_sources::aws_sourced::{
    AwsSourceConfig, AwsSourcedCredentials,
};
use crate::credentials::external_account_sources::certificate_sourced::{
    CertificateConfig, CertificateSourcedCredentials,
};
use crate::credentials::external_account_sources::executable_sourced::{
    ExecutableConfig, ExecutableSourcedCredentials,
};
use crate::credentials::external_account_sources::file_sourced::FileSourcedCredentials;
use crate::credentials::external_account_sources::programmatic_sourced::ProgrammaticSourcedCredentials;
use crate::credentials::external_account_sources::url_sourced::UrlSourcedCredentials;
use crate::credentials::external_account_sources::CredentialSourceFormat;
use crate::credentials::impersonated::principal_from_url;
use crate::credentials::internal::iam::{GenerateAccessTokenRequest, IamClient};
use crate::credentials::internal::sts_exchange::{
    ClientAuthentication, ExchangeTokenRequest, StsHandler,
};
use crate::credentials::subject_token::{SubjectToken, SubjectTokenProvider, dynamic};
use crate::credentials::{CachedCredentials, Credentials};
use crate::headers_util::build_bearer_headers;
use crate::retry::RetryConfig;
use crate::token::{AccessToken, TokenProvider, expires_in, parse_scopes};
use crate::{BuildResult, Result};
use async_trait::async_trait;
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use crate::credentials::external_account_sources::executable_sourced::{
    ExecutableHandler, ExecutableOptions, ExecutableResponse, PluggableAuthHandler,
};

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(600);
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(43200);

/// A representation of an [external account config file].
///
/// [external account config file]: https://google.aip.dev/auth/4117#configuration-file-generation-and-usage
#[derive(Deserialize, Debug)]
struct ExternalAccountFile {
    audience: String,
    subject_token_type: String,
    token_url: Option<String>,
    service_account_impersonation_url: Option<String>,
    service_account_impersonation: Option<ServiceAccountImpersonationFile>,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Option<Vec<String>>,
    workforce_pool_user_project: Option<String>,
    quota_project_id: Option<String>,
    credential_source: CredentialSourceFile,
}

#[derive(Deserialize, Debug, Default)]
struct ServiceAccountImpersonationFile {
    token_lifetime_seconds: Option<u64>,
}

/// The `credential_source` object. The fields present select the source.
#[derive(Deserialize, Debug, Default)]
struct CredentialSourceFile {
    environment_id: Option<String>,
    region_url: Option<String>,
    regional_cred_verification_url: Option<String>,
    imdsv2_session_token_url: Option<String>,
    file: Option<String>,
    url: Option<String>,
    headers: Option<BTreeMap<String, String>>,
    format: Option<CredentialSourceFormat>,
    executable: Option<ExecutableConfig>,
    certificate: Option<CertificateConfig>,
}

/// The options for service account impersonation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ServiceAccountImpersonationOptions {
    pub lifetime: Duration,
}

impl Default for ServiceAccountImpersonationOptions {
    fn default() -> Self {
        Self {
            lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }
}

impl ServiceAccountImpersonationOptions {
    pub(crate) fn new(lifetime: Option<Duration>) -> BuildResult<Self> {
        let lifetime = lifetime.unwrap_or(DEFAULT_TOKEN_LIFETIME);
        if !(MIN_TOKEN_LIFETIME..=MAX_TOKEN_LIFETIME).contains(&lifetime) {
            return Err(BuilderError::invalid_configuration(format!(
                "The \"token_lifetime_seconds\" field must be between {} and {} seconds.",
                MIN_TOKEN_LIFETIME.as_secs(),
                MAX_TOKEN_LIFETIME.as_secs()
            )));
        }
        Ok(Self { lifetime })
    }
}

/// The strategy to fetch subject tokens.
#[derive(Debug, Clone)]
enum CredentialSource {
    File(FileSourcedCredentials),
    Url(UrlSourcedCredentials),
    Aws(AwsSourcedCredentials),
    Executable(ExecutableSourcedCredentials),
    Certificate(CertificateSourcedCredentials),
    Programmatic(ProgrammaticSourcedCredentials),
}

impl CredentialSource {
    fn from_file(
        source: CredentialSourceFile,
        executable_handler: Option<Arc<dyn ExecutableHandler>>,
    ) -> BuildResult<Self> {
        if let Some(environment_id) = source.environment_id {
            let config = AwsSourceConfig {
                environment_id,
                region_url: source.region_url,
                url: source.url,
                regional_cred_verification_url: source.regional_cred_verification_url,
                imdsv2_session_token_url: source.imdsv2_session_token_url,
            };
            return Ok(Self::Aws(AwsSourcedCredentials::new(config)?));
        }
        if let Some(executable) = source.executable {
            let mut credentials = ExecutableSourcedCredentials::new(executable)?;
            if let Some(handler) = executable_handler {
                credentials = credentials.with_handler(handler);
            }
            return Ok(Self::Executable(credentials));
        }
        if let Some(certificate) = source.certificate {
            return Ok(Self::Certificate(CertificateSourcedCredentials::new(
                certificate,
            )?));
        }
        match (source.file, source.url) {
            (Some(_), Some(_)) => Err(BuilderError::invalid_configuration(
                "Only one credential source type can be set, either file or url.",
            )),
            (Some(file), None) => Ok(Self::File(FileSourcedCredentials::new(
                file,
                source.format,
            )?)),
            (None, Some(url)) => Ok(Self::Url(UrlSourcedCredentials::new(
                url,
                source.headers,
                source.format,
            )?)),
            (None, None) => Err(BuilderError::invalid_configuration(
                "Missing credential source file location or URL. At least one must be specified.",
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Url(_) => "url",
            Self::Aws(_) => "aws",
            Self::Executable(_) => "executable",
            Self::Certificate(_) => "certificate",
            Self::Programmatic(_) => "programmatic",
        }
    }

    /// The `credential_source` object for this source. Programmatic sources
    /// have no JSON representation.
    fn to_json(&self) -> Option<Value> {
        match self {
            Self::File(s) => Some(s.to_json()),
            Self::Url(s) => Some(s.to_json()),
            Self::Aws(s) => Some(s.to_json()),
            Self::Executable(s) => Some(s.to_json()),
            Self::Certificate(s) => Some(s.to_json()),
            Self::Programmatic(_) => None,
        }
    }

    async fn subject_token(&self, context: &SubjectTokenContext) -> Result<SubjectToken> {
        match self {
            Self::File(s) => s.subject_token().await,
            Self::Url(s) => s.subject_token().await,
            Self::Aws(s) => s.subject_token(context).await,
            Self::Executable(s) => s.subject_token(context).await,
            Self::Certificate(s) => s.subject_token().await,
            Self::Programmatic(s) => s.subject_token().await,
        }
    }
}

/// The validated configuration of external account credentials.
#[derive(Debug, Clone)]
struct ExternalAccountConfig {
    audience: String,
    subject_token_type: String,
    token_url: String,
    service_account_impersonation_url: Option<String>,
    impersonation: ServiceAccountImpersonationOptions,
    authentication: ClientAuthentication,
    scopes: Vec<String>,
    workforce_pool_user_project: Option<String>,
    quota_project_id: Option<String>,
    credential_source: CredentialSource,
}

impl ExternalAccountConfig {
    fn from_json(
        value: Value,
        executable_handler: Option<Arc<dyn ExecutableHandler>>,
    ) -> BuildResult<Self> {
        let file: ExternalAccountFile =
            serde_json::from_value(value).map_err(BuilderError::parsing)?;
        let credential_source =
            CredentialSource::from_file(file.credential_source, executable_handler)?;
        let lifetime = file
            .service_account_impersonation
            .and_then(|s| s.token_lifetime_seconds)
            .map(Duration::from_secs);
        let config = Self {
            audience: file.audience,
            subject_token_type: file.subject_token_type,
            token_url: file.token_url.unwrap_or_else(|| STS_TOKEN_URL.to_string()),
            service_account_impersonation_url: file.service_account_impersonation_url,
            impersonation: ServiceAccountImpersonationOptions::new(lifetime)?,
            authentication: ClientAuthentication {
                client_id: file.client_id,
                client_secret: file.client_secret,
            },
            scopes: file
                .scopes
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]),
            workforce_pool_user_project: file.workforce_pool_user_project,
            quota_project_id: file.quota_project_id,
            credential_source,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BuildResult<()> {
        if self.workforce_pool_user_project.is_some() && !is_workforce_pool(&self.audience) {
            return Err(BuilderError::invalid_configuration(
                "The workforce_pool_user_project parameter should only be provided for a Workforce Pool configuration.",
            ));
        }
        Ok(())
    }

    /// Serializes the configuration in the external account file format.
    fn to_json(&self) -> Option<Value> {
        let mut value = json!({
            "type": "external_account",
            "audience": self.audience,
            "subject_token_type": self.subject_token_type,
            "token_url": self.token_url,
            "scopes": self.scopes,
            "credential_source": self.credential_source.to_json()?,
        });
        if let Some(url) = &self.service_account_impersonation_url {
            value["service_account_impersonation_url"] = json!(url);
            value["service_account_impersonation"] =
                json!({"token_lifetime_seconds": self.impersonation.lifetime.as_secs()});
        }
        let optional = [
            ("client_id", &self.authentication.client_id),
            ("client_secret", &self.authentication.client_secret),
            ("workforce_pool_user_project", &self.workforce_pool_user_project),
            ("quota_project_id", &self.quota_project_id),
        ];
        for (field, v) in optional {
            if let Some(v) = v {
                value[field] = json!(v);
            }
        }
        Some(value)
    }

    fn make_credentials(
        self,
        quota_project_id: Option<String>,
        retry_config: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Credentials {
        tracing::debug!(
            source = self.credential_source.kind(),
            audience = self.audience,
            impersonation = self.service_account_impersonation_url.is_some(),
            "building external account credentials"
        );
        let token_provider = ExternalAccountTokenProvider {
            config: self,
            sts: StsHandler::default(),
            iam: IamClient::new(retry_config),
            clock: clock.clone(),
        };
        Credentials::from(
            CachedCredentials::new(token_provider, quota_project_id).with_clock(clock),
        )
    }
}

/// Returns true for `//iam.googleapis.com/locations/{location}/workforcePools/{pool}/providers/{provider}`.
fn is_workforce_pool(audience: &str) -> bool {
    let Some(rest) = audience.strip_prefix("//iam.googleapis.com/locations/") else {
        return false;
    };
    let parts = rest.split('/').collect::<Vec<_>>();
    match parts.as_slice() {
        [location, "workforcePools", pool, "providers", provider] => {
            !(location.is_empty() || pool.is_empty() || provider.is_empty())
        }
        _ => false,
    }
}

#[derive(Debug)]
struct ExternalAccountTokenProvider {
    config: ExternalAccountConfig,
    sts: StsHandler,
    iam: IamClient,
    clock: Arc<dyn Clock>,
}

impl ExternalAccountTokenProvider {
    fn context(&self) -> SubjectTokenContext {
        SubjectTokenContext {
            audience: self.config.audience.clone(),
            subject_token_type: self.config.subject_token_type.clone(),
            service_account_email: self
                .config
                .service_account_impersonation_url
                .as_deref()
                .and_then(principal_from_url)
                .map(str::to_string),
        }
    }

    async fn impersonate(&self, url: &str, sts_token: &AccessToken) -> Result<AccessToken> {
        let headers = build_bearer_headers(sts_token, &None)?;
        let request = GenerateAccessTokenRequest::new(
            None,
            self.config.scopes.clone(),
            self.config.impersonation.lifetime,
        );
        tracing::debug!(url, "impersonating service account with the STS token");
        let token = self
            .iam
            .generate_access_token(url, headers, &request)
            .await?;
        Ok(token.with_scopes(self.config.scopes.iter().cloned()))
    }
}

#[async_trait]
impl TokenProvider for ExternalAccountTokenProvider {
    async fn token(&self) -> Result<AccessToken> {
        let config = &self.config;
        let subject_token = config
            .credential_source
            .subject_token(&self.context())
            .await?;

        let options = match &config.workforce_pool_user_project {
            Some(project) if !config.authentication.is_configured() => {
                Some(json!({"userProject": project}).to_string())
            }
            _ => None,
        };
        // The STS token only needs to call the IAM credentials service.
        let scope = match config.service_account_impersonation_url {
            Some(_) => vec![DEFAULT_SCOPE.to_string()],
            None => config.scopes.clone(),
        };
        let request = ExchangeTokenRequest {
            url: config.token_url.clone(),
            authentication: config.authentication.clone(),
            headers: HeaderMap::new(),
            subject_token: subject_token.token,
            subject_token_type: config.subject_token_type.clone(),
            audience: Some(config.audience.clone()),
            scope,
            options,
            ..ExchangeTokenRequest::default()
        };
        let response = self.sts.exchange_token(request).await?;
        let sts_token = AccessToken {
            token: response.access_token,
            token_type: response.token_type,
            expires_at: Some(expires_in(self.clock.as_ref(), response.expires_in)),
            scopes: parse_scopes(response.scope.as_deref())
                .or_else(|| Some(config.scopes.iter().cloned().collect())),
        };

        match &config.service_account_impersonation_url {
            Some(url) => self.impersonate(url, &sts_token).await,
            None => Ok(sts_token),
        }
    }
}

/// A builder for external account [Credentials] instances.
///
/// # Example
/// ```
/// # use google_cloud_credentials::credentials::external_account::Builder;
/// # tokio_test::block_on(async {
/// let project_id = project_id();
/// let workload_identity_pool_id = workload_identity_pool();
/// let provider_id = workload_identity_provider();
/// let provider_name = format!(
///     "//iam.googleapis.com/projects/{project_id}/locations/global/workloadIdentityPools/{workload_identity_pool_id}/providers/{provider_id}"
/// );
/// let config = serde_json::json!({
///     "type": "external_account",
///     "audience": provider_name,
///     "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
///     "token_url": "https://sts.googleapis.com/v1/token",
///     "credential_source": {
///         "url": format!("http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01&resource={provider_name}"),
///         "headers": {
///           "Metadata": "True"
///         },
///         "format": {
///           "type": "json",
///           "subject_token_field_name": "access_token"
///         }
///     }
/// });
/// let credentials = Builder::new(config)
///     .with_quota_project_id("quota_project")
///     .build();
/// });
///
/// # fn project_id() -> String {
/// #     "test-only".to_string()
/// # }
/// # fn workload_identity_pool() -> String {
/// #     "test-only".to_string()
/// # }
/// # fn workload_identity_provider() -> String {
/// #     "test-only".to_string()
/// # }
/// ```
pub struct Builder {
    external_account_config: Value,
    quota_project_id: Option<String>,
    scopes: Option<Vec<String>>,
    retry_config: RetryConfig,
    executable_handler: Option<Arc<dyn ExecutableHandler>>,
    clock: Arc<dyn Clock>,
}

impl Builder {
    /// Creates a new builder using [external_account_credentials] JSON value.
    ///
    /// [external_account_credentials]: https://google.aip.dev/auth/4117#configuration-file-generation-and-usage
    pub fn new(external_account_config: Value) -> Self {
        Self {
            external_account_config,
            quota_project_id: None,
            scopes: None,
            retry_config: RetryConfig::default(),
            executable_handler: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the [quota project] for this credentials.
    ///
    /// In some services, you can use a service account in
    /// one project for authentication and authorization, and charge
    /// the usage to a different project. This requires that the
    /// service account has `serviceusage.services.use` permissions on the quota project.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Overrides the [scopes] for this credentials.
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

    /// Configures the retries for calls to the IAM credentials service, used
    /// when the configuration impersonates a service account.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Replaces the [PluggableAuthHandler] used by executable-sourced
    /// configurations.
    pub fn with_executable_handler<H>(mut self, handler: H) -> Self
    where
        H: ExecutableHandler + 'static,
    {
        self.executable_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the clock used to compute token expiration and detect stale tokens.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] if the `external_account_config` provided to
    /// [`Builder::new`] cannot be deserialized into the expected format, or if
    /// it fails validation. For example, if the credential source is missing,
    /// or if the impersonation lifetime is out of range. For more information
    /// on the expected format, consult the relevant section in the
    /// [external_account_credentials] guide.
    ///
    /// [external_account_credentials]: https://google.aip.dev/auth/4117#configuration-file-generation-and-usage
    pub fn build(self) -> BuildResult<Credentials> {
        let mut config =
            ExternalAccountConfig::from_json(self.external_account_config, self.executable_handler)?;
        if let Some(scopes) = self.scopes {
            config.scopes = scopes;
        }
        let quota_project_id = self.quota_project_id.or(config.quota_project_id.take());
        Ok(config.make_credentials(quota_project_id, self.retry_config, self.clock))
    }
}

/// A builder for external account [Credentials] that uses a user provided subject
/// token provider.
///
/// This builder is designed for advanced use cases where the subject token is
/// provided directly by the application through a custom implementation of the
/// [SubjectTokenProvider] trait.
///
/// # Example
///
/// ```
/// # use google_cloud_credentials::credentials::external_account::ProgrammaticBuilder;
/// # use google_cloud_credentials::credentials::subject_token::{SubjectTokenProvider, SubjectToken, Builder as SubjectTokenBuilder};
/// # use google_cloud_credentials::errors::SubjectTokenProviderError;
/// # use std::error::Error;
/// # use std::fmt;
/// # use std::sync::Arc;
/// #
/// # #[derive(Debug)]
/// # struct MyTokenProvider;
/// #
/// # #[derive(Debug)]
/// # struct MyProviderError;
/// # impl fmt::Display for MyProviderError { fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "MyProviderError") } }
/// # impl Error for MyProviderError {}
/// # impl SubjectTokenProviderError for MyProviderError { fn is_transient(&self) -> bool { false } }
/// #
/// # impl SubjectTokenProvider for MyTokenProvider {
/// #     type Error = MyProviderError;
/// #     async fn subject_token(&self) -> Result<SubjectToken, Self::Error> {
/// #         Ok(SubjectTokenBuilder::new("my-programmatic-token").build())
/// #     }
/// # }
/// #
/// # tokio_test::block_on(async {
/// let provider = Arc::new(MyTokenProvider);
///
/// let credentials = ProgrammaticBuilder::new(provider)
///     .with_audience("//iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/my-pool/providers/my-provider")
///     .with_subject_token_type("urn:ietf:params:oauth:token-type:jwt")
///     .with_quota_project_id("my-quota-project")
///     .with_scopes(["https://www.googleapis.com/auth/devstorage.read_only"])
///     .build()?;
/// # Ok::<(), anyhow::Error>(())
/// # });
/// ```
pub struct ProgrammaticBuilder {
    subject_token_provider: Arc<dyn dynamic::SubjectTokenProvider>,
    audience: Option<String>,
    subject_token_type: Option<String>,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Option<Vec<String>>,
    quota_project_id: Option<String>,
    workforce_pool_user_project: Option<String>,
    service_account_impersonation_url: Option<String>,
    token_lifetime: Option<Duration>,
    retry_config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl ProgrammaticBuilder {
    /// Creates a new builder that uses the provided [SubjectTokenProvider] to
    /// fetch the third-party subject token.
    pub fn new<T>(subject_token_provider: Arc<T>) -> Self
    where
        T: SubjectTokenProvider + 'static,
    {
        Self {
            subject_token_provider,
            audience: None,
            subject_token_type: None,
            token_url: None,
            client_id: None,
            client_secret: None,
            scopes: None,
            quota_project_id: None,
            workforce_pool_user_project: None,
            service_account_impersonation_url: None,
            token_lifetime: None,
            retry_config: RetryConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the audience, the full resource name of the workload or
    /// workforce identity pool provider. This is required.
    pub fn with_audience<S: Into<String>>(mut self, audience: S) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Sets the type of the subject token, for example
    /// `urn:ietf:params:oauth:token-type:jwt`. This is required.
    pub fn with_subject_token_type<S: Into<String>>(mut self, subject_token_type: S) -> Self {
        self.subject_token_type = Some(subject_token_type.into());
        self
    }

    /// Overrides the STS token exchange endpoint.
    ///
    /// Defaults to `https://sts.googleapis.com/v1/token`.
    pub fn with_token_url<S: Into<String>>(mut self, token_url: S) -> Self {
        self.token_url = Some(token_url.into());
        self
    }

    /// Sets the OAuth client ID used to authenticate with the STS endpoint.
    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the OAuth client secret used to authenticate with the STS endpoint.
    pub fn with_client_secret<S: Into<String>>(mut self, client_secret: S) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Sets the [scopes] for this credentials.
    ///
    /// Defaults to `https://www.googleapis.com/auth/cloud-platform`.
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

    /// Sets the [quota project] for this credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets the project billed for workforce pool requests made without a
    /// client ID and secret.
    ///
    /// Only valid when the audience is a workforce pool provider.
    pub fn with_workforce_pool_user_project<S: Into<String>>(mut self, project: S) -> Self {
        self.workforce_pool_user_project = Some(project.into());
        self
    }

    /// Impersonates a service account with the exchanged token.
    ///
    /// The URL is of the form
    /// `https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{email}:generateAccessToken`.
    pub fn with_service_account_impersonation_url<S: Into<String>>(mut self, url: S) -> Self {
        self.service_account_impersonation_url = Some(url.into());
        self
    }

    /// Sets the lifetime of impersonated tokens.
    ///
    /// Must be between 10 minutes and 12 hours, the default is one hour.
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = Some(lifetime);
        self
    }

    /// Configures the retries for calls to the IAM credentials service.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Sets the clock used to compute token expiration and detect stale tokens.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] if the audience or the subject token type are
    /// missing, or if the configuration fails validation.
    pub fn build(self) -> BuildResult<Credentials> {
        let audience = self
            .audience
            .ok_or_else(|| BuilderError::missing_field("audience"))?;
        let subject_token_type = self
            .subject_token_type
            .ok_or_else(|| BuilderError::missing_field("subject_token_type"))?;
        let config = ExternalAccountConfig {
            audience,
            subject_token_type,
            token_url: self.token_url.unwrap_or_else(|| STS_TOKEN_URL.to_string()),
            service_account_impersonation_url: self.service_account_impersonation_url,
            impersonation: ServiceAccountImpersonationOptions::new(self.token_lifetime)?,
            authentication: ClientAuthentication {
                client_id: self.client_id,
                client_secret: self.client_secret,
            },
            scopes: self
                .scopes
                .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]),
            workforce_pool_user_project: self.workforce_pool_user_project,
            quota_project_id: None,
            credential_source: CredentialSource::Programmatic(
                ProgrammaticSourcedCredentials::new(self.subject_token_provider),
            ),
        };
        config.validate()?;
        Ok(config.make_credentials(self.quota_project_id, self.retry_config, self.clock))
    }
}
