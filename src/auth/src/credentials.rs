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

use crate::build_errors::Error as BuilderError;
use crate::clock::Clock;
use crate::constants::GOOGLE_CLOUD_QUOTA_PROJECT_VAR;
use crate::errors::CredentialsError;
use crate::headers_util::build_bearer_headers;
use crate::token::{AccessToken, TokenProvider};
use crate::token_cache::TokenCache;
use crate::{BuildResult, Result};
use http::HeaderMap;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

pub mod access_token;
pub mod cloud_shell;
pub mod external_account;
pub(crate) mod external_account_sources;
pub mod idtoken;
pub mod impersonated;
pub mod mds;
pub mod service_account;
pub mod subject_token;
pub mod user_account;

pub(crate) mod internal {
    pub(crate) mod iam;
    pub(crate) mod sts_exchange;
}

const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const NO_GCE_CHECK: &str = "NO_GCE_CHECK";
const WINDOWS_APPDATA: &str = "APPDATA";
const UNIX_HOME: &str = "HOME";
const USER_CREDENTIAL_FILE: &str = "application_default_credentials.json";

/// A callback invoked after each successful refresh, with the new token.
pub type ChangeListener = Arc<dyn Fn(&AccessToken) + Send + Sync>;

/// An implementation of [crate::credentials::CredentialsProvider].
///
/// Represents a [Credentials] used to obtain auth [Token][crate::token::AccessToken]s
/// and the corresponding request headers.
///
/// In general, [Credentials][credentials-link] are "digital object that provide
/// proof of identity", the archetype may be a username and password
/// combination, but a private RSA key may be a better example.
///
/// Modern authentication protocols do not send the credentials to authenticate
/// with a service. Even when sent over encrypted transports, the credentials
/// may be accidentally exposed via logging or may be captured if there are
/// errors in the transport encryption. Because the credentials are often
/// long-lived, that risk of exposure is also long-lived.
///
/// Instead, modern authentication protocols exchange the credentials for a
/// time-limited [Token][token-link], a digital object that shows the caller was
/// in possession of the credentials. Because tokens are time limited, risk of
/// misuse is also time limited.
///
/// All the built-in credentials cache their token. At most one refresh is in
/// progress at any time, concurrent callers share its result.
///
/// [credentials-link]: https://cloud.google.com/docs/authentication#credentials
/// [token-link]: https://cloud.google.com/docs/authentication#token
#[derive(Clone, Debug)]
pub struct Credentials {
    // We use an `Arc` to hold the inner implementation.
    //
    // Credentials may be shared across threads (`Send + Sync`), so an `Rc`
    // will not do.
    //
    // They also need to derive `Clone`, as the HTTP clients which hold them
    // derive `Clone`. So a `Box` will not do.
    pub(crate) inner: Arc<dyn dynamic::CredentialsProvider>,
}

impl<T> std::convert::From<T> for Credentials
where
    T: crate::credentials::CredentialsProvider + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }
}

impl Credentials {
    /// Returns the headers for a request, refreshing the token if needed.
    ///
    /// Equivalent to `request_metadata(None)`.
    pub async fn headers(&self) -> Result<HeaderMap> {
        self.inner.headers(None).await
    }

    /// Returns the headers for a request to `uri`.
    ///
    /// Most credentials ignore the URI. Service account credentials without
    /// scopes use it as the audience of a self-signed JWT.
    pub async fn request_metadata(&self, uri: Option<&str>) -> Result<HeaderMap> {
        self.inner.headers(uri).await
    }

    /// Returns the headers for a request, blocking the current thread.
    ///
    /// The refresh, if any, runs on `runtime`. Like
    /// [Handle::block_on][tokio::runtime::Handle::block_on], this panics if
    /// called from within an asynchronous execution context.
    pub fn request_metadata_blocking(
        &self,
        runtime: &tokio::runtime::Handle,
        uri: Option<&str>,
    ) -> Result<HeaderMap> {
        runtime.block_on(self.inner.headers(uri))
    }

    /// Delivers the headers for a request to `callback`.
    ///
    /// If the cached token is fresh the callback runs before this function
    /// returns. Otherwise a refresh is spawned on `executor` and the callback
    /// runs there with its outcome. The spawned task checks the cache again, a
    /// token refreshed in the meantime by another caller is used as-is.
    pub fn request_metadata_with_callback<F>(
        &self,
        uri: Option<&str>,
        executor: &tokio::runtime::Handle,
        callback: F,
    ) where
        F: FnOnce(Result<HeaderMap>) + Send + 'static,
    {
        if let Some(headers) = self.inner.cached_headers(uri) {
            callback(headers);
            return;
        }
        let inner = self.inner.clone();
        let uri = uri.map(str::to_string);
        executor.spawn(async move {
            let headers = inner.headers(uri.as_deref()).await;
            callback(headers);
        });
    }

    /// Refreshes the token, even if the cached token is still fresh.
    ///
    /// If a refresh is already in progress, this waits for its result
    /// instead of starting a new one. Credentials holding a fixed access
    /// token return an error where [CredentialsError::is_illegal_state] is
    /// `true`.
    pub async fn refresh(&self) -> Result<AccessToken> {
        self.inner.refresh().await
    }

    /// Returns the current access token, refreshing it if needed.
    pub async fn access_token(&self) -> Result<AccessToken> {
        self.inner.access_token().await
    }

    /// Registers a callback invoked after each successful refresh.
    ///
    /// Listeners run in registration order, once per refresh, before the
    /// call that triggered the refresh returns.
    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn(&AccessToken) + Send + Sync + 'static,
    {
        self.inner.add_change_listener(Arc::new(listener));
    }
}

/// Represents a [Credentials] used to obtain auth request headers.
///
/// # Notes
///
/// Application developers who directly use the Auth SDK can use this trait,
/// along with [crate::credentials::Credentials::from()] to mock the credentials.
/// Application developers who use the Google Cloud Rust SDK directly should not
/// need this functionality.
pub trait CredentialsProvider: std::fmt::Debug {
    /// Asynchronously constructs the auth headers for a request to `uri`.
    ///
    /// The underlying implementation refreshes the token as needed.
    fn headers(&self, uri: Option<&str>) -> impl Future<Output = Result<HeaderMap>> + Send;

    /// Returns the current access token, refreshing it as needed.
    fn access_token(&self) -> impl Future<Output = Result<AccessToken>> + Send;

    /// Forces a refresh.
    ///
    /// The default implementation cannot refresh.
    fn refresh(&self) -> impl Future<Output = Result<AccessToken>> + Send {
        async {
            Err(CredentialsError::illegal_state(
                "these credentials do not support refreshing",
            ))
        }
    }

    /// Returns the headers without any I/O, if a fresh token is cached.
    fn cached_headers(&self, _uri: Option<&str>) -> Option<Result<HeaderMap>> {
        None
    }

    /// Registers a callback invoked after each successful refresh.
    ///
    /// The default implementation never refreshes, and discards the listener.
    fn add_change_listener(&self, _listener: ChangeListener) {}
}

pub(crate) mod dynamic {
    use super::{AccessToken, ChangeListener, HeaderMap, Result};

    /// A dyn-compatible, crate-private version of `CredentialsProvider`.
    #[async_trait::async_trait]
    pub trait CredentialsProvider: Send + Sync + std::fmt::Debug {
        async fn headers(&self, uri: Option<&str>) -> Result<HeaderMap>;
        async fn access_token(&self) -> Result<AccessToken>;
        async fn refresh(&self) -> Result<AccessToken>;
        fn cached_headers(&self, uri: Option<&str>) -> Option<Result<HeaderMap>>;
        fn add_change_listener(&self, listener: ChangeListener);
    }

    /// The public CredentialsProvider implements the dyn-compatible CredentialsProvider.
    #[async_trait::async_trait]
    impl<T> CredentialsProvider for T
    where
        T: super::CredentialsProvider + Send + Sync,
    {
        async fn headers(&self, uri: Option<&str>) -> Result<HeaderMap> {
            T::headers(self, uri).await
        }
        async fn access_token(&self) -> Result<AccessToken> {
            T::access_token(self).await
        }
        async fn refresh(&self) -> Result<AccessToken> {
            T::refresh(self).await
        }
        fn cached_headers(&self, uri: Option<&str>) -> Option<Result<HeaderMap>> {
            T::cached_headers(self, uri)
        }
        fn add_change_listener(&self, listener: ChangeListener) {
            T::add_change_listener(self, listener)
        }
    }
}

/// Credentials that fetch bearer tokens from a [TokenProvider] and cache them.
///
/// Most built-in credential types are one of these, differing only in the
/// token provider.
#[derive(Debug)]
pub(crate) struct CachedCredentials<T>
where
    T: TokenProvider,
{
    pub(crate) token_provider: TokenCache<T>,
    pub(crate) quota_project_id: Option<String>,
}

impl<T> CachedCredentials<T>
where
    T: TokenProvider + 'static,
{
    pub(crate) fn new(token_provider: T, quota_project_id: Option<String>) -> Self {
        Self {
            token_provider: TokenCache::new(token_provider),
            quota_project_id,
        }
    }

    /// Decides token freshness with `clock` instead of the wall clock.
    pub(crate) fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.token_provider = self.token_provider.with_clock(clock);
        self
    }
}

impl<T> CredentialsProvider for CachedCredentials<T>
where
    T: TokenProvider + 'static,
{
    async fn headers(&self, _uri: Option<&str>) -> Result<HeaderMap> {
        let token = self.token_provider.token().await?;
        build_bearer_headers(&token, &self.quota_project_id)
    }

    async fn access_token(&self) -> Result<AccessToken> {
        self.token_provider.token().await
    }

    async fn refresh(&self) -> Result<AccessToken> {
        self.token_provider.refresh().await
    }

    fn cached_headers(&self, _uri: Option<&str>) -> Option<Result<HeaderMap>> {
        let token = self.token_provider.cached()?;
        Some(build_bearer_headers(&token, &self.quota_project_id))
    }

    fn add_change_listener(&self, listener: ChangeListener) {
        self.token_provider.add_change_listener(listener);
    }
}

/// A builder for [Application Default Credentials].
///
/// The credentials are found by checking, in order:
/// 1. The file named by the `GOOGLE_APPLICATION_CREDENTIALS` environment
///    variable.
/// 2. The file created by `gcloud auth application-default login`.
/// 3. The Cloud Shell credentials, if `DEVSHELL_CLIENT_PORT` is set.
/// 4. The metadata service, unless `NO_GCE_CHECK` is `true`.
///
/// The first two may contain `authorized_user`, `service_account`,
/// `impersonated_service_account`, or `external_account` credentials.
///
/// # Example
/// ```
/// # use google_cloud_credentials::credentials::Builder;
/// # tokio_test::block_on(async {
/// let credentials = Builder::default()
///     .with_quota_project_id("my-project")
///     .build();
/// # });
/// ```
///
/// [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials
#[derive(Debug, Default)]
pub struct Builder {
    quota_project_id: Option<String>,
    scopes: Option<Vec<String>>,
}

impl Builder {
    /// Sets the [quota project] for these credentials.
    ///
    /// The `GOOGLE_CLOUD_QUOTA_PROJECT` environment variable, if set, takes
    /// precedence over this value.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets the [scopes] for these credentials.
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

    /// Returns a [Credentials] instance found using the ADC search order.
    pub fn build(self) -> BuildResult<Credentials> {
        let quota_project_id = std::env::var(GOOGLE_CLOUD_QUOTA_PROJECT_VAR)
            .ok()
            .or(self.quota_project_id);

        if let Some(json) = load_adc()? {
            return build_from_json(json, quota_project_id, self.scopes);
        }
        if let Some(port) = cloud_shell::port_from_env()? {
            let mut builder = cloud_shell::Builder::new(port);
            if let Some(q) = quota_project_id {
                builder = builder.with_quota_project_id(q);
            }
            return Ok(builder.build());
        }
        if std::env::var(NO_GCE_CHECK).is_ok_and(|v| v.eq_ignore_ascii_case("true")) {
            return Err(BuilderError::loading(
                "no application default credentials found, and the metadata service check is disabled",
            ));
        }
        tracing::debug!("using the metadata service for application default credentials");
        let mut builder = mds::Builder::default();
        if let Some(q) = quota_project_id {
            builder = builder.with_quota_project_id(q);
        }
        if let Some(s) = self.scopes {
            builder = builder.with_scopes(s);
        }
        Ok(builder.build())
    }
}

fn load_adc() -> BuildResult<Option<Value>> {
    let path = match std::env::var(GOOGLE_APPLICATION_CREDENTIALS) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => match adc_well_known_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };
    tracing::debug!("loading application default credentials from {}", path.display());
    let contents = std::fs::read_to_string(&path).map_err(BuilderError::loading)?;
    let json = serde_json::from_str(&contents).map_err(BuilderError::parsing)?;
    Ok(Some(json))
}

/// The path to the file created by `gcloud auth application-default login`.
fn adc_well_known_path() -> Option<PathBuf> {
    let mut path = PathBuf::new();
    if cfg!(windows) {
        path.push(std::env::var(WINDOWS_APPDATA).ok()?);
    } else {
        path.push(std::env::var(UNIX_HOME).ok()?);
        path.push(".config");
    }
    path.push("gcloud");
    path.push(USER_CREDENTIAL_FILE);
    Some(path)
}

pub(crate) fn build_from_json(
    json: Value,
    quota_project_id: Option<String>,
    scopes: Option<Vec<String>>,
) -> BuildResult<Credentials> {
    let cred_type = json
        .get("type")
        .ok_or_else(|| BuilderError::parsing("no `type` field found."))?
        .as_str()
        .ok_or_else(|| BuilderError::parsing("`type` field is not a string."))?;

    macro_rules! config_builder {
        ($builder:expr) => {{
            let mut builder = $builder;
            if let Some(q) = quota_project_id {
                builder = builder.with_quota_project_id(q);
            }
            if let Some(s) = scopes {
                builder = builder.with_scopes(s);
            }
            builder.build()
        }};
    }

    match cred_type {
        "authorized_user" => config_builder!(user_account::Builder::new(json)),
        "service_account" => config_builder!(service_account::Builder::new(json)),
        "impersonated_service_account" => config_builder!(impersonated::Builder::new(json)),
        "external_account" => config_builder!(external_account::Builder::new(json)),
        _ => Err(BuilderError::unknown_type(format!(
            "Invalid or unsupported credentials type found in JSON: {cred_type}"
        ))),
    }
}
