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

//! Obtain [OIDC ID Tokens].
//!
//! ID tokens are commonly used for [service to service authentication], like
//! when services are hosted in Cloud Run or mediated by Identity-Aware Proxy
//! (IAP). Unlike access tokens, ID tokens are not used to authorize access to
//! Google Cloud APIs but to verify the identity of a principal.
//!
//! Service accounts, impersonated service accounts, and the metadata service
//! can issue ID tokens. Each has a builder in the corresponding submodule.
//!
//! [OIDC ID Tokens]: https://cloud.google.com/docs/authentication/token-types#identity-tokens
//! [service to service authentication]: https://cloud.google.com/run/docs/authenticating/service-to-service

pub mod impersonated;
pub mod mds;
pub mod service_account;

use crate::Result;
use crate::errors::CredentialsError;
use crate::token::{AccessToken, TokenProvider};
use crate::token_cache::TokenCache;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Credentials that issue OIDC ID tokens for a fixed audience.
///
/// The tokens are cached until shortly before the expiration in their `exp`
/// claim. At most one request for a new token is in progress at any time.
#[derive(Clone, Debug)]
pub struct IdTokenCredentials {
    inner: Arc<dyn dynamic::IdTokenProvider>,
}

impl<T> From<T> for IdTokenCredentials
where
    T: IdTokenProvider + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(CachedIdTokenProvider {
                cache: TokenCache::new(IdTokenSource(value)),
            }),
        }
    }
}

impl IdTokenCredentials {
    /// Returns an ID token, fetching a new one if the cached token is close
    /// to its expiration.
    pub async fn id_token(&self) -> Result<String> {
        self.inner.id_token().await
    }
}

/// Issues OIDC ID tokens.
///
/// Implement this trait to use a custom source of ID tokens with
/// [IdTokenCredentials], or to mock ID tokens in tests.
pub trait IdTokenProvider: std::fmt::Debug {
    /// Fetches a new ID token.
    fn id_token(&self) -> impl Future<Output = Result<String>> + Send;
}

pub(crate) mod dynamic {
    use crate::Result;

    /// A dyn-compatible, crate-private version of `IdTokenProvider`.
    #[async_trait::async_trait]
    pub trait IdTokenProvider: Send + Sync + std::fmt::Debug {
        async fn id_token(&self) -> Result<String>;
    }

    #[async_trait::async_trait]
    impl<T> IdTokenProvider for T
    where
        T: super::IdTokenProvider + Send + Sync,
    {
        async fn id_token(&self) -> Result<String> {
            T::id_token(self).await
        }
    }
}

#[derive(Debug)]
struct IdTokenSource<T>(T);

#[async_trait::async_trait]
impl<T> TokenProvider for IdTokenSource<T>
where
    T: IdTokenProvider + Send + Sync,
{
    async fn token(&self) -> Result<AccessToken> {
        let token = self.0.id_token().await?;
        let expires_at = expiration(&token)?;
        let token = AccessToken::new(token);
        Ok(match expires_at {
            Some(e) => token.with_expires_at(e),
            None => token,
        })
    }
}

#[derive(Debug)]
struct CachedIdTokenProvider<T>
where
    T: IdTokenProvider + Send + Sync + 'static,
{
    cache: TokenCache<IdTokenSource<T>>,
}

impl<T> IdTokenProvider for CachedIdTokenProvider<T>
where
    T: IdTokenProvider + Send + Sync + 'static,
{
    async fn id_token(&self) -> Result<String> {
        Ok(self.cache.token().await?.token)
    }
}

#[derive(serde::Deserialize)]
struct ExpirationClaim {
    exp: Option<u64>,
}

/// Returns the expiration time in the `exp` claim of a JWT.
pub(crate) fn expiration(token: &str) -> Result<Option<SystemTime>> {
    let parts = token.split('.').collect::<Vec<_>>();
    let [_, payload, _] = parts.as_slice() else {
        return Err(CredentialsError::from_msg(
            false,
            "the ID token is not a valid JWT",
        ));
    };
    let payload = BASE64_URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CredentialsError::new(false, "cannot decode the ID token claims", e))?;
    let claims = serde_json::from_slice::<ExpirationClaim>(&payload)
        .map_err(|e| CredentialsError::new(false, "cannot parse the ID token claims", e))?;
    Ok(claims.exp.map(|s| UNIX_EPOCH + Duration::from_secs(s)))
}
