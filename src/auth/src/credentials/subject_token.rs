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

//! Subject tokens supplied by the application.
//!
//! External account credentials exchange a third-party *subject token* for a
//! Google access token. Most configurations read the subject token from a
//! file, a URL, AWS, or an executable. Applications with other sources
//! implement [SubjectTokenProvider] and use the
//! [ProgrammaticBuilder][crate::credentials::external_account::ProgrammaticBuilder].

use crate::errors::SubjectTokenProviderError;
use std::future::Future;

/// A builder for [SubjectToken].
#[derive(Debug)]
pub struct Builder {
    token: String,
}

impl Builder {
    /// Creates a builder for the given token value.
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Returns the [SubjectToken].
    pub fn build(self) -> SubjectToken {
        SubjectToken { token: self.token }
    }
}

/// A third-party token, such as an OIDC ID token or a SAML assertion.
#[derive(Clone, PartialEq)]
pub struct SubjectToken {
    pub(crate) token: String,
}

impl std::fmt::Debug for SubjectToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectToken")
            .field("token", &"[censored]")
            .finish()
    }
}

/// Fetches subject tokens for external account credentials.
///
/// The credentials call this function each time they need to refresh the
/// Google access token. Implementations may cache the subject token.
pub trait SubjectTokenProvider: std::fmt::Debug + Send + Sync {
    /// The error type returned by [subject_token][Self::subject_token].
    type Error: SubjectTokenProviderError;

    /// Returns a subject token.
    fn subject_token(&self) -> impl Future<Output = Result<SubjectToken, Self::Error>> + Send;
}

pub(crate) mod dynamic {
    use super::SubjectToken;
    use crate::errors::{CredentialsError, SubjectTokenProviderError};

    /// An object-safe version of [super::SubjectTokenProvider].
    #[async_trait::async_trait]
    pub trait SubjectTokenProvider: std::fmt::Debug + Send + Sync {
        async fn subject_token(&self) -> Result<SubjectToken, CredentialsError>;
    }

    #[async_trait::async_trait]
    impl<T> SubjectTokenProvider for T
    where
        T: super::SubjectTokenProvider,
    {
        async fn subject_token(&self) -> Result<SubjectToken, CredentialsError> {
            T::subject_token(self).await.map_err(|e| {
                let transient = SubjectTokenProviderError::is_transient(&e);
                CredentialsError::new(transient, "failed to fetch the subject token", e)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug, thiserror::Error)]
    #[error("test-only provider error, transient={0}")]
    struct TestError(bool);

    impl SubjectTokenProviderError for TestError {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[derive(Debug)]
    struct TestProvider(Option<bool>);

    impl SubjectTokenProvider for TestProvider {
        type Error = TestError;
        async fn subject_token(&self) -> Result<SubjectToken, Self::Error> {
            match self.0 {
                None => Ok(Builder::new("test-subject-token").build()),
                Some(transient) => Err(TestError(transient)),
            }
        }
    }

    #[tokio::test]
    async fn dynamic_success() -> anyhow::Result<()> {
        let provider = TestProvider(None);
        let got = dynamic::SubjectTokenProvider::subject_token(&provider).await?;
        assert_eq!(got, Builder::new("test-subject-token").build());
        Ok(())
    }

    #[tokio::test]
    async fn dynamic_error_keeps_transient_flag() {
        for transient in [true, false] {
            let provider = TestProvider(Some(transient));
            let err = dynamic::SubjectTokenProvider::subject_token(&provider)
                .await
                .unwrap_err();
            assert_eq!(err.is_transient(), transient, "{err:?}");
            let source = err.source().and_then(|e| e.downcast_ref::<TestError>());
            assert!(source.is_some(), "{err:?}");
        }
    }

    #[test]
    fn debug_censors_token() {
        let token = Builder::new("secret-token-value").build();
        let fmt = format!("{token:?}");
        assert!(!fmt.contains("secret-token-value"), "{fmt}");
    }
}
