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

//! Types and functions to work with auth [Tokens].
//!
//! [Tokens]: https://cloud.google.com/docs/authentication#token

use crate::Result;
use crate::clock::Clock;
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

/// Represents an access token.
///
/// Tokens are immutable. A refresh produces a new `AccessToken`, it never
/// changes an existing one.
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    /// The actual token string.
    ///
    /// This is the value used in `Authorization:` header.
    pub token: String,

    /// The type of the token.
    ///
    /// The most common type is `"Bearer"` but other types may appear in the
    /// future.
    pub token_type: String,

    /// The instant at which the token expires.
    ///
    /// If `None`, the token does not expire.
    pub expires_at: Option<SystemTime>,

    /// The scopes granted to the token, if the issuer reported them.
    pub scopes: Option<BTreeSet<String>>,
}

impl AccessToken {
    /// Creates a bearer token without expiration or scopes.
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
            token_type: "Bearer".to_string(),
            expires_at: None,
            scopes: None,
        }
    }

    /// Sets the expiration time.
    pub fn with_expires_at(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the granted scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true if the token expires at or before `now + margin`.
    pub(crate) fn expires_within(&self, now: SystemTime, margin: Duration) -> bool {
        self.expires_at.is_some_and(|e| now + margin >= e)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[censored]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Parses the space separated `scope` field used by OAuth 2.0 responses.
pub(crate) fn parse_scopes(scope: Option<&str>) -> Option<BTreeSet<String>> {
    scope
        .map(|s| s.split_whitespace().map(str::to_string).collect::<BTreeSet<_>>())
        .filter(|s| !s.is_empty())
}

/// Computes the expiration for a token valid for `seconds`, as seen by `clock`.
pub(crate) fn expires_in(clock: &dyn Clock, seconds: u64) -> SystemTime {
    clock.now() + Duration::from_secs(seconds)
}

#[async_trait::async_trait]
pub(crate) trait TokenProvider: std::fmt::Debug + Send + Sync {
    async fn token(&self) -> Result<AccessToken>;
}
