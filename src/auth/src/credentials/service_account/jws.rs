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

use crate::Result;
use crate::errors::CredentialsError;
use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;

// Services reject assertions with `iat` in the future. Unfortunately all
// machines have some amount of clock skew, and it is possible that
// the machine creating this assertion has a clock a few milliseconds
// or seconds ahead of the machines receiving the assertion.
// Create the assertion with a 10 second margin to avoid most clock
// skew problems.
pub(crate) const CLOCK_SKEW_FUDGE: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(3600);

/// The claims of a JSON Web Signature.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct JwsClaims {
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(with = "time::serde::timestamp")]
    pub exp: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub iat: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
}

impl JwsClaims {
    /// Claims issued by `iss`, valid for [DEFAULT_TOKEN_TIMEOUT].
    pub(crate) fn new<S: Into<String>>(iss: S) -> Self {
        Self::issued_at(iss, OffsetDateTime::now_utc())
    }

    /// Claims issued by `iss` at `now`, valid for [DEFAULT_TOKEN_TIMEOUT].
    pub(crate) fn issued_at<S: Into<String>>(iss: S, now: OffsetDateTime) -> Self {
        let iat = now - CLOCK_SKEW_FUDGE;
        Self {
            iss: iss.into(),
            scope: None,
            aud: None,
            exp: iat + DEFAULT_TOKEN_TIMEOUT,
            iat,
            sub: None,
            target_audience: None,
        }
    }

    pub(crate) fn encode(&self) -> Result<String> {
        if self.exp < self.iat {
            return Err(CredentialsError::from_msg(
                false,
                format!(
                    "expiration time {:?}, must be later than issued time {:?}",
                    self.exp, self.iat
                ),
            ));
        }
        let json = serde_json::to_string(&self)
            .map_err(|e| CredentialsError::new(false, "cannot encode JWS claims", e))?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(json.as_bytes()))
    }
}

/// The header that describes who, what, and how a token was created.
#[derive(Debug, Serialize)]
pub(crate) struct JwsHeader<'a> {
    pub alg: &'a str,
    pub typ: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<&'a str>,
}

impl JwsHeader<'_> {
    pub(crate) fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(&self)
            .map_err(|e| CredentialsError::new(false, "cannot encode JWS header", e))?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(json.as_bytes()))
    }
}
