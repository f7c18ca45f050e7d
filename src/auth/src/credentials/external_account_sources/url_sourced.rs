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

use super::{CredentialSourceFormat, SubjectTokenFormat};
use crate::credentials::subject_token::{Builder as SubjectTokenBuilder, SubjectToken};
use crate::errors::{self, CredentialsError};
use crate::{BuildResult, Result};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

const MSG: &str = "Error getting subject token from metadata server";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the subject token from a URL, typically a local metadata server.
#[derive(Debug, Clone)]
pub(crate) struct UrlSourcedCredentials {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub format: SubjectTokenFormat,
    client: reqwest::Client,
}

impl PartialEq for UrlSourcedCredentials {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.headers == other.headers && self.format == other.format
    }
}

impl UrlSourcedCredentials {
    pub(crate) fn new(
        url: String,
        headers: Option<BTreeMap<String, String>>,
        format: Option<CredentialSourceFormat>,
    ) -> BuildResult<Self> {
        Ok(Self {
            url,
            headers: headers.unwrap_or_default(),
            format: SubjectTokenFormat::new(format)?,
            client: reqwest::Client::new(),
        })
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut value = json!({
            "url": self.url,
            "format": self.format.to_json(),
        });
        if !self.headers.is_empty() {
            value["headers"] = json!(self.headers);
        }
        value
    }

    pub(crate) async fn subject_token(&self) -> Result<SubjectToken> {
        let request = self
            .headers
            .iter()
            .fold(self.client.get(&self.url), |r, (k, v)| {
                r.header(k.as_str(), v.as_str())
            })
            .timeout(REQUEST_TIMEOUT);

        let response = request
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, &format!("{MSG}: transport error")))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(errors::from_http_response(response, &format!("{MSG}: {status}")).await);
        }
        let content = response.text().await.map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::new(retryable, format!("{MSG}: cannot read the response"), e)
        })?;

        let token = self.format.extract(content)?;
        Ok(SubjectTokenBuilder::new(token).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};

    type TestResult = anyhow::Result<()>;

    fn json_format() -> Option<CredentialSourceFormat> {
        Some(CredentialSourceFormat {
            format_type: "json".into(),
            subject_token_field_name: Some("access_token".into()),
        })
    }

    #[tokio::test]
    async fn json_token() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/token"),
                request::headers(contains(("metadata", "True"))),
            ])
            .respond_with(json_encoded(json!({"access_token": "an_example_token"}))),
        );

        let source = UrlSourcedCredentials::new(
            server.url("/token").to_string(),
            Some(BTreeMap::from([("Metadata".to_string(), "True".to_string())])),
            json_format(),
        )?;
        let token = source.subject_token().await?;
        assert_eq!(token.token, "an_example_token");
        Ok(())
    }

    #[tokio::test]
    async fn text_token() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(200).body("an_example_token")),
        );

        let source = UrlSourcedCredentials::new(server.url("/token").to_string(), None, None)?;
        let token = source.subject_token().await?;
        assert_eq!(token.token, "an_example_token");
        Ok(())
    }

    #[tokio::test]
    async fn json_token_missing_field() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(json_encoded(json!({"wrong_field": "an_example_token"}))),
        );

        let source =
            UrlSourcedCredentials::new(server.url("/token").to_string(), None, json_format())?;
        let err = source.subject_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("`access_token`"), "{err}");
        assert!(err.to_string().contains("wrong_field"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn server_error() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(503).body("try again")),
        );

        let source = UrlSourcedCredentials::new(server.url("/token").to_string(), None, None)?;
        let err = source.subject_token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(
            err.to_string()
                .contains("Error getting subject token from metadata server: "),
            "{err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn transport_error() -> TestResult {
        let server = Server::run();
        let url = server.url("/token").to_string();
        drop(server);

        let source = UrlSourcedCredentials::new(url, None, None)?;
        let err = source.subject_token().await.unwrap_err();
        assert!(
            err.to_string()
                .contains("Error getting subject token from metadata server: "),
            "{err}"
        );
        Ok(())
    }

    #[test]
    fn to_json() -> TestResult {
        let source = UrlSourcedCredentials::new(
            "http://169.254.169.254/token".into(),
            Some(BTreeMap::from([("Metadata".to_string(), "True".to_string())])),
            json_format(),
        )?;
        assert_eq!(
            source.to_json(),
            json!({
                "url": "http://169.254.169.254/token",
                "headers": {"Metadata": "True"},
                "format": {"type": "json", "subject_token_field_name": "access_token"},
            })
        );
        Ok(())
    }
}
