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

//! Subject tokens for workloads running on AWS.
//!
//! The subject token is a serialized, [SigV4] signed, `GetCallerIdentity`
//! request. Google's STS forwards the request to AWS to verify the identity
//! of the caller.
//!
//! [SigV4]: https://docs.aws.amazon.com/IAM/latest/UserGuide/reference_sigv.html

use super::SubjectTokenContext;
use crate::build_errors::Error as BuilderError;
use crate::credentials::subject_token::{Builder as SubjectTokenBuilder, SubjectToken};
use crate::errors::{self, CredentialsError};
use crate::{BuildResult, Result};
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;

const AWS_REGION: &str = "AWS_REGION";
const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

const IMDSV2_TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const IMDSV2_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const IMDSV2_TTL_SECONDS: &str = "300";
const METADATA_IPV4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);
const METADATA_IPV6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0xec2, 0, 0, 0, 0, 0, 0x254);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const TARGET_RESOURCE_HEADER: &str = "x-goog-cloud-target-resource";

// Unreserved characters in RFC 3986 are left as-is, everything else is
// percent-encoded.
const AWS_URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// The AWS fields of the credential source, as found in the configuration
/// file.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct AwsSourceConfig {
    pub environment_id: String,
    pub region_url: Option<String>,
    pub url: Option<String>,
    pub regional_cred_verification_url: Option<String>,
    pub imdsv2_session_token_url: Option<String>,
}

/// Builds signed `GetCallerIdentity` requests as subject tokens.
#[derive(Clone, Debug)]
pub(crate) struct AwsSourcedCredentials {
    pub environment_id: String,
    pub region_url: Option<String>,
    pub url: Option<String>,
    pub regional_cred_verification_url: String,
    pub imdsv2_session_token_url: Option<String>,
    client: reqwest::Client,
}

impl PartialEq for AwsSourcedCredentials {
    fn eq(&self, other: &Self) -> bool {
        self.environment_id == other.environment_id
            && self.region_url == other.region_url
            && self.url == other.url
            && self.regional_cred_verification_url == other.regional_cred_verification_url
            && self.imdsv2_session_token_url == other.imdsv2_session_token_url
    }
}

/// Temporary or long-lived AWS credentials.
#[derive(Clone, PartialEq)]
struct AwsSecurityCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for AwsSecurityCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecurityCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[censored]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[censored]"))
            .finish()
    }
}

impl AwsSecurityCredentials {
    fn from_env() -> Option<Self> {
        let access_key_id = non_empty_env(AWS_ACCESS_KEY_ID)?;
        let secret_access_key = non_empty_env(AWS_SECRET_ACCESS_KEY)?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: non_empty_env(AWS_SESSION_TOKEN),
        })
    }
}

/// The response from the credentials endpoint of the metadata server.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

impl From<MetadataCredentials> for AwsSecurityCredentials {
    fn from(value: MetadataCredentials) -> Self {
        Self {
            access_key_id: value.access_key_id,
            secret_access_key: value.secret_access_key,
            session_token: value.token,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_region() -> Option<String> {
    non_empty_env(AWS_REGION).or_else(|| non_empty_env(AWS_DEFAULT_REGION))
}

fn validate_environment_id(environment_id: &str) -> BuildResult<()> {
    let version = environment_id
        .strip_prefix("aws")
        .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| BuilderError::invalid_configuration("Invalid AWS environment ID."))?;
    if version != 1 {
        return Err(BuilderError::invalid_configuration(format!(
            "AWS version {version} is not supported in the current build."
        )));
    }
    Ok(())
}

fn validate_metadata_url(field: &str, value: &str) -> BuildResult<()> {
    let parsed = url::Url::parse(value).map_err(|e| {
        BuilderError::invalid_configuration(format!("Invalid AWS {field} <{value}>: {e}"))
    })?;
    match parsed.host() {
        Some(url::Host::Ipv4(ip)) if ip == METADATA_IPV4 => Ok(()),
        Some(url::Host::Ipv6(ip)) if ip == METADATA_IPV6 => Ok(()),
        _ => Err(BuilderError::invalid_configuration(format!(
            "Invalid host for AWS {field} <{value}>, the host must be {METADATA_IPV4} or {METADATA_IPV6}."
        ))),
    }
}

impl AwsSourcedCredentials {
    pub(crate) fn new(config: AwsSourceConfig) -> BuildResult<Self> {
        validate_environment_id(&config.environment_id)?;
        let regional_cred_verification_url = config
            .regional_cred_verification_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                BuilderError::missing_field("credential_source.regional_cred_verification_url")
            })?;
        for (field, value) in [
            ("region_url", &config.region_url),
            ("url", &config.url),
            ("imdsv2_session_token_url", &config.imdsv2_session_token_url),
        ] {
            if let Some(v) = value {
                validate_metadata_url(field, v)?;
            }
        }
        Ok(Self {
            environment_id: config.environment_id,
            region_url: config.region_url,
            url: config.url,
            regional_cred_verification_url,
            imdsv2_session_token_url: config.imdsv2_session_token_url,
            client: reqwest::Client::new(),
        })
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut value = json!({
            "environment_id": self.environment_id,
            "regional_cred_verification_url": self.regional_cred_verification_url,
        });
        for (field, v) in [
            ("region_url", &self.region_url),
            ("url", &self.url),
            ("imdsv2_session_token_url", &self.imdsv2_session_token_url),
        ] {
            if let Some(v) = v {
                value[field] = json!(v);
            }
        }
        value
    }

    pub(crate) async fn subject_token(&self, context: &SubjectTokenContext) -> Result<SubjectToken> {
        let region = env_region();
        let credentials = AwsSecurityCredentials::from_env();

        let mut metadata_headers = HeaderMap::new();
        if region.is_none() || credentials.is_none() {
            if let Some(url) = &self.imdsv2_session_token_url {
                let token = self.session_token(url).await?;
                let mut value = HeaderValue::from_str(&token).map_err(|e| {
                    CredentialsError::new(false, "invalid AWS IMDSv2 session token", e)
                })?;
                value.set_sensitive(true);
                metadata_headers.insert(IMDSV2_TOKEN_HEADER, value);
            }
        }
        let region = match region {
            Some(r) => r,
            None => self.region(&metadata_headers).await?,
        };
        let credentials = match credentials {
            Some(c) => c,
            None => self.security_credentials(&metadata_headers).await?,
        };

        let url = self
            .regional_cred_verification_url
            .replace("{region}", &region);
        let now = OffsetDateTime::now_utc();
        let signed = sign_request(
            "POST",
            &url,
            &region,
            &credentials,
            &[(TARGET_RESOURCE_HEADER, context.audience.as_str())],
            now,
            b"",
        )?;
        let mut headers = vec![json!({"key": "Authorization", "value": signed.authorization})];
        headers.extend(
            signed
                .headers
                .iter()
                .map(|(k, v)| json!({"key": k, "value": v})),
        );
        let request = json!({
            "url": url,
            "method": "POST",
            "headers": headers,
        });
        let token: String =
            url::form_urlencoded::byte_serialize(request.to_string().as_bytes()).collect();
        Ok(SubjectTokenBuilder::new(token).build())
    }

    async fn session_token(&self, url: &str) -> Result<String> {
        const MSG: &str = "failed to fetch the AWS IMDSv2 session token";
        let response = self
            .client
            .put(url)
            .header(IMDSV2_TTL_HEADER, IMDSV2_TTL_SECONDS)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, MSG))?;
        Self::text(response, MSG).await
    }

    async fn region(&self, headers: &HeaderMap) -> Result<String> {
        const MSG: &str = "failed to fetch the AWS region";
        let url = self.region_url.as_ref().ok_or_else(|| {
            CredentialsError::from_msg(
                false,
                "Unable to determine the AWS region. The credential source does not contain the region URL.",
            )
        })?;
        let zone = self.get(url, headers, MSG).await?;
        // The metadata server returns the availability zone, such as
        // `us-east-1b`. The region drops the trailing zone letter.
        let zone = zone.trim();
        let mut chars = zone.chars();
        chars.next_back();
        let region = chars.as_str();
        if region.is_empty() {
            return Err(CredentialsError::from_msg(
                false,
                format!("{MSG}, invalid availability zone <{zone}>"),
            ));
        }
        Ok(region.to_string())
    }

    async fn security_credentials(&self, headers: &HeaderMap) -> Result<AwsSecurityCredentials> {
        const MSG: &str = "failed to fetch the AWS security credentials";
        let url = self.url.as_ref().ok_or_else(|| {
            CredentialsError::from_msg(
                false,
                "Unable to determine the AWS IAM role name. The credential source does not contain the url field.",
            )
        })?;
        let role = self.get(url, headers, MSG).await?;
        let role = role.trim();
        if role.is_empty() {
            return Err(CredentialsError::from_msg(
                false,
                "Unable to determine the AWS IAM role name. The metadata server returned an empty role.",
            ));
        }
        let body = self
            .get(&format!("{}/{role}", url.trim_end_matches('/')), headers, MSG)
            .await?;
        let credentials: MetadataCredentials = serde_json::from_str(&body).map_err(|e| {
            CredentialsError::new(
                false,
                "Unable to retrieve the AWS security credentials, the metadata server response is invalid",
                e,
            )
        })?;
        Ok(credentials.into())
    }

    async fn get(&self, url: &str, headers: &HeaderMap, msg: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .headers(headers.clone())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, msg))?;
        Self::text(response, msg).await
    }

    async fn text(response: reqwest::Response, msg: &str) -> Result<String> {
        if !response.status().is_success() {
            return Err(errors::from_http_response(response, msg).await);
        }
        response.text().await.map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::new(retryable, msg.to_string(), e)
        })
    }
}

/// The result of signing a request.
#[derive(Debug, PartialEq)]
struct SignedRequest {
    authorization: String,
    /// The signed headers, keyed by their lowercase name.
    headers: BTreeMap<String, String>,
}

/// Signs a request with [SigV4].
///
/// The `host`, `x-amz-date`, and (for temporary credentials)
/// `x-amz-security-token` headers are added to `extra_headers`. The service
/// name is the first label of the host name.
///
/// [SigV4]: https://docs.aws.amazon.com/IAM/latest/UserGuide/create-signed-request.html
fn sign_request(
    method: &str,
    url: &str,
    region: &str,
    credentials: &AwsSecurityCredentials,
    extra_headers: &[(&str, &str)],
    now: OffsetDateTime,
    body: &[u8],
) -> Result<SignedRequest> {
    let parsed = url::Url::parse(url)
        .map_err(|e| CredentialsError::new(false, format!("invalid AWS request URL <{url}>"), e))?;
    let host = parsed.host_str().ok_or_else(|| {
        CredentialsError::from_msg(false, format!("the AWS request URL <{url}> has no host"))
    })?;
    let service = host.split('.').next().unwrap_or(host);
    let host = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let now = now.to_offset(time::UtcOffset::UTC);
    let format_error = |e| CredentialsError::new(false, "cannot format the AWS request date", e);
    let amz_date = now
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .map_err(format_error)?;
    let date_stamp = now
        .format(format_description!("[year][month][day]"))
        .map_err(format_error)?;

    let mut headers = BTreeMap::new();
    headers.insert("host".to_string(), host);
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    if let Some(token) = &credentials.session_token {
        headers.insert("x-amz-security-token".to_string(), token.clone());
    }
    for (k, v) in extra_headers {
        headers.insert(k.to_ascii_lowercase(), v.to_string());
    }

    let mut query = parsed
        .query_pairs()
        .map(|(k, v)| {
            (
                utf8_percent_encode(&k, AWS_URI_ENCODE).to_string(),
                utf8_percent_encode(&v, AWS_URI_ENCODE).to_string(),
            )
        })
        .collect::<Vec<_>>();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.split_whitespace().collect::<Vec<_>>().join(" ")))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
    let canonical_request = [
        method,
        parsed.path(),
        canonical_query.as_str(),
        canonical_headers.as_str(),
        signed_headers.as_str(),
        hex::encode(Sha256::digest(body)).as_str(),
    ]
    .join("\n");

    let credential_scope = format!("{date_stamp}/{region}/{service}/aws4_request");
    let string_to_sign = [
        SIGNING_ALGORITHM,
        amz_date.as_str(),
        credential_scope.as_str(),
        hex::encode(Sha256::digest(canonical_request.as_bytes())).as_str(),
    ]
    .join("\n");

    let key = format!("AWS4{}", credentials.secret_access_key);
    let key = hmac_sha256(key.as_bytes(), date_stamp.as_bytes())?;
    let key = hmac_sha256(&key, region.as_bytes())?;
    let key = hmac_sha256(&key, service.as_bytes())?;
    let key = hmac_sha256(&key, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "{SIGNING_ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );
    Ok(SignedRequest {
        authorization,
        headers,
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| CredentialsError::from_msg(false, "invalid AWS signing key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
