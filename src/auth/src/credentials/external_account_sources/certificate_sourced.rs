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

//! Subject tokens for X.509 certificate-bound credentials.
//!
//! The subject token is a JSON array with the base64-encoded DER of the
//! workload certificate, followed by any certificates in its trust chain.

use crate::build_errors::Error as BuilderError;
use crate::credentials::subject_token::{Builder as SubjectTokenBuilder, SubjectToken};
use crate::errors::CredentialsError;
use crate::{BuildResult, Result};
use base64::Engine;
use base64::prelude::{BASE64_STANDARD, BASE64_URL_SAFE_NO_PAD};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

const CERTIFICATE_CONFIG_VAR: &str = "GOOGLE_API_CERTIFICATE_CONFIG";
const CERTIFICATE_CONFIG_FILE: &str = "certificate_config.json";

/// The `certificate` section of the credential source, as found in the
/// configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct CertificateConfig {
    pub use_default_certificate_config: Option<bool>,
    pub certificate_config_location: Option<String>,
    pub trust_chain_path: Option<String>,
}

/// The certificate configuration file written by `gcloud`.
#[derive(Deserialize)]
struct CertificateConfigFile {
    cert_configs: CertConfigs,
}

#[derive(Deserialize)]
struct CertConfigs {
    workload: Option<WorkloadCertConfig>,
}

#[derive(Deserialize)]
struct WorkloadCertConfig {
    cert_path: String,
}

/// Returns the SHA-256 fingerprint of a DER encoded certificate, as
/// base64url without padding.
pub(crate) fn certificate_fingerprint(der: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(der))
}

/// Where to find the certificate configuration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CertificateConfigLocation {
    /// `GOOGLE_API_CERTIFICATE_CONFIG`, or the gcloud well-known path.
    Default,
    Explicit(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CertificateSourcedCredentials {
    pub location: CertificateConfigLocation,
    pub trust_chain_path: Option<String>,
}

impl CertificateSourcedCredentials {
    pub(crate) fn new(config: CertificateConfig) -> BuildResult<Self> {
        let use_default = config.use_default_certificate_config.unwrap_or(false);
        let location = match (use_default, config.certificate_config_location) {
            (true, None) => CertificateConfigLocation::Default,
            (false, Some(path)) if !path.is_empty() => CertificateConfigLocation::Explicit(path),
            (true, Some(_)) => {
                return Err(BuilderError::invalid_configuration(
                    "Invalid certificate configuration: use_default_certificate_config and certificate_config_location cannot both be set.",
                ));
            }
            (false, _) => {
                return Err(BuilderError::invalid_configuration(
                    "Invalid certificate configuration: either use_default_certificate_config must be true or certificate_config_location must be set.",
                ));
            }
        };
        Ok(Self {
            location,
            trust_chain_path: config.trust_chain_path,
        })
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut certificate = match &self.location {
            CertificateConfigLocation::Default => json!({"use_default_certificate_config": true}),
            CertificateConfigLocation::Explicit(path) => {
                json!({"certificate_config_location": path})
            }
        };
        if let Some(p) = &self.trust_chain_path {
            certificate["trust_chain_path"] = json!(p);
        }
        json!({ "certificate": certificate })
    }

    fn config_path(&self) -> Result<PathBuf> {
        match &self.location {
            CertificateConfigLocation::Explicit(path) => Ok(PathBuf::from(path)),
            CertificateConfigLocation::Default => {
                if let Some(path) = std::env::var_os(CERTIFICATE_CONFIG_VAR) {
                    return Ok(PathBuf::from(path));
                }
                well_known_config_path().ok_or_else(|| {
                    CredentialsError::from_msg(
                        false,
                        "cannot find the default certificate configuration file",
                    )
                })
            }
        }
    }

    pub(crate) async fn subject_token(&self) -> Result<SubjectToken> {
        let config_path = self.config_path()?;
        let contents = tokio::fs::read(&config_path).await.map_err(|e| {
            CredentialsError::new(
                false,
                format!(
                    "cannot read the certificate configuration file {}",
                    config_path.display()
                ),
                e,
            )
        })?;
        let config: CertificateConfigFile = serde_json::from_slice(&contents).map_err(|e| {
            CredentialsError::new(false, "cannot parse the certificate configuration file", e)
        })?;
        let workload = config.cert_configs.workload.ok_or_else(|| {
            CredentialsError::from_msg(
                false,
                "the certificate configuration file has no `cert_configs.workload` section",
            )
        })?;

        let leaf = read_certificates(&workload.cert_path)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CredentialsError::from_msg(
                    false,
                    format!("no certificate found in {}", workload.cert_path),
                )
            })?;
        let fingerprint = certificate_fingerprint(leaf.as_ref());
        tracing::debug!(fingerprint, "using workload certificate");

        let mut chain = vec![leaf];
        if let Some(path) = &self.trust_chain_path {
            for (i, cert) in read_certificates(path).await?.into_iter().enumerate() {
                if cert == chain[0] {
                    if i == 0 {
                        continue;
                    }
                    return Err(CredentialsError::from_msg(
                        false,
                        format!(
                            "the leaf certificate (sha256 {fingerprint}) must be at the top of the trust chain in {path}"
                        ),
                    ));
                }
                chain.push(cert);
            }
        }

        let encoded = chain
            .iter()
            .map(|c| BASE64_STANDARD.encode(c.as_ref()))
            .collect::<Vec<_>>();
        let token = serde_json::to_string(&encoded)
            .map_err(|e| CredentialsError::new(false, "cannot encode the certificate chain", e))?;
        Ok(SubjectTokenBuilder::new(token).build())
    }
}

async fn read_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let contents = tokio::fs::read(path).await.map_err(|e| {
        CredentialsError::new(false, format!("cannot read the certificate file {path}"), e)
    })?;
    CertificateDer::pem_slice_iter(&contents)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            CredentialsError::new(false, format!("cannot parse the certificate file {path}"), e)
        })
}

/// The path to the certificate configuration written by `gcloud`.
fn well_known_config_path() -> Option<PathBuf> {
    let mut path = PathBuf::new();
    if cfg!(windows) {
        path.push(std::env::var("APPDATA").ok()?);
    } else {
        path.push(std::env::var("HOME").ok()?);
        path.push(".config");
    }
    path.push("gcloud");
    path.push(CERTIFICATE_CONFIG_FILE);
    Some(path)
}
