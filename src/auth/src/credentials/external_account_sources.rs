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

//! The subject token sources for external account credentials.

pub(crate) mod aws_sourced;
pub(crate) mod certificate_sourced;
pub(crate) mod executable_sourced;
pub(crate) mod file_sourced;
pub(crate) mod programmatic_sourced;
pub(crate) mod url_sourced;

use crate::build_errors::Error as BuilderError;
use crate::errors::CredentialsError;
use crate::{BuildResult, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const TEXT_FORMAT_TYPE: &str = "text";
const JSON_FORMAT_TYPE: &str = "json";

/// The external account settings that some sources need to fetch a subject
/// token.
#[derive(Clone, Debug, Default)]
pub(crate) struct SubjectTokenContext {
    pub audience: String,
    pub subject_token_type: String,
    pub service_account_email: Option<String>,
}

/// The `format` field of file and URL sourced credentials, as found in the
/// configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct CredentialSourceFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    pub subject_token_field_name: Option<String>,
}

/// How to extract the subject token from the contents of a file or a URL
/// response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SubjectTokenFormat {
    Text,
    Json { subject_token_field_name: String },
}

impl SubjectTokenFormat {
    pub(crate) fn new(format: Option<CredentialSourceFormat>) -> BuildResult<Self> {
        let Some(format) = format else {
            return Ok(Self::Text);
        };
        match format.format_type.as_str() {
            TEXT_FORMAT_TYPE => Ok(Self::Text),
            JSON_FORMAT_TYPE => match format.subject_token_field_name {
                Some(name) if !name.is_empty() => Ok(Self::Json {
                    subject_token_field_name: name,
                }),
                _ => Err(BuilderError::invalid_configuration(
                    "When specifying a JSON credential type, the subject_token_field_name must be set.",
                )),
            },
            other => Err(BuilderError::invalid_configuration(format!(
                "Invalid credential source format type: {other}."
            ))),
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        match self {
            Self::Text => json!({ "type": TEXT_FORMAT_TYPE }),
            Self::Json {
                subject_token_field_name,
            } => json!({
                "type": JSON_FORMAT_TYPE,
                "subject_token_field_name": subject_token_field_name,
            }),
        }
    }

    /// Extracts the subject token from `content`.
    pub(crate) fn extract(&self, content: String) -> Result<String> {
        let field = match self {
            Self::Text => return Ok(content),
            Self::Json {
                subject_token_field_name,
            } => subject_token_field_name,
        };
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            CredentialsError::new(false, "cannot parse the subject token source as JSON", e)
        })?;
        match value.get(field) {
            Some(Value::String(token)) => Ok(token.clone()),
            _ => Err(CredentialsError::from_msg(
                false,
                format!("failed to read subject token field `{field}` as string, body=<{value}>"),
            )),
        }
    }
}
