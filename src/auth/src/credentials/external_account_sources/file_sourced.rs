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
use crate::errors::CredentialsError;
use crate::{BuildResult, Result};
use serde_json::{Value, json};

/// Reads the subject token from a local file.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FileSourcedCredentials {
    pub file: String,
    pub format: SubjectTokenFormat,
}

impl FileSourcedCredentials {
    pub(crate) fn new(file: String, format: Option<CredentialSourceFormat>) -> BuildResult<Self> {
        Ok(Self {
            file,
            format: SubjectTokenFormat::new(format)?,
        })
    }

    pub(crate) fn to_json(&self) -> Value {
        json!({
            "file": self.file,
            "format": self.format.to_json(),
        })
    }

    pub(crate) async fn subject_token(&self) -> Result<SubjectToken> {
        let content = match tokio::fs::read_to_string(&self.file).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialsError::new(
                    false,
                    format!("File does not exist: {}", self.file),
                    e,
                ));
            }
            Err(e) => {
                return Err(CredentialsError::new(
                    false,
                    format!("Error reading credential file: {}", self.file),
                    e,
                ));
            }
        };
        let token = self.format.extract(content)?;
        Ok(SubjectTokenBuilder::new(token).build())
    }
}
