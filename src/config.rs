//! Run-scoped signing configuration.
//!
//! A [`SigningConfig`] is handed to the [`Orchestrator`](crate::Orchestrator)
//! when it is built and is never stored in global state, so two runs with
//! different settings can share a process.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Space reserved for the hex encoded PKCS #7 blob, in bytes of signature.
pub const DEFAULT_CONTENTS_RESERVE: usize = 8192;

/// Optional entries of the signature dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureMetadata {
    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,
    /// Overrides the certificate common name written into `/Name`.
    pub signer_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub metadata: SignatureMetadata,

    /// Bytes reserved for the PKCS #7 signature inside `/Contents`.
    pub contents_reserve: usize,

    /// Adds an invisible signature field to the first page when the target
    /// field does not exist, instead of failing the step.
    pub create_missing_fields: bool,

    /// Re-reads every produced document and checks it is a valid append-only
    /// successor of its input before continuing the chain.
    pub verify_each_step: bool,

    /// Fixed signing time for `/M`. The current time is used when unset.
    pub signing_time: Option<DateTime<Utc>>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            metadata: SignatureMetadata::default(),
            contents_reserve: DEFAULT_CONTENTS_RESERVE,
            create_missing_fields: false,
            verify_each_step: true,
            signing_time: None,
        }
    }
}

impl SigningConfig {
    /// Loads a configuration from a JSON file. Missing keys take their
    /// default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SigningConfig::from_json_str(
            r#"{"metadata": {"reason": "Approved", "location": "Ghent"}}"#,
        )
        .unwrap();
        assert_eq!(config.metadata.reason.as_deref(), Some("Approved"));
        assert_eq!(config.metadata.location.as_deref(), Some("Ghent"));
        assert_eq!(config.metadata.contact_info, None);
        assert_eq!(config.contents_reserve, DEFAULT_CONTENTS_RESERVE);
        assert!(config.verify_each_step);
        assert!(!config.create_missing_fields);
    }

    #[test]
    fn signing_time_is_rfc3339() {
        let config =
            SigningConfig::from_json_str(r#"{"signing_time": "2020-01-02T03:04:05Z"}"#).unwrap();
        assert_eq!(
            config.signing_time.unwrap().to_rfc3339(),
            "2020-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn unknown_file_is_an_io_error() {
        let err = SigningConfig::from_json_file("/nonexistent/config.json").unwrap_err();
        assert!(err.downcast_ref::<std::io::Error>().is_some());
    }
}
