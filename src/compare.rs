//! Structural comparison of two signed documents.
//!
//! Signing times, byte ranges and the PKCS #7 blobs differ between any two
//! signing runs and are ignored. What is left is compared: pages, fields,
//! certification and the visible properties of every signature.

use std::fmt;

use anyhow::Result;

use crate::{inspect, CertificationLevel, SignatureInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum Difference {
    PageCount {
        expected: usize,
        actual: usize,
    },
    CertificationLevel {
        expected: CertificationLevel,
        actual: CertificationLevel,
    },
    UnsignedFields {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    SignatureCount {
        expected: usize,
        actual: usize,
    },
    /// A property of the signature at `index`, in signing order.
    Signature {
        index: usize,
        property: &'static str,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::PageCount { expected, actual } => {
                write!(f, "page count: expected {expected}, got {actual}")
            }
            Difference::CertificationLevel { expected, actual } => {
                write!(f, "certification: expected {expected:?}, got {actual:?}")
            }
            Difference::UnsignedFields { expected, actual } => {
                write!(f, "unsigned fields: expected {expected:?}, got {actual:?}")
            }
            Difference::SignatureCount { expected, actual } => {
                write!(f, "signature count: expected {expected}, got {actual}")
            }
            Difference::Signature {
                index,
                property,
                expected,
                actual,
            } => write!(
                f,
                "signature #{index} {property}: expected {expected}, got {actual}"
            ),
        }
    }
}

/// Lists the differences between two documents. An empty list means they
/// are equivalent.
pub fn compare(expected: &[u8], actual: &[u8]) -> Result<Vec<Difference>> {
    let expected = inspect(expected)?;
    let actual = inspect(actual)?;
    let mut differences = Vec::new();

    if expected.page_count != actual.page_count {
        differences.push(Difference::PageCount {
            expected: expected.page_count,
            actual: actual.page_count,
        });
    }
    if expected.certification_level != actual.certification_level {
        differences.push(Difference::CertificationLevel {
            expected: expected.certification_level,
            actual: actual.certification_level,
        });
    }
    if expected.unsigned_fields != actual.unsigned_fields {
        differences.push(Difference::UnsignedFields {
            expected: expected.unsigned_fields.clone(),
            actual: actual.unsigned_fields.clone(),
        });
    }
    if expected.signatures.len() != actual.signatures.len() {
        differences.push(Difference::SignatureCount {
            expected: expected.signatures.len(),
            actual: actual.signatures.len(),
        });
    }

    for (index, (e, a)) in expected
        .signatures
        .iter()
        .zip(&actual.signatures)
        .enumerate()
    {
        for (property, expected, actual) in signature_properties(e)
            .into_iter()
            .zip(signature_properties(a))
            .map(|((property, e), (_, a))| (property, e, a))
        {
            if expected != actual {
                differences.push(Difference::Signature {
                    index,
                    property,
                    expected,
                    actual,
                });
            }
        }
    }

    Ok(differences)
}

fn signature_properties(sig: &SignatureInfo) -> [(&'static str, String); 7] {
    [
        ("field", sig.field_name.clone()),
        ("signer", format!("{:?}", sig.signer_name)),
        ("reason", format!("{:?}", sig.reason)),
        ("location", format!("{:?}", sig.location)),
        ("contact", format!("{:?}", sig.contact_info)),
        ("certification", format!("{:?}", sig.certification)),
        ("widget", format!("{:?}", sig.annotation)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sign,
        testing::{three_signer_form, FakeSigner},
        SignRequest, SigningConfig,
    };
    use chrono::{TimeZone, Utc};

    fn sign_as(
        source: &[u8],
        config: &SigningConfig,
        field: &str,
        signer: &'static str,
    ) -> Vec<u8> {
        let request = SignRequest::new(field, CertificationLevel::NotCertified, config);
        sign(source, &request, &FakeSigner(signer)).unwrap()
    }

    #[test]
    fn signing_runs_at_different_times_are_equivalent() {
        let template = three_signer_form();
        let at = |year| SigningConfig {
            signing_time: Some(Utc.with_ymd_and_hms(year, 5, 1, 12, 0, 0).unwrap()),
            ..SigningConfig::default()
        };
        let first = sign_as(&template, &at(2020), "sig1", "Alice");
        let second = sign_as(&template, &at(2024), "sig1", "Alice");

        assert_ne!(first, second);
        assert!(compare(&first, &second).unwrap().is_empty());
    }

    #[test]
    fn visible_differences_are_listed() {
        let template = three_signer_form();
        let config = SigningConfig::default();
        let expected = sign_as(&template, &config, "sig1", "Alice");
        let actual = sign_as(&template, &config, "sig2", "Mallory");

        let differences = compare(&expected, &actual).unwrap();
        assert!(differences.contains(&Difference::UnsignedFields {
            expected: vec!["sig2".into(), "sig3".into()],
            actual: vec!["sig1".into(), "sig3".into()],
        }));
        assert!(differences.contains(&Difference::Signature {
            index: 0,
            property: "signer",
            expected: "Some(\"Alice\")".into(),
            actual: "Some(\"Mallory\")".into(),
        }));
        assert!(differences
            .iter()
            .any(|d| matches!(d, Difference::Signature { property: "widget", .. })));

        assert_eq!(
            compare(&template, &expected).unwrap(),
            [
                Difference::UnsignedFields {
                    expected: vec!["sig1".into(), "sig2".into(), "sig3".into()],
                    actual: vec!["sig2".into(), "sig3".into()],
                },
                Difference::SignatureCount {
                    expected: 0,
                    actual: 1
                },
            ]
        );
    }
}
