#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

#[cfg(feature = "openssl")]
pub mod openssl;

pub mod chain;
pub mod compare;
pub mod config;
pub mod form;
mod increment_validation;
pub mod inspect;
pub mod plan;
pub mod sign;
#[cfg(test)]
mod testing;
pub mod verify;
mod writer;

use anyhow::Result;
use lopdf::{Document, Object};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chain::{FailureKind, Orchestrator, SigningChain, SigningStep, StepError};
pub use config::{SignatureMetadata, SigningConfig};
pub use form::{FormBuilder, FormLayout, Rect};
pub use increment_validation::Annotation;
pub use inspect::{inspect, SignatureInfo, SignedDocument};
pub use sign::{sign, SignRequest};
pub use verify::{verify_append, verify_signatures};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid credential store: {0}")]
    InvalidCredentials(String),
    #[error("credential store holds no private key")]
    MissingPrivateKey,
    #[error("credential store holds no certificate")]
    MissingCertificate,
    #[error("source document does not end like a PDF file")]
    InvalidSourceDocument,
    #[error("document has no trailer /Root catalog reference")]
    MissingCatalog,
    #[error("document has no pages")]
    NoPages,
    #[error("no form field named {0:?}")]
    FieldNotFound(String),
    #[error("form field {0:?} is not a signature field")]
    NotASignatureField(String),
    #[error("form field {0:?} is defined more than once")]
    DuplicateField(String),
    #[error("signature field {0:?} is already signed")]
    FieldAlreadySigned(String),
    #[error("document is certified with no changes allowed")]
    DocumentLocked,
    #[error("document already carries a certification signature")]
    AlreadyCertified,
    #[error("signature needs {needed} bytes but only {reserved} were reserved")]
    SignatureTooLarge { needed: usize, reserved: usize },
    #[error("can not guarantee the contents of the signed document match the original")]
    PossibleContentChange,
    #[error("increment must add exactly one signature, found {0}")]
    UnexpectedSignatureCount(usize),
    #[error("signature in field {0:?} changed after a later increment")]
    SignatureRewritten(String),
    #[error("invalid signature object")]
    InvalidSignatureObject,
    #[error("file is not signed from the beginning")]
    WrongRangeStart,
    #[error("signature range does not end at the end of a PDF file")]
    WrongRangeEnd,
    #[error("invalid signature range")]
    InvalidRange,
    #[error("signature coverage skips over wrong sections of the document")]
    InvalidCoverage,
    #[error("last signature does not cover the whole document")]
    IncompleteCoverage,
    #[error("can not ensure that the incremental update didn't change the document")]
    InternalConsistency,
}

impl Error {
    /// Classifies the error for callers that only care about the broad cause.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::InvalidCredentials(_) | Error::MissingPrivateKey | Error::MissingCertificate => {
                FailureKind::Credential
            }
            Error::DocumentLocked | Error::AlreadyCertified | Error::FieldAlreadySigned(_) => {
                FailureKind::PolicyViolation
            }
            _ => FailureKind::Document,
        }
    }
}

/// DocMDP permission granted by a certification signature.
///
/// Only the first certification of a document is meaningful; everything else
/// is an approval signature (`NotCertified`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum CertificationLevel {
    #[default]
    NotCertified,
    CertifiedNoChangesAllowed,
    CertifiedFormFilling,
    CertifiedFormFillingAndAnnotations,
}

impl CertificationLevel {
    /// The `/P` value of the DocMDP transform parameters, or `None` for an
    /// approval signature.
    pub fn docmdp_permission(self) -> Option<i64> {
        match self {
            CertificationLevel::NotCertified => None,
            CertificationLevel::CertifiedNoChangesAllowed => Some(1),
            CertificationLevel::CertifiedFormFilling => Some(2),
            CertificationLevel::CertifiedFormFillingAndAnnotations => Some(3),
        }
    }

    /// Maps a DocMDP `/P` value back. Absent or unknown values default to 2,
    /// as the PDF reference mandates.
    pub fn from_docmdp_permission(p: Option<i64>) -> Self {
        match p {
            Some(1) => CertificationLevel::CertifiedNoChangesAllowed,
            Some(3) => CertificationLevel::CertifiedFormFillingAndAnnotations,
            _ => CertificationLevel::CertifiedFormFilling,
        }
    }

    pub fn is_certification(self) -> bool {
        self != CertificationLevel::NotCertified
    }
}

/// Produces detached PKCS #7 signatures for the signing primitive.
///
/// The OpenSSL implementation lives in the optional [`openssl`] module.
pub trait Pkcs7Signer {
    /// Display name of the signer, written into `/Name` and the appearance.
    fn signer_name(&self) -> &str;

    /// Signs the concatenation of both slices and returns the DER encoded
    /// PKCS #7 signature.
    fn sign(&self, signed_data: [&[u8]; 2]) -> Result<Vec<u8>>;
}

impl<T: Pkcs7Signer + ?Sized> Pkcs7Signer for &T {
    fn signer_name(&self) -> &str {
        (**self).signer_name()
    }

    fn sign(&self, signed_data: [&[u8]; 2]) -> Result<Vec<u8>> {
        (**self).sign(signed_data)
    }
}

/// Verifies the PKCS #7 signatures found in a document.
pub trait Pkcs7Verifier {
    /// Whatever the verifier wants to hand back for a valid signature.
    type Return;

    fn verify(&self, pkcs7_der: &[u8], signed_data: [&[u8]; 2]) -> Result<Self::Return>;
}

struct ExactArrayOrNone<T, const N: usize>(Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

/// Reads a PDF rectangle (an array of exactly four numbers).
fn read_rect(doc: &Document, obj: &Object) -> Result<[f32; 4]> {
    Ok(doc
        .dereference(obj)?
        .1
        .as_array()?
        .iter()
        .map(|r| {
            doc.dereference(r).and_then(|(_, r)| match r {
                Object::Integer(i) => Ok(*i as f32),
                other => other.as_float(),
            })
        })
        .collect::<lopdf::Result<ExactArrayOrNone<f32, 4>>>()?
        .0
        .ok_or(lopdf::Error::Type)?)
}

/// Decodes a PDF hex string, including the delimiters '<' and '>'.
///
/// Whitespace is skipped. Returns None if any other character is not a valid
/// hex digit.
fn decode_pdf_hex_string(hex_input: &[u8]) -> Option<Vec<u8>> {
    // First and last characters must be the delimiters '<' and '>'.
    if hex_input.first() != Some(&b'<') || hex_input.last() != Some(&b'>') {
        return None;
    }
    let hex_input = &hex_input[1..hex_input.len() - 1];

    let mut bytes = Vec::new();
    let mut hex_iter = hex_input.iter().filter_map(|&b| {
        let c = b as char;
        if c.is_whitespace() {
            None
        } else {
            Some(c.to_digit(16))
        }
    });

    while let Some(first) = hex_iter.next() {
        let first = first? as u8;
        let second = hex_iter.next().unwrap_or(Some(0))? as u8;
        bytes.push(first << 4 | second);
    }

    Some(bytes)
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
    static ref STARTXREF_REGEX: Regex =
        Regex::new(r"startxref[ \t]*(?:\r\n|\r|\n)[ \t]*(\d+)[ \t]*(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Tests if the PDF ends with the %%EOF marker.
fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}

/// Offset of the last cross-reference section, as announced by the final
/// `startxref` of the file.
fn last_startxref(pdf_bytes: &[u8]) -> Option<usize> {
    let captures = STARTXREF_REGEX.captures(pdf_bytes)?;
    std::str::from_utf8(captures.get(1)?.as_bytes())
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_strings_decode_with_whitespace_and_odd_length() {
        assert_eq!(decode_pdf_hex_string(b"<0A ff\n1>"), Some(vec![0x0a, 0xff, 0x10]));
        assert_eq!(decode_pdf_hex_string(b"<>"), Some(vec![]));
        assert_eq!(decode_pdf_hex_string(b"<0G>"), None);
        assert_eq!(decode_pdf_hex_string(b"0A>"), None);
    }

    #[test]
    fn eof_and_startxref_markers() {
        let tail = b"trailer\n<<>>\nstartxref\n1234\n%%EOF\n";
        assert!(pdf_ends_with_eof(tail));
        assert_eq!(last_startxref(tail), Some(1234));

        assert!(!pdf_ends_with_eof(b"%%EOF trailing garbage"));
        assert_eq!(last_startxref(b"startxref\n12\n%%EOF\njunk"), None);
    }

    #[test]
    fn docmdp_permissions_round_trip() {
        for level in [
            CertificationLevel::CertifiedNoChangesAllowed,
            CertificationLevel::CertifiedFormFilling,
            CertificationLevel::CertifiedFormFillingAndAnnotations,
        ] {
            assert_eq!(
                CertificationLevel::from_docmdp_permission(level.docmdp_permission()),
                level
            );
        }
        assert_eq!(CertificationLevel::NotCertified.docmdp_permission(), None);
        assert_eq!(
            CertificationLevel::from_docmdp_permission(None),
            CertificationLevel::CertifiedFormFilling
        );
    }

    #[test]
    fn policy_errors_are_classified_apart_from_io() {
        assert_eq!(Error::DocumentLocked.kind(), FailureKind::PolicyViolation);
        assert_eq!(Error::AlreadyCertified.kind(), FailureKind::PolicyViolation);
        assert_eq!(Error::MissingPrivateKey.kind(), FailureKind::Credential);
        assert_eq!(Error::InvalidRange.kind(), FailureKind::Document);
    }
}
