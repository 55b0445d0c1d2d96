//! Checks that signed documents only ever grow by valid signature increments.

use anyhow::Result;
use lopdf::Document;

use crate::{
    increment_validation,
    inspect::{inspect_document, SignatureInfo},
    pdf_ends_with_eof, CertificationLevel, Error, Pkcs7Verifier,
};

/// Verifies that `current` is `previous` followed by a single incremental
/// update that adds exactly one signature and nothing else.
///
/// Earlier signatures must be carried over unchanged, the new one must cover
/// the whole of `current`, and certification rules of `previous` must be
/// respected. Returns the new signature.
pub fn verify_append(previous: &[u8], current: &[u8]) -> Result<SignatureInfo> {
    if !pdf_ends_with_eof(previous) {
        return Err(Error::InvalidSourceDocument.into());
    }
    if !current.starts_with(previous) {
        return Err(Error::PossibleContentChange.into());
    }

    let prev_doc = Document::load_mem(previous)?;
    let prev_state = inspect_document(&prev_doc, previous)?;
    let curr_doc = Document::load_mem(current)?;
    let curr_state = inspect_document(&curr_doc, current)?;

    let mut added = curr_state
        .signatures
        .iter()
        .filter(|s| s.coverage_end() > previous.len());
    let new_sig = match (added.next(), added.next()) {
        (Some(sig), None) => sig,
        (None, _) => return Err(Error::UnexpectedSignatureCount(0).into()),
        (Some(_), Some(_)) => {
            return Err(Error::UnexpectedSignatureCount(2 + added.count()).into())
        }
    };

    // The new signature must cover the whole document.
    if new_sig.coverage_end() != current.len() {
        return Err(Error::IncompleteCoverage.into());
    }
    // Signature object must be after the previous document.
    if (new_sig.offset as usize) < previous.len() {
        return Err(Error::InvalidSignatureObject.into());
    }

    for prev_sig in &prev_state.signatures {
        let unchanged = curr_state.signature(&prev_sig.field_name).is_some_and(|s| {
            s.signed_byte_ranges == prev_sig.signed_byte_ranges
                && s.pkcs7_der == prev_sig.pkcs7_der
                && s.obj_id == prev_sig.obj_id
        });
        if !unchanged {
            return Err(Error::SignatureRewritten(prev_sig.field_name.clone()).into());
        }
    }
    let new_count = curr_state
        .signatures
        .len()
        .saturating_sub(prev_state.signatures.len());
    if new_count != 1 {
        return Err(Error::UnexpectedSignatureCount(new_count).into());
    }

    match prev_state.certification_level {
        CertificationLevel::CertifiedNoChangesAllowed => {
            return Err(Error::DocumentLocked.into());
        }
        level if level.is_certification() && new_sig.certification.is_certification() => {
            return Err(Error::AlreadyCertified.into());
        }
        _ => (),
    }

    let added_widget = increment_validation::verify_increment(new_sig, &curr_doc, &prev_doc)?;
    if let Some(widget) = added_widget {
        log::debug!(
            "field {:?} added as a widget on page {}",
            new_sig.field_name,
            widget.page_idx
        );
    }

    Ok(new_sig.clone())
}

/// Verifies every signature of a document with `verifier`, in signing order.
///
/// The last signature must cover the whole file, and every increment after
/// the first signature must be a valid signature increment as checked by
/// [`verify_append`]. Content before the first signature is not scrutinized.
pub fn verify_signatures<V: Pkcs7Verifier>(
    pdf_bytes: &[u8],
    verifier: V,
) -> Result<Vec<(SignatureInfo, V::Return)>> {
    let doc = Document::load_mem(pdf_bytes)?;
    let state = inspect_document(&doc, pdf_bytes)?;

    match state.signatures.last() {
        Some(last) if last.coverage_end() != pdf_bytes.len() => {
            return Err(Error::IncompleteCoverage.into())
        }
        Some(_) => (),
        None => return Ok(Vec::new()),
    }

    for pair in state.signatures.windows(2) {
        verify_append(
            &pdf_bytes[..pair[0].coverage_end()],
            &pdf_bytes[..pair[1].coverage_end()],
        )?;
    }

    state
        .signatures
        .into_iter()
        .map(|sig| {
            let [first, second] = &sig.signed_byte_ranges;
            let verified = verifier.verify(
                &sig.pkcs7_der,
                [&pdf_bytes[first.clone()], &pdf_bytes[second.clone()]],
            )?;
            Ok((sig, verified))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        last_startxref, sign,
        testing::{three_signer_form, FakeSigner},
        writer::{IncrementalWriter, XrefFormat},
        SignRequest, SigningConfig,
    };
    use lopdf::{dictionary, Object};

    struct ChecksumVerifier;

    impl Pkcs7Verifier for ChecksumVerifier {
        type Return = usize;

        fn verify(&self, pkcs7_der: &[u8], signed_data: [&[u8]; 2]) -> Result<usize> {
            anyhow::ensure!(
                pkcs7_der == FakeSigner::expected_signature(signed_data),
                "checksum mismatch"
            );
            Ok(signed_data[0].len() + signed_data[1].len())
        }
    }

    fn sign_with(
        source: &[u8],
        field: &str,
        level: CertificationLevel,
        signer: &'static str,
    ) -> Vec<u8> {
        let config = SigningConfig::default();
        sign(
            source,
            &SignRequest::new(field, level, &config),
            &FakeSigner(signer),
        )
        .unwrap()
    }

    fn error_of<T: std::fmt::Debug>(result: Result<T>) -> Error {
        result.unwrap_err().downcast::<Error>().unwrap()
    }

    #[test]
    fn each_signing_step_is_a_valid_append() {
        let template = three_signer_form();
        let first = sign_with(&template, "sig1", CertificationLevel::CertifiedFormFilling, "Alice");
        let second = sign_with(&first, "sig2", CertificationLevel::NotCertified, "Bob");
        let third = sign_with(&second, "sig3", CertificationLevel::NotCertified, "Carol");

        assert_eq!(verify_append(&template, &first).unwrap().field_name, "sig1");
        assert_eq!(verify_append(&first, &second).unwrap().field_name, "sig2");
        let last = verify_append(&second, &third).unwrap();
        assert_eq!(last.field_name, "sig3");
        assert_eq!(last.signer_name.as_deref(), Some("Carol"));

        let verified = verify_signatures(&third, ChecksumVerifier).unwrap();
        let fields: Vec<&str> = verified.iter().map(|(s, _)| s.field_name.as_str()).collect();
        assert_eq!(fields, ["sig1", "sig2", "sig3"]);
        assert!(verified.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn invisible_field_creation_is_a_valid_append() {
        let template = three_signer_form();
        let config = SigningConfig {
            create_missing_fields: true,
            ..SigningConfig::default()
        };
        let signed = sign(
            &template,
            &SignRequest::new("Signature1", CertificationLevel::NotCertified, &config),
            &FakeSigner("Bruno"),
        )
        .unwrap();
        assert_eq!(verify_append(&template, &signed).unwrap().field_name, "Signature1");
    }

    #[test]
    fn changed_prefix_is_detected() {
        let template = three_signer_form();
        let mut signed = sign_with(&template, "sig1", CertificationLevel::NotCertified, "Alice");
        // Flip a byte of the header comment.
        signed[1] = b'Q';
        assert!(matches!(
            error_of(verify_append(&template, &signed)),
            Error::PossibleContentChange
        ));
    }

    #[test]
    fn two_signatures_in_one_step_are_rejected() {
        let template = three_signer_form();
        let first = sign_with(&template, "sig1", CertificationLevel::NotCertified, "Alice");
        let second = sign_with(&first, "sig2", CertificationLevel::NotCertified, "Bob");
        assert!(matches!(
            error_of(verify_append(&template, &second)),
            Error::UnexpectedSignatureCount(2)
        ));
        assert!(matches!(
            error_of(verify_append(&template, &template)),
            Error::UnexpectedSignatureCount(0)
        ));
    }

    #[test]
    fn unsigned_page_change_before_signing_is_detected() {
        let template = three_signer_form();
        let doc = Document::load_mem(&template).unwrap();
        let page_id = doc.get_pages()[&1];
        let mut page = doc.get_dictionary(page_id).unwrap().clone();
        page.set("Rotate", 90);

        let mut writer = IncrementalWriter::new(&template);
        writer.write_object(page_id, &Object::Dictionary(page)).unwrap();
        let trailer = dictionary! {
            "Size" => doc.trailer.get(b"Size").unwrap().clone(),
            "Root" => doc.trailer.get(b"Root").unwrap().clone(),
        };
        let tampered = writer
            .finish(trailer, last_startxref(&template).unwrap(), XrefFormat::Table)
            .unwrap();

        let signed = sign_with(&tampered, "sig1", CertificationLevel::NotCertified, "Alice");
        // Fine relative to what was actually signed...
        verify_append(&tampered, &signed).unwrap();
        // ...but not relative to the template.
        let err = verify_append(&template, &signed).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<increment_validation::Error>(),
            Some(increment_validation::Error::PageMismatch)
        ));
    }

    #[test]
    fn forged_signature_fails_verification() {
        let template = three_signer_form();
        let mut signed = sign_with(&template, "sig1", CertificationLevel::NotCertified, "Alice");
        let sig = crate::inspect(&signed).unwrap().signatures.remove(0);
        // Corrupt one hex digit of the checksum inside /Contents.
        let digit = sig.signed_byte_ranges[0].end + 1 + 2 * 4;
        signed[digit] = if signed[digit] == b'0' { b'1' } else { b'0' };

        assert!(verify_signatures(&signed, ChecksumVerifier).is_err());
    }

    #[test]
    fn unsigned_documents_have_nothing_to_verify() {
        assert!(verify_signatures(&three_signer_form(), ChecksumVerifier)
            .unwrap()
            .is_empty());
    }
}
