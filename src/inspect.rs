//! Reads back the signature fields, signatures and certification level of a
//! document.

use std::{collections::HashSet, ops::Range};

use anyhow::Result;
use lopdf::{decode_text_string, xref::XrefEntry, Dictionary, Document, Object, ObjectId};

use crate::{
    decode_pdf_hex_string, increment_validation::Annotation, pdf_ends_with_eof, read_rect,
    CertificationLevel, Error, ExactArrayOrNone,
};

/// A signature found in a document. The PKCS #7 blob has not been verified,
/// see [`verify_signatures`](crate::verify_signatures).
#[derive(Debug, Clone)]
pub struct SignatureInfo {
    /// Fully qualified name of the field holding the signature.
    pub field_name: String,

    /// Page and rectangle of the widget, for visible signatures.
    pub annotation: Option<Annotation>,

    pub signer_name: Option<String>,
    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,
    /// Raw `/M` date string.
    pub signing_time: Option<String>,

    /// Certification asserted by this signature, `NotCertified` for an
    /// approval signature.
    pub certification: CertificationLevel,

    /// The byte ranges of the document that were signed. The skipped range
    /// contains the signature itself, as an hexadecimal encoded PDF string.
    pub signed_byte_ranges: [Range<usize>; 2],

    /// DER encoded PKCS #7, without the zero padding of the reserved space.
    pub pkcs7_der: Vec<u8>,

    pub(crate) obj_id: ObjectId,
    pub(crate) offset: u32,
    pub(crate) field_id: ObjectId,
}

impl SignatureInfo {
    /// Offset one past the last signed byte.
    pub fn coverage_end(&self) -> usize {
        self.signed_byte_ranges[1].end
    }
}

#[derive(Debug, Clone)]
pub struct SignedDocument {
    pub certification_level: CertificationLevel,
    /// Signatures in signing order (increasing coverage).
    pub signatures: Vec<SignatureInfo>,
    /// Signature fields that have no value yet, in form order.
    pub unsigned_fields: Vec<String>,
    pub page_count: usize,
    /// Size of the inspected file.
    pub len: usize,
}

impl SignedDocument {
    pub fn signature(&self, field_name: &str) -> Option<&SignatureInfo> {
        self.signatures.iter().find(|s| s.field_name == field_name)
    }

    /// Whether the last signature covers every byte of the file.
    pub fn is_fully_signed(&self) -> bool {
        self.signatures
            .last()
            .is_some_and(|s| s.coverage_end() == self.len)
    }
}

/// Inspects a PDF file held in memory.
pub fn inspect(pdf_bytes: &[u8]) -> Result<SignedDocument> {
    let doc = Document::load_mem(pdf_bytes)?;
    inspect_document(&doc, pdf_bytes)
}

pub(crate) fn inspect_document(doc: &Document, pdf_bytes: &[u8]) -> Result<SignedDocument> {
    let mut signatures = Vec::new();
    let mut unsigned_fields = Vec::new();

    for field in form_fields(doc)? {
        if !field.is_signature {
            continue;
        }
        if field.dict.has(b"V") {
            signatures.push(process_signature(pdf_bytes, doc, &field)?);
        } else {
            unsigned_fields.push(field.name);
        }
    }
    signatures.sort_by_key(|s| s.coverage_end());

    let certification_level = match docmdp_signature(doc)? {
        Some(id) => signatures
            .iter()
            .find(|s| s.obj_id == id)
            .map(|s| s.certification)
            .filter(|c| c.is_certification())
            .unwrap_or(CertificationLevel::CertifiedFormFilling),
        None => CertificationLevel::NotCertified,
    };

    Ok(SignedDocument {
        certification_level,
        signatures,
        unsigned_fields,
        page_count: doc.get_pages().len(),
        len: pdf_bytes.len(),
    })
}

/// A terminal form field.
pub(crate) struct FormField<'a> {
    pub id: ObjectId,
    pub name: String,
    pub dict: &'a Dictionary,
    pub is_signature: bool,
}

/// The `/AcroForm` dictionary of the catalog, if any.
pub(crate) fn acro_form(doc: &Document) -> Result<Option<&Dictionary>> {
    match doc.get_dict_in_dict(doc.catalog()?, b"AcroForm") {
        Ok(val) => Ok(Some(val)),
        Err(lopdf::Error::DictKey) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Walks `/AcroForm /Fields` down to the terminal fields, composing their
/// fully qualified names.
pub(crate) fn form_fields(doc: &Document) -> Result<Vec<FormField<'_>>> {
    let Some(acro_form) = acro_form(doc)? else {
        return Ok(Vec::new());
    };
    let fields = match acro_form.get_deref(b"Fields", doc) {
        Ok(fields) => fields.as_array()?,
        Err(lopdf::Error::DictKey) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for field in fields {
        collect_field(doc, field, None, false, &mut seen, &mut result)?;
    }
    Ok(result)
}

fn collect_field<'a>(
    doc: &'a Document,
    field: &Object,
    parent_name: Option<&str>,
    inherited_signature: bool,
    seen: &mut HashSet<ObjectId>,
    result: &mut Vec<FormField<'a>>,
) -> Result<()> {
    let id = field.as_reference()?;
    if !seen.insert(id) {
        // The field tree has a cycle.
        return Err(lopdf::Error::ReferenceLimit.into());
    }
    let dict = doc.get_dictionary(id)?;

    let partial_name = match dict.get(b"T") {
        Ok(t) => Some(decode_text_string(doc.dereference(t)?.1)?),
        Err(_) => None,
    };
    let name = match (parent_name, partial_name) {
        (Some(parent), Some(partial)) => format!("{parent}.{partial}"),
        (None, Some(partial)) => partial,
        (Some(parent), None) => parent.to_owned(),
        (None, None) => String::new(),
    };
    let is_signature = match dict.get(b"FT") {
        Ok(Object::Name(ft)) => ft == b"Sig",
        _ => inherited_signature,
    };

    // Kids without a /T are widgets of this field, not child fields.
    if let Ok(kids) = dict.get_deref(b"Kids", doc).and_then(Object::as_array) {
        let child_fields: Vec<&Object> = kids
            .iter()
            .filter(|kid| {
                kid.as_reference()
                    .and_then(|id| doc.get_dictionary(id))
                    .is_ok_and(|d| d.has(b"T"))
            })
            .collect();
        if !child_fields.is_empty() {
            for kid in child_fields {
                collect_field(doc, kid, Some(&name), is_signature, seen, result)?;
            }
            return Ok(());
        }
    }

    result.push(FormField {
        id,
        name,
        dict,
        is_signature,
    });
    Ok(())
}

/// Looks a terminal field up by its fully qualified name.
pub(crate) fn find_field<'a>(doc: &'a Document, name: &str) -> Result<Option<FormField<'a>>> {
    Ok(form_fields(doc)?.into_iter().find(|f| f.name == name))
}

/// The signature referenced from `/Perms /DocMDP` of the catalog.
pub(crate) fn docmdp_signature(doc: &Document) -> Result<Option<ObjectId>> {
    let perms = match doc.catalog()?.get_deref(b"Perms", doc) {
        Ok(perms) => perms.as_dict()?,
        Err(lopdf::Error::DictKey) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match perms.get(b"DocMDP") {
        Ok(sig) => Ok(Some(sig.as_reference()?)),
        Err(_) => Ok(None),
    }
}

/// Certification asserted by a signature dictionary through a DocMDP
/// signature reference.
fn signature_certification(doc: &Document, signature: &Dictionary) -> Result<CertificationLevel> {
    let references = match signature.get_deref(b"Reference", doc) {
        Ok(references) => references.as_array()?,
        Err(_) => return Ok(CertificationLevel::NotCertified),
    };

    for reference in references {
        let reference = doc.dereference(reference)?.1.as_dict()?;
        if reference.get_deref(b"TransformMethod", doc)?.as_name()? != b"DocMDP" {
            continue;
        }
        let permission = match reference.get_deref(b"TransformParams", doc) {
            Ok(params) => params
                .as_dict()?
                .get_deref(b"P", doc)
                .and_then(Object::as_i64)
                .ok(),
            Err(_) => None,
        };
        return Ok(CertificationLevel::from_docmdp_permission(permission));
    }

    Ok(CertificationLevel::NotCertified)
}

fn process_signature(pdf_bytes: &[u8], doc: &Document, field: &FormField) -> Result<SignatureInfo> {
    let (Some(obj_id), Object::Dictionary(signature)) = doc.dereference(field.dict.get(b"V")?)?
    else {
        // Signature object must be an indirect dictionary.
        return Err(Error::InvalidSignatureObject.into());
    };

    let signed_range = signature
        .get_deref(b"ByteRange", doc)?
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_i64()))
        .collect::<lopdf::Result<ExactArrayOrNone<i64, 4>>>()?
        .0
        .ok_or(lopdf::Error::Type)?;

    // For soundness, we must ensure the signature covers the file since the
    // beginning.
    if signed_range[0] != 0 {
        return Err(Error::WrongRangeStart.into());
    }

    // Sanity check that the range is well formed and inside the document.
    for &range in &signed_range[1..] {
        if range < 0 {
            return Err(Error::InvalidRange.into());
        }
    }
    let signed_range_end = signed_range[2] + signed_range[3];
    if signed_range[1] > signed_range[2] || signed_range_end > pdf_bytes.len() as i64 {
        return Err(Error::InvalidRange.into());
    }

    // The signature object must be inside the signed range.
    let offset = if let XrefEntry::Normal { offset, generation } = doc
        .reference_table
        .get(obj_id.0)
        .ok_or(Error::InternalConsistency)?
    {
        if *generation != obj_id.1 {
            // The generation is known, so it must match the entry in the xref table.
            return Err(Error::InternalConsistency.into());
        }
        if *offset as i64 >= signed_range[1] {
            return Err(Error::InvalidCoverage.into());
        }
        *offset
    } else {
        return Err(Error::InvalidSignatureObject.into());
    };

    // The /Contents field must match the bytes skipped in the signed range, which must be hex encoded.
    let skipped_range = signed_range[1] as usize..signed_range[2] as usize;
    let skipped_bytes =
        decode_pdf_hex_string(&pdf_bytes[skipped_range.clone()]).ok_or(Error::InvalidCoverage)?;
    let pkcs7_signature = signature.get_deref(b"Contents", doc)?.as_str()?;
    if pkcs7_signature != skipped_bytes {
        return Err(Error::InvalidCoverage.into());
    }

    // Tests if the signature range ends with the PDF end marker (%%EOF).
    if !pdf_ends_with_eof(&pdf_bytes[..signed_range_end as usize]) {
        return Err(Error::WrongRangeEnd.into());
    }

    let text_entry = |key: &[u8]| -> Option<String> {
        signature
            .get_deref(key, doc)
            .and_then(decode_text_string)
            .ok()
    };

    Ok(SignatureInfo {
        field_name: field.name.clone(),
        annotation: widget_annotation(doc, field.id, field.dict)?,
        signer_name: text_entry(b"Name"),
        reason: text_entry(b"Reason"),
        location: text_entry(b"Location"),
        contact_info: text_entry(b"ContactInfo"),
        signing_time: text_entry(b"M"),
        certification: signature_certification(doc, signature)?,
        signed_byte_ranges: [
            0..skipped_range.start,
            skipped_range.end..signed_range_end as usize,
        ],
        pkcs7_der: trim_der_padding(skipped_bytes),
        obj_id,
        offset,
        field_id: field.id,
    })
}

/// Page and rectangle of a visible signature widget.
fn widget_annotation(
    doc: &Document,
    field_id: ObjectId,
    field: &Dictionary,
) -> Result<Option<Annotation>> {
    let Ok(rect) = field.get(b"Rect") else {
        return Ok(None);
    };
    let rect = read_rect(doc, rect)?;
    if rect[2] - rect[0] <= 0.0 || rect[3] - rect[1] <= 0.0 {
        return Ok(None);
    }

    let page_ref = field.get(b"P").and_then(Object::as_reference).ok();
    for (page_idx, page_id) in doc.get_pages().into_values().enumerate() {
        let on_page = match page_ref {
            Some(p) => p == page_id,
            None => doc
                .get_dictionary(page_id)?
                .get_deref(b"Annots", doc)
                .and_then(Object::as_array)
                .is_ok_and(|annots| annots.contains(&Object::Reference(field_id))),
        };
        if on_page {
            return Ok(Some(Annotation { page_idx, rect }));
        }
    }

    Ok(None)
}

/// Drops the zero padding after a DER encoded value.
fn trim_der_padding(mut bytes: Vec<u8>) -> Vec<u8> {
    let Some(&first_len) = bytes.get(1) else {
        return bytes;
    };
    let (header, len) = if first_len < 0x80 {
        (2, first_len as usize)
    } else {
        let count = (first_len & 0x7f) as usize;
        if count == 0 || count > 4 || bytes.len() < 2 + count {
            return bytes;
        }
        let len = bytes[2..2 + count]
            .iter()
            .fold(0usize, |acc, &b| acc << 8 | b as usize);
        (2 + count, len)
    };
    if header + len <= bytes.len() {
        bytes.truncate(header + len);
    }
    bytes
}
