//! The signing primitive: one signature, appended as an incremental update.

use anyhow::Result;
use chrono::{DateTime, Utc};
use lopdf::{
    content::{Content, Operation},
    dictionary, text_string, Dictionary, Document, Object, ObjectId, Stream,
};

use crate::{
    form::{win_ansi_text, Rect},
    inspect::{find_field, inspect_document},
    last_startxref, pdf_ends_with_eof, read_rect,
    writer::{format_byte_range, IncrementalWriter, XrefFormat},
    CertificationLevel, Error, Pkcs7Signer, SignatureMetadata, SigningConfig,
};

/// What to sign and how.
#[derive(Debug, Clone)]
pub struct SignRequest<'a> {
    /// Fully qualified name of the signature field to fill.
    pub field_name: &'a str,
    pub certification: CertificationLevel,
    pub metadata: &'a SignatureMetadata,
    pub signing_time: DateTime<Utc>,
    /// Bytes reserved for the PKCS #7 signature.
    pub contents_reserve: usize,
    /// Add an invisible field on the first page when `field_name` is unknown.
    pub create_missing_field: bool,
}

impl<'a> SignRequest<'a> {
    pub fn new(
        field_name: &'a str,
        certification: CertificationLevel,
        config: &'a SigningConfig,
    ) -> Self {
        Self {
            field_name,
            certification,
            metadata: &config.metadata,
            signing_time: config.signing_time.unwrap_or_else(Utc::now),
            contents_reserve: config.contents_reserve,
            create_missing_field: config.create_missing_fields,
        }
    }
}

/// Hands out object numbers past the end of the existing document.
struct ObjectIds(u32);

impl ObjectIds {
    fn for_document(doc: &Document) -> Self {
        let size = doc
            .trailer
            .get(b"Size")
            .and_then(Object::as_i64)
            .unwrap_or(0)
            .max(0) as u32;
        Self(size.max(doc.max_id + 1))
    }

    fn next(&mut self) -> ObjectId {
        let id = (self.0, 0);
        self.0 += 1;
        id
    }
}

/// Signs `source` into a new document made of `source` followed by an
/// incremental update holding the signature.
///
/// The source bytes are never modified. Policy violations (a document
/// certified with no changes allowed, a second certification, an already
/// signed field) are reported as distinct [`Error`] variants.
pub fn sign(source: &[u8], request: &SignRequest, signer: &impl Pkcs7Signer) -> Result<Vec<u8>> {
    if !pdf_ends_with_eof(source) {
        return Err(Error::InvalidSourceDocument.into());
    }
    let prev_xref = last_startxref(source).ok_or(Error::InvalidSourceDocument)?;

    let doc = Document::load_mem(source)?;
    let state = inspect_document(&doc, source)?;

    if state.certification_level == CertificationLevel::CertifiedNoChangesAllowed {
        return Err(Error::DocumentLocked.into());
    }
    if request.certification.is_certification() && state.certification_level.is_certification() {
        return Err(Error::AlreadyCertified.into());
    }

    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|_| Error::MissingCatalog)?;
    let mut catalog = doc.get_dictionary(catalog_id)?.clone();
    let mut catalog_changed = false;

    let mut ids = ObjectIds::for_document(&doc);
    let sig_id = ids.next();

    let (field_id, mut field, new_field_page) = match find_field(&doc, request.field_name)? {
        Some(f) if !f.is_signature => {
            return Err(Error::NotASignatureField(request.field_name.to_owned()).into())
        }
        Some(f) if f.dict.has(b"V") => {
            return Err(Error::FieldAlreadySigned(request.field_name.to_owned()).into())
        }
        Some(f) => (f.id, f.dict.clone(), None),
        None if request.create_missing_field => {
            let page_id = *doc.get_pages().values().next().ok_or(Error::NoPages)?;
            let field = dictionary! {
                "Type" => "Annot",
                "Subtype" => "Widget",
                "FT" => "Sig",
                "T" => text_string(request.field_name),
                "Rect" => Rect::new(0.0, 0.0, 0.0, 0.0).to_object(),
                "F" => 4,
                "P" => page_id,
            };
            (ids.next(), field, Some(page_id))
        }
        None => return Err(Error::FieldNotFound(request.field_name.to_owned()).into()),
    };

    let signer_name = request
        .metadata
        .signer_name
        .as_deref()
        .unwrap_or_else(|| signer.signer_name());

    field.set("V", sig_id);
    let visible_rect = match field.get(b"Rect") {
        Ok(rect) => Some(Rect::from(read_rect(&doc, rect)?)).filter(|r| !r.is_empty()),
        Err(_) => None,
    };
    let appearance = match visible_rect {
        Some(rect) => {
            let ap_id = ids.next();
            field.set("AP", dictionary! { "N" => ap_id });
            Some((ap_id, appearance_stream(rect, signer_name, request)?))
        }
        None => None,
    };

    let (acro_form_id, mut acro_form) = match catalog.get(b"AcroForm") {
        Ok(Object::Reference(id)) => (*id, doc.get_dictionary(*id)?.clone()),
        Ok(obj) => {
            let acro_form = obj.as_dict()?.clone();
            (ids.next(), acro_form)
        }
        Err(_) => (ids.next(), Dictionary::new()),
    };
    if !matches!(catalog.get(b"AcroForm"), Ok(Object::Reference(_))) {
        catalog.set("AcroForm", acro_form_id);
        catalog_changed = true;
    }
    acro_form.set("SigFlags", 3);
    if new_field_page.is_some() {
        let mut fields = match acro_form.get_deref(b"Fields", &doc) {
            Ok(fields) => fields.as_array()?.clone(),
            Err(_) => Vec::new(),
        };
        fields.push(Object::Reference(field_id));
        acro_form.set("Fields", fields);
    }

    let page = match new_field_page {
        Some(page_id) => {
            let mut page = doc.get_dictionary(page_id)?.clone();
            let mut annots = match page.get_deref(b"Annots", &doc) {
                Ok(annots) => annots.as_array()?.clone(),
                Err(_) => Vec::new(),
            };
            annots.push(Object::Reference(field_id));
            page.set("Annots", annots);
            Some((page_id, page))
        }
        None => None,
    };

    let mut signature = dictionary! {
        "Type" => "Sig",
        "Filter" => "Adobe.PPKLite",
        "SubFilter" => "adbe.pkcs7.detached",
        "Name" => text_string(signer_name),
        "M" => Object::string_literal(pdf_date(request.signing_time)),
    };
    let metadata = request.metadata;
    for (key, value) in [
        ("Reason", &metadata.reason),
        ("Location", &metadata.location),
        ("ContactInfo", &metadata.contact_info),
    ] {
        if let Some(value) = value {
            signature.set(key, text_string(value));
        }
    }
    if let Some(permission) = request.certification.docmdp_permission() {
        signature.set(
            "Reference",
            vec![Object::Dictionary(dictionary! {
                "Type" => "SigRef",
                "TransformMethod" => "DocMDP",
                "TransformParams" => dictionary! {
                    "Type" => "TransformParams",
                    "P" => permission,
                    "V" => "1.2",
                },
            })],
        );

        let mut perms = match catalog.get_deref(b"Perms", &doc) {
            Ok(perms) => perms.as_dict()?.clone(),
            Err(_) => Dictionary::new(),
        };
        perms.set("DocMDP", sig_id);
        catalog.set("Perms", perms);
        catalog_changed = true;
    }

    let mut writer = IncrementalWriter::new(source);
    let placeholder =
        writer.write_signature_object(sig_id, &signature, request.contents_reserve)?;
    writer.write_object(field_id, &Object::Dictionary(field))?;
    if let Some((ap_id, stream)) = appearance {
        writer.write_object(ap_id, &Object::Stream(stream))?;
    }
    writer.write_object(acro_form_id, &Object::Dictionary(acro_form))?;
    if catalog_changed {
        writer.write_object(catalog_id, &Object::Dictionary(catalog))?;
    }
    if let Some((page_id, page)) = page {
        writer.write_object(page_id, &Object::Dictionary(page))?;
    }

    let xref_format = XrefFormat::following(&doc, || ids.next());
    let mut trailer = dictionary! {
        "Size" => Object::Integer(ids.0 as i64),
        "Root" => catalog_id,
    };
    for key in [b"Info".as_slice(), b"ID"] {
        if let Ok(value) = doc.trailer.get(key) {
            trailer.set(key, value.clone());
        }
    }
    let mut out = writer.finish(trailer, prev_xref, xref_format)?;

    let contents = placeholder.contents;
    let byte_range = format_byte_range([
        0,
        contents.start,
        contents.end,
        out.len() - contents.end,
    ])
    .ok_or(Error::InvalidRange)?;
    out[placeholder.byte_range].copy_from_slice(&byte_range);

    let pkcs7 = signer.sign([&out[..contents.start], &out[contents.end..]])?;
    if pkcs7.len() > request.contents_reserve {
        return Err(Error::SignatureTooLarge {
            needed: pkcs7.len(),
            reserved: request.contents_reserve,
        }
        .into());
    }
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let hex_start = contents.start + 1;
    for (i, byte) in pkcs7.iter().enumerate() {
        out[hex_start + 2 * i] = HEX[(byte >> 4) as usize];
        out[hex_start + 2 * i + 1] = HEX[(byte & 0xf) as usize];
    }

    log::info!(
        "{signer_name} signed field {:?} ({:?}), {} bytes appended",
        request.field_name,
        request.certification,
        out.len() - source.len()
    );
    Ok(out)
}

/// PDF date string in UTC, e.g. `D:20200102030405+00'00'`.
fn pdf_date(time: DateTime<Utc>) -> String {
    format!("D:{}+00'00'", time.format("%Y%m%d%H%M%S"))
}

/// Appearance of a visible signature: who signed, when, and why.
fn appearance_stream(rect: Rect, signer_name: &str, request: &SignRequest) -> Result<Stream> {
    let font_size = (rect.height() / 4.0).clamp(6.0, 12.0);

    let mut lines = vec![
        format!("Digitally signed by {signer_name}"),
        format!(
            "Date: {}",
            request.signing_time.format("%Y.%m.%d %H:%M:%S UTC")
        ),
    ];
    if let Some(reason) = &request.metadata.reason {
        lines.push(format!("Reason: {reason}"));
    }
    if let Some(location) = &request.metadata.location {
        lines.push(format!("Location: {location}"));
    }

    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), Object::Real(font_size)]),
        Operation::new("TL", vec![Object::Real(font_size * 1.2)]),
        Operation::new(
            "Td",
            vec![
                Object::Real(2.0),
                Object::Real(rect.height() - font_size - 2.0),
            ],
        ),
    ];
    for line in lines {
        operations.push(Operation::new("Tj", vec![win_ansi_text(&line)]));
        operations.push(Operation::new("T*", vec![]));
    }
    operations.push(Operation::new("ET", vec![]));

    let content = Content { operations }.encode()?;
    Ok(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => Rect::new(0.0, 0.0, rect.width(), rect.height()).to_object(),
            "Resources" => dictionary! {
                "Font" => dictionary! {
                    "F1" => dictionary! {
                        "Type" => "Font",
                        "Subtype" => "Type1",
                        "BaseFont" => "Helvetica",
                        "Encoding" => "WinAnsiEncoding",
                    },
                },
            },
        },
        content,
    ))
}
