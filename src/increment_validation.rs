use crate::{inspect::SignatureInfo, read_rect};

use anyhow::Result;
use lopdf::{xref::XrefEntry, Dictionary, Document, Object, ObjectId};
use std::{
    cell::RefCell,
    collections::HashMap,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("mismatch between /Catalog dictionaries")]
    CatalogMismatch,
    #[error("/Perms changed without a certification signature")]
    PermsMismatch,
    #[error("mismatch between /AcroForm dictionaries")]
    AcroFormMismatch,
    #[error("array has more than one extra reference")]
    NotSingleArrayIncrement,
    #[error("multiple pages changed in the increment")]
    MultiplePagesChanged,
    #[error("mismatch between /Page dictionaries")]
    PageMismatch,
    #[error("invalid annotation")]
    InvalidAnnotation,
    #[error("signature field was changed beyond its value and appearance")]
    FieldMismatch,
    #[error("signature field already had a value")]
    FieldHadValue,
    #[error("signature dictionary was modified")]
    SignatureModified,
    #[error("wrong SigFlags value")]
    WrongSigFlags,
    #[error("mismatch between xref tables")]
    XrefMismatch,
}

/// Read access to the previous version of the document that remembers every
/// object it handed out. Only those objects may differ in the new version.
struct DocTracker<'a> {
    visited: RefCell<HashMap<u32, u16>>,
    doc: &'a Document,
}

impl<'a> DocTracker<'a> {
    fn new(doc: &'a Document) -> Self {
        DocTracker {
            visited: RefCell::default(),
            doc,
        }
    }

    fn catalog(&self) -> Result<DictTracker<'_>> {
        self.deref_dict(self.doc.trailer.get(b"Root")?)
    }

    fn get(&self, id: ObjectId) -> Result<&'a Object> {
        match self.visited.borrow_mut().insert(id.0, id.1) {
            Some(generation) if generation != id.1 => {
                Err(lopdf::Error::ObjectIdMismatch.into())
            }
            _ => Ok(self.doc.get_object(id)?),
        }
    }

    /// Follows a single reference. Direct objects are returned as they are.
    fn deref(&self, obj: &'a Object) -> Result<&'a Object> {
        match obj {
            Object::Reference(id) => self.get(*id),
            _ => Ok(obj),
        }
    }

    fn deref_dict(&self, obj: &'a Object) -> Result<DictTracker<'_>> {
        Ok(DictTracker {
            tracker: self,
            dict: self.deref(obj)?.as_dict()?,
        })
    }

    /// Every xref entry of the previous document that was never visited must
    /// be present, unchanged, in `curr_doc`.
    fn only_visited_objects_changed(self, curr_doc: &Document) -> Result<()> {
        let visited = self.visited.into_inner();
        let curr_entries = &curr_doc.reference_table.entries;

        let untouched = self
            .doc
            .reference_table
            .entries
            .iter()
            .filter(|(id, _)| !visited.contains_key(*id));
        for (id, entry) in untouched {
            match curr_entries.get(id) {
                Some(curr_entry) if same_xref_entry(entry, curr_entry) => (),
                _ => return Err(Error::XrefMismatch.into()),
            }
        }
        Ok(())
    }
}

struct DictTracker<'a> {
    tracker: &'a DocTracker<'a>,
    dict: &'a Dictionary,
}

/// Looks up `key` in a dictionary of the previous document and tracks the
/// dictionary it leads to.
fn tracked_entry<'a>(
    tracker: &'a DocTracker<'a>,
    dict: &'a Dictionary,
    key: &[u8],
) -> Result<Option<DictTracker<'a>>> {
    match dict.get(key) {
        Ok(obj) => Ok(Some(tracker.deref_dict(obj)?)),
        Err(_) => Ok(None),
    }
}

fn same_xref_entry(a: &XrefEntry, b: &XrefEntry) -> bool {
    use XrefEntry::*;

    match (a, b) {
        (
            Normal { offset, generation },
            Normal {
                offset: b_offset,
                generation: b_generation,
            },
        ) => offset == b_offset && generation == b_generation,
        (
            Compressed { container, index },
            Compressed {
                container: b_container,
                index: b_index,
            },
        ) => container == b_container && index == b_index,
        (Free, Free) | (UnusableFree, UnusableFree) => true,
        _ => false,
    }
}

/// Page and rectangle of a signature widget.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub page_idx: usize,
    pub rect: [f32; 4],
}

/// Checks that the increment between `previous_doc` and `curr_doc` does
/// nothing but fill the signature field of `curr_sig`: it may set the field
/// value and appearance, add the field itself as a new widget on one page,
/// and register a DocMDP certification. Every other object must be untouched.
///
/// Returns the widget annotation added to a page, if the field is new.
pub fn verify_increment(
    curr_sig: &SignatureInfo,
    curr_doc: &Document,
    previous_doc: &Document,
) -> Result<Option<Annotation>> {
    // The signature object must be the one found at the offset it was read from.
    let expected_entry = XrefEntry::Normal {
        offset: curr_sig.offset,
        generation: curr_sig.obj_id.1,
    };
    match curr_doc.reference_table.entries.get(&curr_sig.obj_id.0) {
        Some(entry) if same_xref_entry(entry, &expected_entry) => (),
        _ => return Err(Error::SignatureModified.into()),
    }

    let previous = DocTracker::new(previous_doc);
    let annotation = verify_catalogs(curr_sig, curr_doc, &previous)?;
    previous.only_visited_objects_changed(curr_doc)?;

    Ok(annotation)
}

fn verify_catalogs(
    curr_sig: &SignatureInfo,
    curr_doc: &Document,
    previous_doc: &DocTracker,
) -> Result<Option<Annotation>> {
    let curr_catalog = curr_doc.catalog()?;
    let prev_catalog = previous_doc.catalog()?;

    let prev_acro_form = tracked_entry(previous_doc, prev_catalog.dict, b"AcroForm")?;
    let prev_perms = tracked_entry(previous_doc, prev_catalog.dict, b"Perms")?;

    // Everything but /AcroForm and /Perms must be identical.
    let is_fixed = |key: &Vec<u8>| !matches!(key.as_slice(), b"AcroForm" | b"Perms");
    let prev_fixed: Vec<_> = prev_catalog.dict.iter().filter(|(key, _)| is_fixed(*key)).collect();
    let curr_fixed = curr_catalog.iter().filter(|(key, _)| is_fixed(*key)).count();
    if curr_fixed != prev_fixed.len()
        || prev_fixed
            .iter()
            .any(|(key, obj)| curr_catalog.get(key).ok() != Some(*obj))
    {
        return Err(Error::CatalogMismatch.into());
    }

    verify_perms(curr_sig, curr_doc, curr_catalog, prev_perms)?;

    // Current catalog must have an AcroForm dictionary.
    let new_field = verify_acro_forms(
        curr_doc,
        curr_doc.get_dict_in_dict(curr_catalog, b"AcroForm")?,
        prev_acro_form,
        curr_sig.field_id,
    )?;
    verify_signed_field(curr_doc, previous_doc, curr_sig, new_field.is_some())?;

    // The page tree is never visited, so it must be untouched. A single page
    // may still gain the widget of a new field.
    verify_pages(curr_doc, previous_doc, new_field)
}

/// A certification signature registers itself in `/Perms /DocMDP`. Any
/// other signature leaves `/Perms` alone.
fn verify_perms(
    curr_sig: &SignatureInfo,
    curr_doc: &Document,
    curr_catalog: &Dictionary,
    prev_perms: Option<DictTracker>,
) -> Result<()> {
    let curr_perms = match curr_catalog.get_deref(b"Perms", curr_doc) {
        Ok(perms) => Some(perms.as_dict()?),
        Err(lopdf::Error::DictKey) => None,
        Err(e) => return Err(e.into()),
    };

    if !curr_sig.certification.is_certification() {
        return match (curr_perms, prev_perms) {
            (None, None) => Ok(()),
            (Some(curr), Some(prev)) if curr == prev.dict => Ok(()),
            _ => Err(Error::PermsMismatch.into()),
        };
    }

    let curr_perms = curr_perms.ok_or(Error::PermsMismatch)?;
    if curr_perms.get(b"DocMDP")?.as_reference()? != curr_sig.obj_id {
        return Err(Error::PermsMismatch.into());
    }
    let prev_len = match prev_perms {
        Some(prev) => {
            for (key, obj) in prev.dict.iter() {
                if key != b"DocMDP" && curr_perms.get(key).ok() != Some(obj) {
                    return Err(Error::PermsMismatch.into());
                }
            }
            prev.dict.len() - usize::from(prev.dict.has(b"DocMDP"))
        }
        None => 0,
    };
    if curr_perms.len() != prev_len + 1 {
        return Err(Error::PermsMismatch.into());
    }

    Ok(())
}

/// Returns the field added to `/Fields` by the increment, if any.
fn verify_acro_forms(
    curr_doc: &Document,
    curr_acro_form: &Dictionary,
    prev_acro_form: Option<DictTracker>,
    field_id: ObjectId,
) -> Result<Option<ObjectId>> {
    // Keys a signing increment may add.
    const ADDABLE: [&[u8]; 4] = [b"Fields", b"SigFlags", b"DA", b"DR"];

    let prev_dict = prev_acro_form.as_ref().map(|acro_form| acro_form.dict);
    let prev_fields = match &prev_acro_form {
        Some(acro_form) => match acro_form.dict.get(b"Fields") {
            Ok(fields) => Some(acro_form.tracker.deref(fields)?.as_array()?),
            Err(_) => None,
        },
        None => None,
    };

    // Nothing is removed, and only /Fields and /SigFlags may be rewritten.
    for (key, obj) in prev_dict.into_iter().flat_map(Dictionary::iter) {
        let curr_obj = curr_acro_form.get(key).map_err(|_| Error::AcroFormMismatch)?;
        if !matches!(key.as_slice(), b"Fields" | b"SigFlags") && curr_obj != obj {
            return Err(Error::AcroFormMismatch.into());
        }
    }
    for (key, _) in curr_acro_form.iter() {
        let existed = prev_dict.is_some_and(|prev| prev.has(key));
        if !existed && !ADDABLE.contains(&key.as_slice()) {
            return Err(Error::AcroFormMismatch.into());
        }
    }

    if curr_acro_form.get(b"SigFlags")?.as_i64()? != 3 {
        return Err(Error::WrongSigFlags.into());
    }

    let curr_fields = curr_acro_form.get_deref(b"Fields", curr_doc)?.as_array()?;
    match array_increment(curr_fields, prev_fields)? {
        // The only field allowed to be added is the signed one.
        Some(extra) if extra != field_id => Err(Error::AcroFormMismatch.into()),
        extra => Ok(extra),
    }
}

/// Verifies the form field which contains the signature. A field that existed
/// before may only gain its value and appearance.
fn verify_signed_field(
    curr_doc: &Document,
    prev_doc: &DocTracker,
    curr_sig: &SignatureInfo,
    is_new: bool,
) -> Result<()> {
    let field = curr_doc.get_dictionary(curr_sig.field_id)?;

    // check /V is the reference signature id
    if field.get(b"V")?.as_reference()? != curr_sig.obj_id {
        return Err(Error::FieldMismatch.into());
    }

    if is_new {
        if field.get_deref(b"FT", curr_doc)?.as_name()? != b"Sig" {
            return Err(Error::FieldMismatch.into());
        }
        return Ok(());
    }

    let prev_field = prev_doc.get(curr_sig.field_id)?.as_dict()?;
    if prev_field.has(b"V") {
        return Err(Error::FieldHadValue.into());
    }

    let mut expected_len = prev_field.len() + 1;
    for (key, obj) in prev_field.iter() {
        if key == b"AP" {
            continue;
        }
        if field.get(key).ok() != Some(obj) {
            return Err(Error::FieldMismatch.into());
        }
    }
    if !prev_field.has(b"AP") && field.has(b"AP") {
        expected_len += 1;
    }
    if field.len() != expected_len {
        return Err(Error::FieldMismatch.into());
    }

    Ok(())
}

/// Compares two arrays of references, ignoring their order.
///
/// Returns `None` if both hold the same references, the extra element if
/// `curr_refs` holds exactly one more, and Err in any other case.
fn array_increment(
    curr_refs: &[Object],
    prev_refs: Option<&Vec<Object>>,
) -> Result<Option<ObjectId>> {
    let mut unmatched: HashMap<ObjectId, usize> = HashMap::new();
    for obj in prev_refs.into_iter().flatten() {
        *unmatched.entry(obj.as_reference()?).or_default() += 1;
    }

    let mut extra = None;
    for obj in curr_refs {
        let id = obj.as_reference()?;
        match unmatched.get_mut(&id) {
            Some(count) if *count > 0 => *count -= 1,
            _ if extra.is_none() => extra = Some(id),
            _ => return Err(Error::NotSingleArrayIncrement.into()),
        }
    }

    if unmatched.values().any(|&count| count > 0) {
        return Err(Error::NotSingleArrayIncrement.into());
    }
    Ok(extra)
}

fn verify_pages(
    curr_doc: &Document,
    prev_doc: &DocTracker,
    new_field: Option<ObjectId>,
) -> Result<Option<Annotation>> {
    let mut added = None;

    for (page_idx, page_id) in curr_doc.get_pages().into_values().enumerate() {
        if !xref_entry_changed(curr_doc, prev_doc.doc, page_id)? {
            continue;
        }
        if added.is_some() {
            return Err(Error::MultiplePagesChanged.into());
        }
        // Only a brand new field justifies touching a page.
        let new_field = new_field.ok_or(Error::PageMismatch)?;
        added = Some(Annotation {
            page_idx,
            rect: verify_page(curr_doc, page_id, prev_doc, new_field)?,
        });
    }

    Ok(added)
}

fn xref_entry_changed(curr_doc: &Document, prev_doc: &Document, id: ObjectId) -> Result<bool> {
    match (
        curr_doc.reference_table.entries.get(&id.0),
        prev_doc.reference_table.entries.get(&id.0),
    ) {
        (Some(curr), Some(prev)) => Ok(!same_xref_entry(curr, prev)),
        _ => Err(lopdf::Error::ObjectNotFound.into()),
    }
}

/// A page may only gain `new_field` in its `/Annots`.
fn verify_page(
    curr_doc: &Document,
    page_id: ObjectId,
    prev_doc: &DocTracker,
    new_field: ObjectId,
) -> Result<[f32; 4]> {
    let curr_page = curr_doc.get_dictionary(page_id)?;
    let prev_page = prev_doc.get(page_id)?.as_dict()?;

    let prev_annots = match prev_page.get(b"Annots") {
        Ok(annots) => Some(prev_doc.deref(annots)?.as_array()?),
        Err(_) => None,
    };
    for (key, obj) in prev_page.iter().filter(|(key, _)| key.as_slice() != b"Annots") {
        if curr_page.get(key).ok() != Some(obj) {
            return Err(Error::PageMismatch.into());
        }
    }
    if curr_page.len() != prev_page.len() + usize::from(prev_annots.is_none()) {
        return Err(Error::PageMismatch.into());
    }

    let curr_annots = curr_page.get_deref(b"Annots", curr_doc)?.as_array()?;
    if array_increment(curr_annots, prev_annots)? != Some(new_field) {
        return Err(Error::PageMismatch.into());
    }

    verify_annotation(curr_doc, page_id, new_field)
}

/// Checks the new field is a widget of `page_id` and returns its rectangle.
fn verify_annotation(doc: &Document, page_id: ObjectId, annot_id: ObjectId) -> Result<[f32; 4]> {
    let dict = doc.get_dictionary(annot_id)?;

    // Optional /Type and /P must agree when present.
    match dict.get_deref(b"Type", doc) {
        Ok(obj) => {
            if obj.as_name()? != b"Annot".as_slice() {
                return Err(Error::InvalidAnnotation.into());
            }
        }
        Err(lopdf::Error::DictKey) => (),
        Err(e) => return Err(e.into()),
    };

    if let Ok(p) = dict.get(b"P") {
        if p.as_reference()? != page_id {
            return Err(Error::InvalidAnnotation.into());
        }
    }

    if dict.get_deref(b"Subtype", doc)?.as_name()? != b"Widget".as_slice() {
        return Err(Error::InvalidAnnotation.into());
    }

    read_rect(doc, dict.get(b"Rect")?)
}
