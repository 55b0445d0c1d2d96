//! Builds template documents holding empty signature fields.
//!
//! Building happens in two phases: [`FormBuilder::layout_placeholders`]
//! computes where every label row and signature cell goes, and
//! [`FormBuilder::build`] binds the field names to that geometry and emits
//! the PDF objects.

use std::{collections::HashSet, fs, path::Path};

use anyhow::Result;
use lopdf::{
    content::{Content, Operation},
    dictionary, text_string, Document, Object, ObjectId, Stream, StringFormat,
};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Axis aligned rectangle in PDF user space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub llx: f32,
    pub lly: f32,
    pub urx: f32,
    pub ury: f32,
}

impl Rect {
    pub fn new(llx: f32, lly: f32, urx: f32, ury: f32) -> Self {
        Self { llx, lly, urx, ury }
    }

    pub fn width(&self) -> f32 {
        self.urx - self.llx
    }

    pub fn height(&self) -> f32 {
        self.ury - self.lly
    }

    /// Zero area rectangles mark invisible signature widgets.
    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn to_object(self) -> Object {
        Object::Array(vec![
            Object::Real(self.llx),
            Object::Real(self.lly),
            Object::Real(self.urx),
            Object::Real(self.ury),
        ])
    }
}

impl From<[f32; 4]> for Rect {
    fn from([llx, lly, urx, ury]: [f32; 4]) -> Self {
        Self::new(llx, lly, urx, ury)
    }
}

/// Page geometry of the signature table. All values in points. Missing
/// values take their [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormLayout {
    pub page_width: f32,
    pub page_height: f32,
    pub margin: f32,
    pub label_height: f32,
    pub field_height: f32,
    pub font_size: f32,
}

impl Default for FormLayout {
    /// A4 page, 36pt margins, 50pt signature cells.
    fn default() -> Self {
        Self {
            page_width: 595.0,
            page_height: 842.0,
            margin: 36.0,
            label_height: 20.0,
            field_height: 50.0,
            font_size: 12.0,
        }
    }
}

/// Geometry of one table row: the label cell above the signature cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub page_index: usize,
    pub label_cell: Rect,
    pub field_cell: Rect,
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    label: String,
}

#[derive(Debug, Clone, Default)]
pub struct FormBuilder {
    layout: FormLayout,
    fields: Vec<FieldSpec>,
}

impl FormBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(layout: FormLayout) -> Self {
        Self {
            layout,
            fields: Vec::new(),
        }
    }

    /// Appends a signature field with the text shown above it.
    pub fn field(mut self, name: impl Into<String>, label: impl Into<String>) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            label: label.into(),
        });
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// First phase: one placeholder per field, in field order, flowing onto
    /// a new page when the current one is full.
    pub fn layout_placeholders(&self) -> Vec<Placeholder> {
        let l = &self.layout;
        let row_height = l.label_height + l.field_height;
        let mut placeholders = Vec::with_capacity(self.fields.len());

        let mut page_index = 0;
        let mut rows_on_page = 0;
        let mut top = l.page_height - l.margin;
        for _ in &self.fields {
            if rows_on_page > 0 && top - row_height < l.margin {
                page_index += 1;
                rows_on_page = 0;
                top = l.page_height - l.margin;
            }

            let label_bottom = top - l.label_height;
            let field_bottom = label_bottom - l.field_height;
            placeholders.push(Placeholder {
                page_index,
                label_cell: Rect::new(l.margin, label_bottom, l.page_width - l.margin, top),
                field_cell: Rect::new(
                    l.margin,
                    field_bottom,
                    l.page_width - l.margin,
                    label_bottom,
                ),
            });

            rows_on_page += 1;
            top = field_bottom;
        }

        placeholders
    }

    /// Second phase: binds the field names to the computed geometry.
    pub fn build(&self) -> Result<Document> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::DuplicateField(field.name.clone()).into());
            }
        }

        let placeholders = self.layout_placeholders();
        let page_count = placeholders.last().map_or(1, |p| p.page_index + 1);

        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut kids = Vec::with_capacity(page_count);
        let mut field_refs = Vec::with_capacity(self.fields.len());
        for page_index in 0..page_count {
            let page_id = doc.new_object_id();
            let rows: Vec<(&FieldSpec, &Placeholder)> = self
                .fields
                .iter()
                .zip(&placeholders)
                .filter(|(_, p)| p.page_index == page_index)
                .collect();

            let content = self.page_content(&rows);
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));

            let mut annots = Vec::with_capacity(rows.len());
            for (spec, placeholder) in &rows {
                let widget_id = add_signature_widget(&mut doc, spec, placeholder, page_id);
                annots.push(Object::Reference(widget_id));
                field_refs.push(Object::Reference(widget_id));
            }

            doc.objects.insert(
                page_id,
                Object::Dictionary(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "Contents" => content_id,
                    "Annots" => annots,
                }),
            );
            kids.push(Object::Reference(page_id));
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
                "Resources" => resources_id,
                "MediaBox" => Rect::new(0.0, 0.0, self.layout.page_width, self.layout.page_height).to_object(),
            }),
        );

        let acro_form_id = doc.add_object(dictionary! {
            "Fields" => field_refs,
        });
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
            "AcroForm" => acro_form_id,
        });
        doc.trailer.set("Root", catalog_id);

        Ok(doc)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut doc = self.build()?;
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)?;
        Ok(bytes)
    }

    /// Writes the template, creating the parent directory if needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        log::info!(
            "wrote signature form {} with {} field(s)",
            path.display(),
            self.fields.len()
        );
        Ok(())
    }

    /// Cell borders and labels of the rows placed on one page.
    fn page_content(&self, rows: &[(&FieldSpec, &Placeholder)]) -> Content {
        let mut operations = vec![Operation::new("w", vec![Object::Real(0.5)])];
        for (spec, placeholder) in rows {
            for cell in [placeholder.label_cell, placeholder.field_cell] {
                operations.push(Operation::new(
                    "re",
                    vec![
                        Object::Real(cell.llx),
                        Object::Real(cell.lly),
                        Object::Real(cell.width()),
                        Object::Real(cell.height()),
                    ],
                ));
                operations.push(Operation::new("S", vec![]));
            }

            let label = placeholder.label_cell;
            let baseline = label.lly + (label.height() - self.layout.font_size) / 2.0 + 2.0;
            operations.extend([
                Operation::new("BT", vec![]),
                Operation::new(
                    "Tf",
                    vec!["F1".into(), Object::Real(self.layout.font_size)],
                ),
                Operation::new(
                    "Td",
                    vec![Object::Real(label.llx + 4.0), Object::Real(baseline)],
                ),
                Operation::new("Tj", vec![win_ansi_text(&spec.label)]),
                Operation::new("ET", vec![]),
            ]);
        }
        Content { operations }
    }
}

/// Operand for `Tj` with a standard 14 font in `/WinAnsiEncoding`.
/// Printable Latin-1 maps onto the same codes; anything else becomes `?`.
pub(crate) fn win_ansi_text(text: &str) -> Object {
    let bytes = text
        .chars()
        .map(|c| match u32::from(c) {
            code @ (0x20..=0x7e | 0xa0..=0xff) => code as u8,
            _ => b'?',
        })
        .collect();
    Object::String(bytes, StringFormat::Literal)
}

/// Merged field/widget dictionary, the way single-widget signature fields
/// are usually written.
fn add_signature_widget(
    doc: &mut Document,
    spec: &FieldSpec,
    placeholder: &Placeholder,
    page_id: ObjectId,
) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Sig",
        "T" => text_string(&spec.name),
        "Rect" => placeholder.field_cell.to_object(),
        // Print
        "F" => 4,
        // Invert highlighting
        "H" => "I",
        "P" => page_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{inspect, sign, testing::FakeSigner, CertificationLevel, SignRequest, SigningConfig};

    fn three_signers() -> FormBuilder {
        FormBuilder::new()
            .field("sig1", "Signer 1: Alice")
            .field("sig2", "Signer 2: Bob")
            .field("sig3", "Signer 3: Carol")
    }

    #[test]
    fn template_lists_every_field_unsigned() {
        let bytes = three_signers().to_bytes().unwrap();
        let signed = inspect(&bytes).unwrap();
        assert!(signed.signatures.is_empty());
        assert_eq!(signed.unsigned_fields, ["sig1", "sig2", "sig3"]);
    }

    #[test]
    fn building_twice_is_byte_identical() {
        let first = three_signers().to_bytes().unwrap();
        let second = three_signers().to_bytes().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rows_stack_downwards_without_overlap() {
        let placeholders = three_signers().layout_placeholders();
        assert_eq!(placeholders.len(), 3);
        assert_eq!(placeholders[0].label_cell.ury, 842.0 - 36.0);
        for pair in placeholders.windows(2) {
            assert_eq!(pair[0].field_cell.lly, pair[1].label_cell.ury);
            assert_eq!(pair[1].field_cell.height(), 50.0);
        }
    }

    #[test]
    fn long_forms_flow_onto_new_pages() {
        let builder = (1..=12).fold(FormBuilder::new(), |b, i| {
            b.field(format!("sig{i}"), format!("Signer {i}"))
        });
        let placeholders = builder.layout_placeholders();
        assert_eq!(placeholders[10].page_index, 0);
        assert_eq!(placeholders[11].page_index, 1);
        assert_eq!(placeholders[11].label_cell.ury, 842.0 - 36.0);

        let doc = builder.build().unwrap();
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = FormBuilder::new()
            .field("sig1", "a")
            .field("sig1", "b")
            .build()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::DuplicateField(name)) if name == "sig1"
        ));
    }

    #[test]
    fn non_ascii_names_are_found_and_signed() {
        let name = "Unterschrift_Jürgen";
        let bytes = FormBuilder::new()
            .field(name, "Jürgen Müller ✓")
            .to_bytes()
            .unwrap();
        assert_eq!(inspect(&bytes).unwrap().unsigned_fields, [name]);

        let doc = Document::load_mem(&bytes).unwrap();
        let page_id = doc.get_pages()[&1];
        let content = Content::decode(&doc.get_page_content(page_id).unwrap()).unwrap();
        let shown: Vec<&[u8]> = content
            .operations
            .iter()
            .filter(|op| op.operator == "Tj")
            .map(|op| op.operands[0].as_str().unwrap())
            .collect();
        assert_eq!(shown, [b"J\xfcrgen M\xfcller ?".as_slice()]);

        let config = SigningConfig::default();
        let request = SignRequest::new(name, CertificationLevel::NotCertified, &config);
        let signed = sign(&bytes, &request, &FakeSigner("Jürgen")).unwrap();
        let signed = inspect(&signed).unwrap();
        assert!(signed.unsigned_fields.is_empty());
        assert_eq!(signed.signatures[0].field_name, name);
        assert_eq!(signed.signatures[0].signer_name.as_deref(), Some("Jürgen"));
    }

    #[test]
    fn save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/form.pdf");
        three_signers().save(&path).unwrap();
        assert!(path.exists());
    }
}
