//! Incremental update writer.
//!
//! The original bytes are copied untouched and the new or replaced objects,
//! a cross-reference section and a trailer pointing back with `/Prev` are
//! appended after them. The cross-reference section is a classic table or a
//! stream, whichever the source document ended with.

use std::{io::Write, ops::Range};

use anyhow::Result;
use lopdf::{xref::XrefType, Dictionary, Document, Object, ObjectId, Stream, StringFormat};

/// Width of the `/ByteRange` placeholder. Each of the three patched values
/// gets ten digits, enough for files up to 10 GB.
const BYTE_RANGE_PLACEHOLDER: &[u8] = b"[0 0000000000 0000000000 0000000000]";

/// Where the signature dictionary keeps the values patched after writing.
#[derive(Debug, Clone)]
pub struct SignaturePlaceholder {
    pub byte_range: Range<usize>,
    /// Hex string `/Contents`, including the `<` and `>` delimiters.
    pub contents: Range<usize>,
}

/// Shape of the cross-reference section closing an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefFormat {
    /// `xref` table followed by a `trailer` dictionary.
    Table,
    /// Cross-reference stream stored as the given object. Its dictionary
    /// doubles as the trailer.
    Stream(ObjectId),
}

impl XrefFormat {
    /// Keeps the kind of section the last revision of `doc` used. The
    /// stream object id is only taken from `next_id` when needed.
    pub fn following(doc: &Document, next_id: impl FnOnce() -> ObjectId) -> Self {
        match doc.reference_table.cross_reference_type {
            XrefType::CrossReferenceStream => XrefFormat::Stream(next_id()),
            XrefType::CrossReferenceTable => XrefFormat::Table,
        }
    }
}

pub struct IncrementalWriter {
    out: Vec<u8>,
    entries: Vec<(ObjectId, usize)>,
}

impl IncrementalWriter {
    pub fn new(base: &[u8]) -> Self {
        let mut out = Vec::with_capacity(base.len() + 16 * 1024);
        out.extend_from_slice(base);
        if !matches!(out.last(), Some(b'\n' | b'\r')) {
            out.push(b'\n');
        }
        Self {
            out,
            entries: Vec::new(),
        }
    }

    pub fn write_object(&mut self, id: ObjectId, object: &Object) -> Result<()> {
        self.begin_object(id)?;
        write_object(&mut self.out, object)?;
        self.end_object()
    }

    /// Writes a signature dictionary whose `/ByteRange` and `/Contents` are
    /// reserved for later patching. `contents_reserve` is in bytes of
    /// signature, the hex string takes twice as much.
    pub fn write_signature_object(
        &mut self,
        id: ObjectId,
        dict: &Dictionary,
        contents_reserve: usize,
    ) -> Result<SignaturePlaceholder> {
        self.begin_object(id)?;
        self.out.extend_from_slice(b"<<");
        for (key, value) in dict.iter() {
            write_name(&mut self.out, key)?;
            self.out.push(b' ');
            write_object(&mut self.out, value)?;
        }

        self.out.extend_from_slice(b"/ByteRange ");
        let byte_range_start = self.out.len();
        self.out.extend_from_slice(BYTE_RANGE_PLACEHOLDER);
        let byte_range = byte_range_start..self.out.len();

        self.out.extend_from_slice(b"/Contents ");
        let contents_start = self.out.len();
        self.out.push(b'<');
        self.out.resize(self.out.len() + 2 * contents_reserve, b'0');
        self.out.push(b'>');
        let contents = contents_start..self.out.len();

        self.out.extend_from_slice(b">>");
        self.end_object()?;

        Ok(SignaturePlaceholder {
            byte_range,
            contents,
        })
    }

    /// Appends the cross-reference section and trailer. `trailer` must not
    /// carry `/Prev`, it is added here. With [`XrefFormat::Stream`],
    /// `trailer`'s `/Size` must already count the stream object.
    pub fn finish(
        mut self,
        mut trailer: Dictionary,
        prev_xref: usize,
        format: XrefFormat,
    ) -> Result<Vec<u8>> {
        let xref_start = self.out.len();
        if let XrefFormat::Stream(id) = format {
            self.entries.push((id, xref_start));
        }
        self.entries.sort_by_key(|(id, _)| *id);
        trailer.set("Prev", Object::Integer(prev_xref as i64));

        let subsections: Vec<&[(ObjectId, usize)]> = self
            .entries
            .chunk_by(|(a, _), (b, _)| a.0 + 1 == b.0)
            .collect();

        match format {
            XrefFormat::Table => {
                let mut table = b"xref\n".to_vec();
                for subsection in &subsections {
                    writeln!(table, "{} {}", subsection[0].0 .0, subsection.len())?;
                    for ((_, generation), offset) in subsection.iter() {
                        write!(table, "{offset:010} {generation:05} n\r\n")?;
                    }
                }
                table.extend_from_slice(b"trailer\n");
                write_object(&mut table, &Object::Dictionary(trailer))?;
                self.out.extend(table);
            }
            XrefFormat::Stream(id) => {
                // Type 1 entries: one byte type, four bytes offset, two bytes
                // generation.
                let mut index = Vec::with_capacity(2 * subsections.len());
                let mut rows = Vec::with_capacity(7 * self.entries.len());
                for subsection in &subsections {
                    index.push(Object::Integer(subsection[0].0 .0 as i64));
                    index.push(Object::Integer(subsection.len() as i64));
                    for ((_, generation), offset) in subsection.iter() {
                        rows.push(1);
                        rows.extend(u32::try_from(*offset)?.to_be_bytes());
                        rows.extend(generation.to_be_bytes());
                    }
                }
                trailer.set("Type", "XRef");
                trailer.set(
                    "W",
                    vec![Object::Integer(1), Object::Integer(4), Object::Integer(2)],
                );
                trailer.set("Index", index);

                write!(self.out, "{} {} obj\n", id.0, id.1)?;
                write_object(&mut self.out, &Object::Stream(Stream::new(trailer, rows)))?;
                self.end_object()?;
            }
        }
        write!(self.out, "\nstartxref\n{xref_start}\n%%EOF\n")?;

        log::debug!(
            "increment of {} object(s), {:?} cross-reference section at offset {xref_start}",
            self.entries.len(),
            format
        );
        Ok(self.out)
    }

    fn begin_object(&mut self, id: ObjectId) -> Result<()> {
        self.entries.push((id, self.out.len()));
        write!(self.out, "{} {} obj\n", id.0, id.1)?;
        Ok(())
    }

    fn end_object(&mut self) -> Result<()> {
        self.out.extend_from_slice(b"\nendobj\n");
        Ok(())
    }
}

/// Formats the `/ByteRange` array padded with spaces to the placeholder
/// width.
pub fn format_byte_range(range: [usize; 4]) -> Option<Vec<u8>> {
    let mut formatted =
        format!("[{} {} {} {}]", range[0], range[1], range[2], range[3]).into_bytes();
    if formatted.len() > BYTE_RANGE_PLACEHOLDER.len() {
        return None;
    }
    formatted.resize(BYTE_RANGE_PLACEHOLDER.len(), b' ');
    Some(formatted)
}

pub fn write_object(w: &mut Vec<u8>, obj: &Object) -> std::io::Result<()> {
    match obj {
        Object::Null => w.write_all(b"null"),
        Object::Boolean(b) => w.write_all(if *b { b"true" } else { b"false" }),
        Object::Integer(i) => write!(w, "{i}"),
        Object::Real(r) => write_real(w, *r),
        Object::Name(n) => write_name(w, n),
        Object::String(s, StringFormat::Literal) => write_literal_string(w, s),
        Object::String(s, StringFormat::Hexadecimal) => {
            w.push(b'<');
            for byte in s {
                write!(w, "{byte:02X}")?;
            }
            w.push(b'>');
            Ok(())
        }
        Object::Array(array) => {
            w.push(b'[');
            for (i, obj) in array.iter().enumerate() {
                if i > 0 {
                    w.push(b' ');
                }
                write_object(w, obj)?;
            }
            w.push(b']');
            Ok(())
        }
        Object::Dictionary(dict) => write_dictionary(w, dict),
        Object::Stream(stream) => {
            let mut dict = stream.dict.clone();
            dict.set("Length", Object::Integer(stream.content.len() as i64));
            write_dictionary(w, &dict)?;
            w.write_all(b"\nstream\n")?;
            w.write_all(&stream.content)?;
            w.write_all(b"\nendstream")
        }
        Object::Reference((id, generation)) => write!(w, "{id} {generation} R"),
    }
}

fn write_dictionary(w: &mut Vec<u8>, dict: &Dictionary) -> std::io::Result<()> {
    w.write_all(b"<<")?;
    for (key, value) in dict.iter() {
        write_name(w, key)?;
        w.push(b' ');
        write_object(w, value)?;
    }
    w.write_all(b">>")
}

fn write_real(w: &mut Vec<u8>, value: f32) -> std::io::Result<()> {
    if value.fract() == 0.0 {
        write!(w, "{}", value as i64)
    } else {
        let formatted = format!("{value:.5}");
        w.write_all(formatted.trim_end_matches('0').trim_end_matches('.').as_bytes())
    }
}

fn write_name(w: &mut Vec<u8>, name: &[u8]) -> std::io::Result<()> {
    w.push(b'/');
    for &byte in name {
        match byte {
            b'!'..=b'~'
                if !matches!(
                    byte,
                    b'#' | b'/' | b'%' | b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}'
                ) =>
            {
                w.push(byte)
            }
            _ => write!(w, "#{byte:02X}")?,
        }
    }
    Ok(())
}

fn write_literal_string(w: &mut Vec<u8>, data: &[u8]) -> std::io::Result<()> {
    w.push(b'(');
    for &byte in data {
        match byte {
            b'(' | b')' | b'\\' => w.extend_from_slice(&[b'\\', byte]),
            b'\n' => w.extend_from_slice(b"\\n"),
            b'\r' => w.extend_from_slice(b"\\r"),
            _ => w.push(byte),
        }
    }
    w.push(b')');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn serialize(obj: &Object) -> String {
        let mut out = Vec::new();
        write_object(&mut out, obj).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn objects_serialize_to_pdf_syntax() {
        let dict = dictionary! {
            "Type" => "Sig",
            "Name" => Object::string_literal("Bruno (L.) Specimen"),
            "Rect" => vec![Object::Real(36.0), Object::Real(0.5), 1.into()],
            "V" => (12, 0),
            "Odd Name" => Object::Name(b"a/b".to_vec()),
        };
        assert_eq!(
            serialize(&Object::Dictionary(dict)),
            "<</Type /Sig/Name (Bruno \\(L.\\) Specimen)/Rect [36 0.5 1]/V 12 0 R/Odd#20Name /a#2Fb>>"
        );
        assert_eq!(
            serialize(&Object::String(vec![0xde, 0xad], StringFormat::Hexadecimal)),
            "<DEAD>"
        );
    }

    #[test]
    fn byte_range_keeps_placeholder_width() {
        let formatted = format_byte_range([0, 120, 16506, 900]).unwrap();
        assert_eq!(formatted.len(), BYTE_RANGE_PLACEHOLDER.len());
        assert!(formatted.starts_with(b"[0 120 16506 900]"));
        assert!(format_byte_range([0, usize::MAX, usize::MAX, usize::MAX]).is_none());
    }

    fn base_document(xref: XrefType) -> (Vec<u8>, Document) {
        let mut base_doc = Document::with_version("1.7");
        base_doc.reference_table.cross_reference_type = xref;
        let pages_id = base_doc.new_object_id();
        base_doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => Vec::<Object>::new(),
                "Count" => 0,
            }),
        );
        let catalog_id = base_doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        base_doc.trailer.set("Root", catalog_id);
        let mut base = Vec::new();
        base_doc.save_to(&mut base).unwrap();
        (base.clone(), Document::load_mem(&base).unwrap())
    }

    /// Appends an `/Info` dictionary the way a signing step appends its
    /// objects, closing with the section kind the base document used.
    fn append_info(base: &[u8], base_doc: &Document) -> (Vec<u8>, ObjectId, XrefFormat) {
        let prev = crate::last_startxref(base).unwrap();
        let mut next = base_doc.max_id + 1;
        let info_id = (next, 0);
        next += 1;
        let format = XrefFormat::following(base_doc, || {
            next += 1;
            (next - 1, 0)
        });

        let mut writer = IncrementalWriter::new(base);
        writer
            .write_object(
                info_id,
                &Object::Dictionary(dictionary! { "Title" => Object::string_literal("Signed") }),
            )
            .unwrap();
        let trailer = dictionary! {
            "Size" => Object::Integer(next as i64),
            "Root" => base_doc.trailer.get(b"Root").unwrap().clone(),
            "Info" => info_id,
        };
        (writer.finish(trailer, prev, format).unwrap(), info_id, format)
    }

    #[test]
    fn increment_is_appended_and_parseable() {
        for xref in [XrefType::CrossReferenceTable, XrefType::CrossReferenceStream] {
            let (base, base_doc) = base_document(xref);
            let (updated, info_id, _) = append_info(&base, &base_doc);

            assert!(updated.starts_with(&base));
            assert!(crate::pdf_ends_with_eof(&updated));

            let doc = Document::load_mem(&updated).unwrap();
            let info = doc.get_dictionary(info_id).unwrap();
            assert_eq!(info.get(b"Title").unwrap().as_str().unwrap(), b"Signed");
            assert_eq!(doc.catalog().unwrap().get(b"Type").unwrap().as_name().unwrap(), b"Catalog");
        }
    }

    #[test]
    fn update_keeps_the_cross_reference_kind_of_its_source() {
        let (base, base_doc) = base_document(XrefType::CrossReferenceTable);
        let (updated, _, format) = append_info(&base, &base_doc);
        assert_eq!(format, XrefFormat::Table);
        let appended = &updated[base.len()..];
        assert!(appended.windows(5).any(|w| w == b"xref\n"));
        assert!(appended.windows(7).any(|w| w == b"trailer"));

        let (base, base_doc) = base_document(XrefType::CrossReferenceStream);
        let (updated, info_id, format) = append_info(&base, &base_doc);
        let XrefFormat::Stream(stream_id) = format else {
            panic!("expected a cross-reference stream, got {format:?}");
        };
        assert_eq!(stream_id.0, info_id.0 + 1);
        let appended = &updated[base.len()..];
        assert!(!appended.windows(7).any(|w| w == b"trailer"));
        assert!(appended.windows(11).any(|w| w == b"/Type /XRef"));

        let doc = Document::load_mem(&updated).unwrap();
        assert!(matches!(
            doc.reference_table.cross_reference_type,
            XrefType::CrossReferenceStream
        ));
        assert_eq!(doc.trailer.get(b"Info").unwrap().as_reference().unwrap(), info_id);
        assert_eq!(
            doc.trailer.get(b"Prev").unwrap().as_i64().unwrap() as usize,
            crate::last_startxref(&base).unwrap()
        );
    }
}
