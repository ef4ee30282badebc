//! Multi-format text extraction for uploaded documents (PDF, DOCX, plain text).
//!
//! Extraction is pure: callers supply the raw bytes and a [`DocumentFormat`];
//! this module returns plain UTF-8 text or an error, never partial output.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";

/// Maximum decompressed bytes to read from `word/document.xml` (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const DOCX_BODY_ENTRY: &str = "word/document.xml";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Upload formats accepted by the pipeline, dispatched by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Text,
}

impl DocumentFormat {
    /// Detects the format from a filename's extension (case-insensitive).
    ///
    /// Returns `None` for anything other than `.pdf`, `.docx`, or `.txt`.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "txt" => Some(DocumentFormat::Text),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => MIME_PDF,
            DocumentFormat::Docx => MIME_DOCX,
            DocumentFormat::Text => MIME_TEXT,
        }
    }
}

/// Extracts plain text from `bytes` according to `format`.
pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> Result<String, ExtractError> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
        DocumentFormat::Text => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Page-by-page PDF extraction.
///
/// Pages whose object reference is dangling or null are skipped, as are pages
/// whose text cannot be decoded; only a document that cannot be opened at all
/// is an error. Page texts are joined with a single newline.
fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let mut pages = Vec::new();
    for (page_number, object_id) in doc.get_pages() {
        match doc.get_object(object_id) {
            Ok(lopdf::Object::Null) | Err(_) => {
                tracing::debug!(page = page_number, "skipping PDF page with null reference");
                continue;
            }
            Ok(_) => {}
        }

        match doc.extract_text(&[page_number]) {
            Ok(text) => pages.push(text.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                tracing::warn!(page = page_number, error = %e, "failed to extract text from PDF page");
            }
        }
    }
    Ok(pages.join("\n"))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(format!("failed to open docx zip: {}", e)))?;

    let entry = match archive.by_name(DOCX_BODY_ENTRY) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ExtractError::Docx(format!(
                "{} not found in docx",
                DOCX_BODY_ENTRY
            )));
        }
        Err(e) => {
            return Err(ExtractError::Docx(format!(
                "failed to open {}: {}",
                DOCX_BODY_ENTRY, e
            )));
        }
    };

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(format!(
            "{} exceeds size limit ({} bytes)",
            DOCX_BODY_ENTRY, MAX_XML_ENTRY_BYTES
        )));
    }

    extract_wordprocessing_text(&doc_xml)
}

/// Streams WordprocessingML and collects `<w:t>` runs.
///
/// Every paragraph start (`<w:p>`, including `<w:p/>`) emits a newline before
/// its runs, so two paragraphs "Hello" and "World" yield `"\nHello\nWorld"`.
/// Text inside `<w:t>` is kept verbatim, including surrounding whitespace.
fn extract_wordprocessing_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                match e.local_name().as_ref() {
                    b"t" => in_text = true,
                    b"p" => out.push('\n'),
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"p" {
                    out.push('\n');
                }
            }
            Ok(Event::End(e)) => {
                depth = depth.saturating_sub(1);
                if e.local_name().as_ref() == b"t" {
                    in_text = false;
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Docx(format!("error parsing xml: {}", e)))?;
                out.push_str(&text);
            }
            Ok(Event::CData(cdata)) if in_text => {
                out.push_str(&String::from_utf8_lossy(&cdata));
            }
            Ok(Event::Eof) => {
                if depth > 0 {
                    return Err(ExtractError::Docx(
                        "error parsing xml: unexpected end of document".to_string(),
                    ));
                }
                break;
            }
            Err(e) => return Err(ExtractError::Docx(format!("error parsing xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_body(body_xml: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            zip.start_file(DOCX_BODY_ENTRY, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    fn wrap_body(inner: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
             <w:body>{}</w:body></w:document>",
            inner
        )
    }

    #[test]
    fn format_detection_by_extension() {
        assert_eq!(DocumentFormat::from_filename("a.pdf"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_filename("B.DOCX"), Some(DocumentFormat::Docx));
        assert_eq!(DocumentFormat::from_filename("notes.v2.txt"), Some(DocumentFormat::Text));
        assert_eq!(DocumentFormat::from_filename("image.png"), None);
        assert_eq!(DocumentFormat::from_filename("README"), None);
    }

    #[test]
    fn plain_text_is_identity() {
        let text = extract_text(DocumentFormat::Text, b"  line one\nline two  ").unwrap();
        assert_eq!(text, "  line one\nline two  ");
    }

    #[test]
    fn docx_paragraphs_each_start_with_newline() {
        let xml = wrap_body("<w:p><w:r><w:t>Hello</w:t></w:r></w:p><w:p><w:r><w:t>World</w:t></w:r></w:p>");
        let text = extract_text(DocumentFormat::Docx, &docx_with_body(&xml)).unwrap();
        assert_eq!(text, "\nHello\nWorld");
    }

    #[test]
    fn docx_ignores_indentation_between_elements() {
        let xml = wrap_body(
            "\n  <w:p>\n    <w:r>\n      <w:t>Hello</w:t>\n    </w:r>\n  </w:p>\n  <w:p>\n    <w:r><w:t>World</w:t></w:r>\n  </w:p>\n",
        );
        let text = extract_text(DocumentFormat::Docx, &docx_with_body(&xml)).unwrap();
        assert_eq!(text, "\nHello\nWorld");
    }

    #[test]
    fn docx_keeps_run_whitespace_and_unescapes_entities() {
        let xml = wrap_body(
            "<w:p><w:r><w:t xml:space=\"preserve\">Fish </w:t></w:r><w:r><w:t>&amp; Chips</w:t></w:r></w:p>",
        );
        let text = extract_text(DocumentFormat::Docx, &docx_with_body(&xml)).unwrap();
        assert_eq!(text, "\nFish & Chips");
    }

    #[test]
    fn docx_empty_paragraph_still_emits_newline() {
        let xml = wrap_body("<w:p/><w:p><w:r><w:t>After</w:t></w:r></w:p>");
        let text = extract_text(DocumentFormat::Docx, &docx_with_body(&xml)).unwrap();
        assert_eq!(text, "\n\nAfter");
    }

    #[test]
    fn docx_without_document_xml_is_rejected() {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            zip.start_file("word/styles.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<styles/>").unwrap();
            zip.finish().unwrap();
        }
        let err = extract_text(DocumentFormat::Docx, &buf).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
        assert!(err.to_string().contains("word/document.xml not found"));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(DocumentFormat::Docx, b"not a zip").unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn malformed_docx_xml_aborts() {
        let xml = wrap_body("<w:p><w:r><w:t>Broken</w:r></w:p>");
        let err = extract_text(DocumentFormat::Docx, &docx_with_body(&xml)).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn truncated_docx_xml_aborts() {
        let xml = "<w:document xmlns:w=\"urn:w\"><w:body><w:p><w:r><w:t>Cut off</w:t>";
        let err = extract_text(DocumentFormat::Docx, &docx_with_body(xml)).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    enum Page<'a> {
        Text(&'a str),
        /// A `Kids` entry referencing an object that is `null`.
        NullRef,
        /// A `Kids` entry referencing an object that does not exist.
        DanglingRef,
        /// A page whose content stream makes text extraction fail.
        BadContent,
    }

    fn pdf_with_pages(pages: &[Page]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Object, Stream};

        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for page in pages {
            let operations = match page {
                Page::Text(text) => vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![100.into(), 600.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
                Page::BadContent => vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec![]),
                    Operation::new("ET", vec![]),
                ],
                Page::NullRef => {
                    kids.push(doc.add_object(Object::Null).into());
                    continue;
                }
                Page::DanglingRef => {
                    kids.push(Object::Reference((9_999, 0)));
                    continue;
                }
            };
            let content = Content { operations };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let pages_dict = dictionary! {
            "Type" => "Pages",
            "Count" => kids.len() as i64,
            "Kids" => kids,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn pdf_pages_are_joined_with_newlines() {
        let bytes = pdf_with_pages(&[Page::Text("First page"), Page::Text("Second page")]);
        let text = extract_text(DocumentFormat::Pdf, &bytes).unwrap();
        assert_eq!(text, "First page\nSecond page");
    }

    #[test]
    fn pdf_null_and_dangling_page_refs_are_skipped() {
        let bytes = pdf_with_pages(&[
            Page::Text("Before"),
            Page::NullRef,
            Page::DanglingRef,
            Page::Text("After"),
        ]);
        let text = extract_text(DocumentFormat::Pdf, &bytes).unwrap();
        assert_eq!(text, "Before\nAfter");
    }

    #[test]
    fn pdf_page_that_fails_to_extract_is_skipped() {
        let bytes = pdf_with_pages(&[
            Page::Text("Good"),
            Page::BadContent,
            Page::Text("Also good"),
        ]);
        let text = extract_text(DocumentFormat::Pdf, &bytes).unwrap();
        assert_eq!(text, "Good\nAlso good");
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(DocumentFormat::Pdf, b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }
}
