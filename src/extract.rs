//! Per-format text and metadata extraction.
//!
//! Formats are a closed set dispatched through a static extension table —
//! no runtime reflection. Each extractor returns plain UTF-8 text plus
//! whatever metadata the format carries (title, author, page count).
//! Files are read into memory up front so every parser works on an owned
//! buffer and no handle outlives this module.

use std::io::Read;
use std::path::Path;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::RagError;
use crate::models::DocumentMetadata;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Pdf,
    Docx,
    Xlsx,
    Html,
    Eml,
    Txt,
}

/// Static extension → format table.
const EXTENSIONS: &[(&str, FileFormat)] = &[
    ("pdf", FileFormat::Pdf),
    ("docx", FileFormat::Docx),
    ("xlsx", FileFormat::Xlsx),
    ("html", FileFormat::Html),
    ("htm", FileFormat::Html),
    ("eml", FileFormat::Eml),
    ("txt", FileFormat::Txt),
    ("md", FileFormat::Txt),
];

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<FileFormat> {
        let ext = ext.to_ascii_lowercase();
        EXTENSIONS
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, f)| *f)
    }

    /// Resolve a format from a file path, or `UnsupportedFormat`.
    pub fn from_path(path: &Path) -> Result<FileFormat, RagError> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(FileFormat::from_extension)
            .ok_or_else(|| RagError::UnsupportedFormat(path.display().to_string()))
    }
}

/// Extraction output: plain text plus format-level metadata.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// Extract text and metadata from a file on disk.
pub fn extract(path: &Path) -> Result<Extracted, RagError> {
    let format = FileFormat::from_path(path)?;
    let bytes =
        std::fs::read(path).map_err(|e| RagError::extraction(path.display().to_string(), e))?;
    extract_bytes(&bytes, format).map_err(|e| match e {
        RagError::Extraction { reason, .. } => {
            RagError::extraction(path.display().to_string(), reason)
        }
        other => other,
    })
}

/// Extract from an in-memory buffer with a known format.
pub fn extract_bytes(bytes: &[u8], format: FileFormat) -> Result<Extracted, RagError> {
    match format {
        FileFormat::Pdf => extract_pdf(bytes),
        FileFormat::Docx => extract_docx(bytes),
        FileFormat::Xlsx => extract_xlsx(bytes),
        FileFormat::Html => extract_html(bytes),
        FileFormat::Eml => extract_eml(bytes),
        FileFormat::Txt => Ok(Extracted {
            text: String::from_utf8_lossy(bytes).into_owned(),
            metadata: DocumentMetadata::default(),
        }),
    }
}

fn err(reason: impl ToString) -> RagError {
    RagError::extraction("<buffer>", reason)
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<Extracted, RagError> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(err)?;
    // pdf-extract separates pages with form feeds when the document has
    // explicit page breaks; absent that, the page count stays unknown.
    let breaks = text.matches('\u{c}').count();
    let page_count = if breaks > 0 { Some(breaks + 1) } else { None };
    Ok(Extracted {
        text,
        metadata: DocumentMetadata {
            page_count,
            ..Default::default()
        },
    })
}

// ============ OOXML helpers ============

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, RagError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(err)
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, RagError> {
    let entry = archive.by_name(name).map_err(err)?;
    let mut out = Vec::new();
    entry.take(max_bytes).read_to_end(&mut out).map_err(err)?;
    if out.len() as u64 >= max_bytes {
        return Err(err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

// ============ DOCX ============

fn extract_docx(bytes: &[u8]) -> Result<Extracted, RagError> {
    let mut archive = open_archive(bytes)?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let text = extract_docx_text(&doc_xml)?;
    let metadata = read_core_properties(&mut archive).unwrap_or_default();
    Ok(Extracted { text, metadata })
}

/// Walk `w:t` text runs, inserting paragraph breaks at `w:p` boundaries so
/// downstream semantic chunking sees the document's structure.
fn extract_docx_text(xml: &[u8]) -> Result<String, RagError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !out.is_empty() && !out.ends_with("\n\n") {
                        out.push_str("\n\n");
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

/// Title and author from `docProps/core.xml`, when present.
fn read_core_properties(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Option<DocumentMetadata> {
    let xml = read_zip_entry_bounded(archive, "docProps/core.xml", MAX_XML_ENTRY_BYTES).ok()?;
    let mut metadata = DocumentMetadata::default();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<&'static str> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                current = match e.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("creator"),
                    _ => None,
                };
            }
            Ok(quick_xml::events::Event::Text(te)) => {
                if let Some(field) = current {
                    let value = te.unescape().unwrap_or_default().trim().to_string();
                    if !value.is_empty() {
                        match field {
                            "title" => metadata.title = Some(value),
                            _ => metadata.author = Some(value),
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::End(_)) => current = None,
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
    Some(metadata)
}

// ============ XLSX ============

fn extract_xlsx(bytes: &[u8]) -> Result<Extracted, RagError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&mut archive);
    let mut out = String::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let cell_texts = extract_xlsx_sheet_cells(&sheet_xml, &shared_strings)?;
        if !out.is_empty() && !cell_texts.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&cell_texts);
    }
    Ok(Extracted {
        text: out,
        metadata: DocumentMetadata::default(),
    })
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, RagError> {
    // Workbooks with no string cells have no sharedStrings part.
    let xml = match read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES) {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        strings.push(te.unescape().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_xlsx_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, RagError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() && cell_is_shared_str {
                    if let Ok(i) = s.parse::<usize>() {
                        if i < shared_strings.len() {
                            cells.push(shared_strings[i].clone());
                            cell_count += 1;
                        }
                    }
                }
                in_v = false;
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

// ============ HTML ============

/// Block-level tags that should introduce a paragraph break in the
/// extracted text.
fn is_block_tag(name: &str) -> bool {
    matches!(
        name,
        "p" | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "li"
            | "tr"
            | "div"
            | "section"
            | "article"
            | "blockquote"
            | "br"
    )
}

fn extract_html(bytes: &[u8]) -> Result<Extracted, RagError> {
    let input = String::from_utf8_lossy(bytes);
    let doc = Html::parse_document(&input);

    let title_sel = Selector::parse("title").map_err(err)?;
    let title = doc
        .select(&title_sel)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let mut out = String::new();
    for node in doc.tree.root().descendants() {
        if let Some(element) = node.value().as_element() {
            if is_block_tag(element.name()) && !out.is_empty() && !out.ends_with("\n\n") {
                out.push_str("\n\n");
            }
            continue;
        }
        if let Some(text) = node.value().as_text() {
            let skipped = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| matches!(e.name(), "script" | "style" | "head"))
                    .unwrap_or(false)
            });
            if skipped {
                continue;
            }
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                out.push(' ');
            }
            out.push_str(trimmed);
        }
    }

    Ok(Extracted {
        text: out.trim().to_string(),
        metadata: DocumentMetadata {
            title,
            ..Default::default()
        },
    })
}

// ============ EML ============

fn extract_eml(bytes: &[u8]) -> Result<Extracted, RagError> {
    let raw = String::from_utf8_lossy(bytes);
    let normalized = raw.replace("\r\n", "\n");
    let (header_block, body) = match normalized.split_once("\n\n") {
        Some((h, b)) => (h, b),
        None => return Err(err("no header/body separator found")),
    };

    let mut metadata = DocumentMetadata::default();
    // RFC 5322 header unfolding: continuation lines start with whitespace.
    let mut unfolded: Vec<String> = Vec::new();
    for line in header_block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = unfolded.last_mut() {
                last.push(' ');
                last.push_str(line.trim_start());
                continue;
            }
        }
        unfolded.push(line.to_string());
    }
    for header in &unfolded {
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match name.to_ascii_lowercase().as_str() {
                "subject" => metadata.title = Some(value.to_string()),
                "from" => metadata.author = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(Extracted {
        text: body.trim().to_string(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extension_table_resolves_known_formats() {
        assert_eq!(FileFormat::from_extension("pdf"), Some(FileFormat::Pdf));
        assert_eq!(FileFormat::from_extension("DOCX"), Some(FileFormat::Docx));
        assert_eq!(FileFormat::from_extension("htm"), Some(FileFormat::Html));
        assert_eq!(FileFormat::from_extension("md"), Some(FileFormat::Txt));
        assert_eq!(FileFormat::from_extension("exe"), None);
    }

    #[test]
    fn unknown_extension_is_unsupported_format() {
        let err = FileFormat::from_path(&PathBuf::from("report.bin")).unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat(_)));
    }

    #[test]
    fn missing_extension_is_unsupported_format() {
        let err = FileFormat::from_path(&PathBuf::from("README")).unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat(_)));
    }

    #[test]
    fn invalid_pdf_returns_extraction_error() {
        let err = extract_bytes(b"not a pdf", FileFormat::Pdf).unwrap_err();
        assert!(matches!(err, RagError::Extraction { .. }));
    }

    #[test]
    fn invalid_zip_returns_extraction_error_for_docx() {
        let err = extract_bytes(b"not a zip", FileFormat::Docx).unwrap_err();
        assert!(matches!(err, RagError::Extraction { .. }));
    }

    #[test]
    fn txt_passes_through() {
        let out = extract_bytes(b"plain text body", FileFormat::Txt).unwrap();
        assert_eq!(out.text, "plain text body");
        assert!(out.metadata.title.is_none());
    }

    #[test]
    fn html_extracts_title_and_paragraphs_skipping_script() {
        let html = br#"<html><head><title>Refund Policy</title>
            <style>p { color: red }</style></head>
            <body><h1>Refunds</h1><p>Full refund within 30 days.</p>
            <script>var x = "ignore me";</script>
            <p>Contact support first.</p></body></html>"#;
        let out = extract_bytes(html, FileFormat::Html).unwrap();
        assert_eq!(out.metadata.title.as_deref(), Some("Refund Policy"));
        assert!(out.text.contains("Full refund within 30 days."));
        assert!(out.text.contains("Contact support first."));
        assert!(!out.text.contains("ignore me"));
        assert!(!out.text.contains("color: red"));
        assert!(out.text.contains("\n\n"), "block tags should break paragraphs");
    }

    #[test]
    fn eml_splits_headers_and_body() {
        let eml = b"From: Jane Doe <jane@example.com>\nSubject: Quarterly\n report\nDate: Mon, 1 Jan 2024 00:00:00 +0000\n\nHello team,\n\nNumbers attached.\n";
        let out = extract_bytes(eml, FileFormat::Eml).unwrap();
        assert_eq!(out.metadata.title.as_deref(), Some("Quarterly report"));
        assert_eq!(
            out.metadata.author.as_deref(),
            Some("Jane Doe <jane@example.com>")
        );
        assert!(out.text.starts_with("Hello team,"));
    }

    #[test]
    fn eml_without_separator_is_extraction_error() {
        let err = extract_bytes(b"Subject: no body here", FileFormat::Eml).unwrap_err();
        assert!(matches!(err, RagError::Extraction { .. }));
    }
}
