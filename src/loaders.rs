//! Document loaders: raw file bytes → unsplit documents.
//!
//! One loader per supported filetype, looked up with [`loader_for`], or
//! by name with [`loader_named`] when an ingestion flow chooses its own.
//! Text-like formats produce a single document; PPTX yields one document
//! per slide and XLSX one per sheet, each tagged with its position. A
//! loader that finds no text returns an empty list.

use std::io::{Cursor, Read};

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;

use knowledge_core::models::Document;

use crate::filetypes::{
    MIME_CSV, MIME_DOCX, MIME_HTML, MIME_JSON, MIME_MARKDOWN, MIME_PDF, MIME_PPTX, MIME_TEXT,
    MIME_XLSX,
};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub type LoaderFn = fn(&[u8]) -> Result<Vec<Document>>;

/// The loader for a MIME type, if one exists.
pub fn loader_for(filetype: &str) -> Option<LoaderFn> {
    match filetype {
        MIME_TEXT | MIME_MARKDOWN | MIME_CSV => Some(load_text),
        MIME_HTML => Some(load_html),
        MIME_JSON => Some(load_json),
        MIME_PDF => Some(load_pdf),
        MIME_DOCX => Some(load_docx),
        MIME_PPTX => Some(load_pptx),
        MIME_XLSX => Some(load_xlsx),
        _ => None,
    }
}

/// Loader names accepted by `[[ingestion.flows]] loader`.
pub const LOADER_NAMES: &[&str] = &["text", "html", "json", "pdf", "docx", "pptx", "xlsx"];

/// A loader by registry name, for flows that pick their own.
pub fn loader_named(name: &str) -> Option<LoaderFn> {
    match name {
        "text" => Some(load_text),
        "html" => Some(load_html),
        "json" => Some(load_json),
        "pdf" => Some(load_pdf),
        "docx" => Some(load_docx),
        "pptx" => Some(load_pptx),
        "xlsx" => Some(load_xlsx),
        _ => None,
    }
}

fn single(text: String) -> Vec<Document> {
    if text.trim().is_empty() {
        Vec::new()
    } else {
        vec![Document::new(text)]
    }
}

pub fn load_text(bytes: &[u8]) -> Result<Vec<Document>> {
    Ok(single(String::from_utf8_lossy(bytes).into_owned()))
}

pub fn load_json(bytes: &[u8]) -> Result<Vec<Document>> {
    let value: serde_json::Value = serde_json::from_slice(bytes).context("invalid JSON")?;
    Ok(single(serde_json::to_string_pretty(&value)?))
}

pub fn load_html(bytes: &[u8]) -> Result<Vec<Document>> {
    Ok(single(strip_html(&String::from_utf8_lossy(bytes))))
}

/// Drop tags, `<script>`/`<style>` bodies and comments; keep block
/// boundaries as line breaks and decode the common entities.
fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];

        if rest.starts_with("<!--") {
            rest = match rest.find("-->") {
                Some(end) => &rest[end + 3..],
                None => "",
            };
            continue;
        }
        let Some(end) = rest.find('>') else {
            rest = "";
            break;
        };
        let tag = rest[1..end].trim_start_matches('/').to_ascii_lowercase();
        let name: String = tag
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        rest = &rest[end + 1..];

        if (name == "script" || name == "style") && !rest.is_empty() {
            let close = format!("</{}", name);
            let lower = rest.to_ascii_lowercase();
            let body_end = lower
                .find(&close)
                .and_then(|pos| rest[pos..].find('>').map(|e| pos + e + 1));
            rest = match body_end {
                Some(end) => &rest[end..],
                None => "",
            };
            continue;
        }
        if matches!(
            name.as_str(),
            "p" | "br" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
        ) {
            out.push('\n');
        }
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let mut lines: Vec<&str> = Vec::new();
    for line in decoded.lines().map(str::trim) {
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

pub fn load_pdf(bytes: &[u8]) -> Result<Vec<Document>> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| anyhow!("PDF extraction failed: {}", e))?;
    Ok(single(text))
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>> {
    zip::ZipArchive::new(Cursor::new(bytes)).context("OOXML extraction failed: not a ZIP package")
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str, max_bytes: u64) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .with_context(|| format!("OOXML part {} not found", name))?;
    let mut out = Vec::new();
    entry.take(max_bytes).read_to_end(&mut out)?;
    if out.len() as u64 >= max_bytes {
        bail!("ZIP entry {} exceeds size limit ({} bytes)", name, max_bytes);
    }
    Ok(out)
}

/// Part names matching `prefix<N>.xml`, ordered by `N`.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Collect the text of every `<*:t>` element, with a blank line after
/// each `<*:p>` paragraph.
fn paragraph_text(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if !out.is_empty() && !out.ends_with("\n\n") => out.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => bail!("OOXML extraction failed: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

pub fn load_docx(bytes: &[u8]) -> Result<Vec<Document>> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    Ok(single(paragraph_text(&xml)?))
}

/// One document per non-empty slide, tagged with its 1-based `slide`
/// number.
pub fn load_pptx(bytes: &[u8]) -> Result<Vec<Document>> {
    let mut archive = open_archive(bytes)?;
    let mut docs = Vec::new();
    for (i, name) in numbered_parts(&archive, "ppt/slides/slide")
        .into_iter()
        .enumerate()
    {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = paragraph_text(&xml)?;
        if !text.trim().is_empty() {
            docs.push(Document::new(text).with_metadata("slide", (i + 1) as i64));
        }
    }
    Ok(docs)
}

/// One document per non-empty sheet, tagged with its 1-based `sheet`
/// number. Cells are space-separated, rows newline-separated.
pub fn load_xlsx(bytes: &[u8]) -> Result<Vec<Document>> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };

    let mut docs = Vec::new();
    let sheets = numbered_parts(&archive, "xl/worksheets/sheet");
    for (i, name) in sheets.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = sheet_text(&xml, &shared_strings)?;
        if !text.trim().is_empty() {
            docs.push(Document::new(text).with_metadata("sheet", (i + 1) as i64));
        }
    }
    Ok(docs)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => bail!("OOXML extraction failed: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Value,
}

fn sheet_text(xml: &[u8], shared_strings: &[String]) -> Result<String> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut kind = CellKind::Value;
    let mut in_value = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    kind = CellKind::Value;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" {
                            kind = match attr.value.as_ref() {
                                b"s" => CellKind::Shared,
                                b"inlineStr" => CellKind::Inline,
                                _ => CellKind::Value,
                            };
                        }
                    }
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let v = raw.trim();
                let cell = match kind {
                    CellKind::Shared => v
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i))
                        .cloned(),
                    _ => Some(v.to_string()),
                };
                if let Some(cell) = cell.filter(|c| !c.is_empty()) {
                    row.push(cell);
                    cell_count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row).join(" ")),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => bail!("OOXML extraction failed: {}", e),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" "));
    }
    Ok(rows.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn package(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            for (name, xml) in parts {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(xml.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_unknown_filetype_has_no_loader() {
        assert!(loader_for("application/octet-stream").is_none());
        assert!(loader_for("application/zip").is_none());
        assert!(loader_for(MIME_MARKDOWN).is_some());
    }

    #[test]
    fn test_blank_text_yields_nothing() {
        assert!(load_text(b"  \n\t\n").unwrap().is_empty());
        let docs = load_text(b"hello").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "hello");
    }

    #[test]
    fn test_strip_html() {
        let html = "<html><head><style>p{color:red}</style><script>var x = '<p>';</script></head>\
                    <body><h1>Title</h1><p>Fish &amp; chips</p><!-- hidden --><p>Second</p></body></html>";
        let docs = load_html(html.as_bytes()).unwrap();
        assert_eq!(docs[0].content, "Title\n\nFish & chips\n\nSecond");
    }

    #[test]
    fn test_json_is_pretty_printed() {
        let docs = load_json(br#"{"name":"knowledge"}"#).unwrap();
        assert!(docs[0].content.contains("\"name\": \"knowledge\""));
        assert!(load_json(b"{broken").is_err());
    }

    #[test]
    fn test_invalid_binaries_error() {
        assert!(load_pdf(b"not a pdf").is_err());
        assert!(load_docx(b"not a zip").is_err());
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>\
                   <w:p><w:r><w:t>First paragraph</w:t></w:r></w:p>\
                   <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph</w:t></w:r></w:p></w:body></w:document>";
        let docs = load_docx(&package(&[("word/document.xml", xml)])).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "First paragraph\n\nSecondparagraph");
    }

    #[test]
    fn test_pptx_one_document_per_slide() {
        let slide = |text: &str| {
            format!(
                "<p:sld xmlns:p=\"p\" xmlns:a=\"a\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                text
            )
        };
        let s1 = slide("Intro");
        let s2 = slide("Details");
        let s10 = slide("Outro");
        let bytes = package(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let docs = load_pptx(&bytes).unwrap();
        let texts: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(texts, vec!["Intro", "Details", "Outro"]);
        assert_eq!(docs[2].metadata_str("slide").as_deref(), Some("3"));
    }

    #[test]
    fn test_xlsx_one_document_per_sheet() {
        let shared = "<sst><si><t>name</t></si><si><t>qty</t></si><si><t>apples</t></si></sst>";
        let sheet1 = "<worksheet><sheetData>\
                      <row><c t=\"s\"><v>0</v></c><c t=\"s\"><v>1</v></c></row>\
                      <row><c t=\"s\"><v>2</v></c><c><v>42</v></c></row>\
                      </sheetData></worksheet>";
        let sheet2 = "<worksheet><sheetData><row><c t=\"inlineStr\"><is><t>inline</t></is></c></row></sheetData></worksheet>";
        let bytes = package(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet1),
            ("xl/worksheets/sheet2.xml", sheet2),
        ]);
        let docs = load_xlsx(&bytes).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].content, "name qty\napples 42");
        assert_eq!(docs[1].content, "inline");
    }
}
