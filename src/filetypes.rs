//! Filetype detection by extension, then by content signature.

use std::io::Cursor;
use std::path::Path;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_JSON: &str = "application/json";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_ZIP: &str = "application/zip";
/// Reported when nothing identifies the content.
pub const MIME_UNKNOWN: &str = "application/octet-stream";

/// Bytes inspected when sniffing text content.
const SNIFF_BYTES: usize = 8 * 1024;

fn from_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "txt" | "text" | "log" | "rst" => MIME_TEXT,
        "md" | "markdown" | "mdx" => MIME_MARKDOWN,
        "html" | "htm" | "xhtml" => MIME_HTML,
        "csv" | "tsv" => MIME_CSV,
        "json" => MIME_JSON,
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "pptx" => MIME_PPTX,
        "xlsx" => MIME_XLSX,
        _ => return None,
    })
}

/// Detect the MIME type of a file.
///
/// A known extension wins. Otherwise the content is sniffed: PDF and ZIP
/// signatures (OOXML packages are told apart by their part names), then
/// JSON, HTML and plain UTF-8 text. Anything else is
/// [`MIME_UNKNOWN`].
pub fn detect_filetype(filename: &str, content: &[u8]) -> String {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    if let Some(mime) = ext.as_deref().and_then(from_extension) {
        return mime.to_string();
    }
    sniff(content).to_string()
}

fn sniff(content: &[u8]) -> &'static str {
    if content.starts_with(b"%PDF-") {
        return MIME_PDF;
    }
    if content.starts_with(b"PK\x03\x04") {
        return sniff_zip(content);
    }

    let head = &content[..content.len().min(SNIFF_BYTES)];
    if head.contains(&0) {
        return MIME_UNKNOWN;
    }
    let text = match std::str::from_utf8(head) {
        Ok(t) => t,
        // A multi-byte character cut at the sniff boundary is still text.
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => {
            std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return MIME_UNKNOWN,
    };

    let trimmed = text.trim_start();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_slice::<serde_json::Value>(content).is_ok()
    {
        return MIME_JSON;
    }
    let lower: String = trimmed.chars().take(64).collect::<String>().to_lowercase();
    if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
        return MIME_HTML;
    }
    MIME_TEXT
}

fn sniff_zip(content: &[u8]) -> &'static str {
    let Ok(archive) = zip::ZipArchive::new(Cursor::new(content)) else {
        return MIME_UNKNOWN;
    };
    let mut mime = MIME_ZIP;
    for name in archive.file_names() {
        if name.starts_with("word/") {
            mime = MIME_DOCX;
        } else if name.starts_with("ppt/") {
            mime = MIME_PPTX;
        } else if name.starts_with("xl/") {
            mime = MIME_XLSX;
        } else {
            continue;
        }
        break;
    }
    mime
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entry: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            zip.start_file(entry, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_extension_wins() {
        assert_eq!(detect_filetype("notes.MD", b"\x00\x01"), MIME_MARKDOWN);
        assert_eq!(detect_filetype("a/b/report.pdf", b""), MIME_PDF);
        assert_eq!(detect_filetype("deck.pptx", b""), MIME_PPTX);
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(detect_filetype("blob", b"%PDF-1.4\n..."), MIME_PDF);
        assert_eq!(detect_filetype("blob", &zip_with("word/document.xml")), MIME_DOCX);
        assert_eq!(detect_filetype("blob", &zip_with("xl/workbook.xml")), MIME_XLSX);
        assert_eq!(detect_filetype("blob", &zip_with("other.txt")), MIME_ZIP);
    }

    #[test]
    fn test_sniff_text_kinds() {
        assert_eq!(detect_filetype("data", br#"{"a": 1}"#), MIME_JSON);
        assert_eq!(detect_filetype("data", b"{not json"), MIME_TEXT);
        assert_eq!(
            detect_filetype("page", b"<!DOCTYPE html><html><body>x</body></html>"),
            MIME_HTML
        );
        assert_eq!(detect_filetype("README", "plain text ✓".as_bytes()), MIME_TEXT);
    }

    #[test]
    fn test_unknown_binary() {
        assert_eq!(
            detect_filetype("mystery.bin", &[0x7f, 0x45, 0x4c, 0x46, 0x00, 0x02]),
            MIME_UNKNOWN
        );
        assert_eq!(detect_filetype("x", &[0xff, 0xfe, 0xfd]), MIME_UNKNOWN);
    }
}
