//! Document text extraction for indexing.
//!
//! Plain text and markdown decode directly. PDF and DOCX extraction sit
//! behind the `pdf` and `docx` features; when a feature is absent the
//! extractor degrades to empty text and the document simply contributes no
//! chunks.

use tracing::warn;

/// Extracts plain text from a document. Unknown formats yield empty text.
pub fn extract_text(file_bytes: &[u8], filename: &str, media_type: &str) -> String {
    let lower = filename.to_lowercase();

    if media_type == "text/plain" || lower.ends_with(".txt") {
        return String::from_utf8_lossy(file_bytes).into_owned();
    }
    if media_type == "text/markdown" || lower.ends_with(".md") {
        return String::from_utf8_lossy(file_bytes).into_owned();
    }
    if media_type == "application/pdf" || lower.ends_with(".pdf") {
        return extract_pdf(file_bytes);
    }
    if lower.ends_with(".docx") {
        return extract_docx(file_bytes);
    }
    String::new()
}

#[cfg(feature = "pdf")]
fn extract_pdf(file_bytes: &[u8]) -> String {
    match pdf_extract::extract_text_from_mem(file_bytes) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "pdf extraction failed");
            String::new()
        }
    }
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_file_bytes: &[u8]) -> String {
    warn!("pdf feature not enabled; cannot extract PDF text");
    String::new()
}

#[cfg(feature = "docx")]
fn extract_docx(file_bytes: &[u8]) -> String {
    use std::io::Read;

    let reader = std::io::Cursor::new(file_bytes);
    let mut archive = match zip::ZipArchive::new(reader) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "docx open failed");
            return String::new();
        }
    };
    let mut xml = String::new();
    match archive.by_name("word/document.xml") {
        Ok(mut file) => {
            if file.read_to_string(&mut xml).is_err() {
                return String::new();
            }
        }
        Err(e) => {
            warn!(error = %e, "docx missing word/document.xml");
            return String::new();
        }
    }
    strip_docx_xml(&xml)
}

#[cfg(not(feature = "docx"))]
fn extract_docx(_file_bytes: &[u8]) -> String {
    warn!("docx feature not enabled; cannot extract DOCX text");
    String::new()
}

/// Pulls the character content out of WordprocessingML, inserting newlines at
/// paragraph ends.
#[cfg(any(feature = "docx", test))]
fn strip_docx_xml(xml: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    let mut tag = String::new();
    let mut keep_text = false;
    for c in xml.chars() {
        match c {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' => {
                in_tag = false;
                if tag == "w:t" || tag.starts_with("w:t ") {
                    keep_text = true;
                } else if tag == "/w:t" {
                    keep_text = false;
                } else if tag == "/w:p" {
                    out.push('\n');
                }
            }
            _ if in_tag => tag.push(c),
            _ if keep_text => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}
