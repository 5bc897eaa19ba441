use std::sync::OnceLock;

use lopdf::{Document, Object};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PdfMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    /// Offset of this page's first character in [`ExtractedPdf::full_text`].
    pub start_char: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ExtractedPdf {
    pub full_text: String,
    pub pages: Vec<PageText>,
    pub metadata: PdfMetadata,
}

impl ExtractedPdf {
    /// Page holding the character at `char_offset`, if pages are known.
    pub fn page_at(&self, char_offset: usize) -> Option<u32> {
        self.pages
            .iter()
            .take_while(|page| page.start_char <= char_offset)
            .last()
            .map(|page| page.number)
    }
}

pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(5).any(|window| window == b"%PDF-")
}

/// Extracts text and document properties. Pure: works only on the given
/// bytes. CPU bound, call from a blocking task.
pub fn extract_pdf(bytes: &[u8]) -> Result<ExtractedPdf> {
    if !looks_like_pdf(bytes) {
        return Err(AppError::Extraction("file is not a PDF".to_string()));
    }

    let document = Document::load_mem(bytes)
        .map_err(|err| AppError::Extraction(format!("unreadable PDF: {err}")))?;

    let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
    if page_numbers.is_empty() {
        return Err(AppError::Extraction("PDF has no pages".to_string()));
    }

    let metadata = PdfMetadata {
        title: info_string(&document, b"Title"),
        author: info_string(&document, b"Author"),
        page_count: page_numbers.len() as u32,
    };

    let mut raw_pages = Vec::with_capacity(page_numbers.len());
    for number in &page_numbers {
        match document.extract_text(&[*number]) {
            Ok(raw) => {
                let text = normalize_text(&raw);
                if !text.is_empty() {
                    raw_pages.push((*number, text));
                }
            }
            Err(err) => {
                tracing::debug!("page {} text extraction failed: {}", number, err);
            }
        }
    }

    if raw_pages.is_empty() {
        // lopdf cannot decode every font encoding; pdf-extract handles more of
        // them but only yields whole-document text.
        let extracted = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|err| AppError::Extraction(format!("text extraction failed: {err}")))?;
        let text = normalize_text(&extracted);
        if !text.is_empty() {
            raw_pages.push((page_numbers[0], text));
        }
    }

    if raw_pages.is_empty() {
        return Err(AppError::Extraction(
            "PDF contains no extractable text".to_string(),
        ));
    }

    let mut full_text = String::new();
    let mut offset = 0;
    let mut pages = Vec::with_capacity(raw_pages.len());
    for (number, text) in raw_pages {
        if !full_text.is_empty() {
            full_text.push_str("\n\n");
            offset += 2;
        }
        full_text.push_str(&text);
        pages.push(PageText {
            number,
            start_char: offset,
            text: text.clone(),
        });
        offset += text.chars().count();
    }

    Ok(ExtractedPdf {
        full_text,
        pages,
        metadata,
    })
}

fn info_string(document: &Document, key: &[u8]) -> Option<String> {
    let info = match document.trailer.get(b"Info").ok()? {
        Object::Reference(id) => document.get_object(*id).ok()?,
        other => other,
    };
    let value = match info.as_dict().ok()?.get(key).ok()? {
        Object::Reference(id) => document.get_object(*id).ok()?,
        other => other,
    };

    match value {
        Object::String(bytes, _) => {
            let decoded = decode_pdf_string(bytes);
            let trimmed = decoded.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

/// PDF text strings are UTF-16BE with a byte order mark, or PDFDocEncoding,
/// which agrees with Latin-1 for printable characters.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

pub fn normalize_text(input: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();
    let spaces = SPACES
        .get_or_init(|| Regex::new(r"[ \t\u{00A0}\u{200B}\r\x0C]+").expect("valid regex"));
    let blank_lines =
        BLANK_LINES.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let folded = input
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"");

    let lines = folded
        .lines()
        .map(|line| spaces.replace_all(line, " ").trim().to_string())
        .collect::<Vec<_>>()
        .join("\n");

    blank_lines.replace_all(&lines, "\n\n").trim().to_string()
}
