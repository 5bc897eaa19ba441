use crate::config::ChunkingConfig;
use crate::error::{AppError, Result};

/// A chunk's position in the document's full text, in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

const PARAGRAPH_BREAKS: [&str; 1] = ["\n\n"];
const SENTENCE_BREAKS: [&str; 3] = [". ", "! ", "? "];

/// Splits `text` into overlapping character windows. Consecutive spans
/// overlap by exactly `chunk_overlap` characters; span ends snap to the latest
/// paragraph or sentence break inside the boundary window when one exists.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Result<Vec<TextSpan>> {
    if config.chunk_size == 0 || config.chunk_size <= config.chunk_overlap {
        return Err(AppError::Validation(format!(
            "chunk size ({}) must be greater than overlap ({})",
            config.chunk_size, config.chunk_overlap
        )));
    }

    // byte offset of every char boundary, including the end of the string
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = bounds.len() - 1;

    if total == 0 {
        return Ok(vec![]);
    }

    if total <= config.chunk_size {
        return Ok(vec![TextSpan {
            ordinal: 0,
            start: 0,
            end: total,
            text: text.to_string(),
        }]);
    }

    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let budget_end = (start + config.chunk_size).min(total);
        let end = if budget_end < total {
            find_breakpoint(text, &bounds, start, budget_end, config).unwrap_or(budget_end)
        } else {
            budget_end
        };

        spans.push(TextSpan {
            ordinal: spans.len(),
            start,
            end,
            text: text[bounds[start]..bounds[end]].to_string(),
        });

        if end >= total {
            break;
        }
        start = end - config.chunk_overlap;
    }

    Ok(spans)
}

/// Latest natural break in `(budget_end - window, budget_end]` that still
/// moves the next chunk forward. Paragraph breaks win over sentence breaks.
fn find_breakpoint(
    text: &str,
    bounds: &[usize],
    start: usize,
    budget_end: usize,
    config: &ChunkingConfig,
) -> Option<usize> {
    let min_end = start + config.chunk_overlap + 1;
    let window_start = budget_end.saturating_sub(config.boundary_window).max(min_end);
    if window_start > budget_end {
        return None;
    }

    let haystack = &text[bounds[window_start]..bounds[budget_end]];
    for patterns in [&PARAGRAPH_BREAKS[..], &SENTENCE_BREAKS[..]] {
        let best = patterns
            .iter()
            .filter_map(|pattern| haystack.rfind(pattern).map(|pos| pos + pattern.len()))
            .max();

        if let Some(offset) = best {
            let byte_end = bounds[window_start] + offset;
            if let Ok(char_end) = bounds.binary_search(&byte_end) {
                if char_end >= min_end {
                    return Some(char_end);
                }
            }
        }
    }

    None
}

/// Rebuilds the original text from spans by dropping each span's overlap
/// with its predecessor.
pub fn reassemble(spans: &[TextSpan]) -> String {
    let mut out = String::new();
    let mut covered: usize = 0;
    for span in spans {
        let skip = covered.saturating_sub(span.start);
        out.extend(span.text.chars().skip(skip));
        covered = span.end;
    }
    out
}
