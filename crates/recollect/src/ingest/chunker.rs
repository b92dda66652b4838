
//! Boundary-seeking text chunking with overlap
///
/// Splits `text` into chunks of at most `chunk_size` bytes, preferring to cut
/// at a paragraph break, then a sentence break, found in the second half of
/// the chunk. Consecutive chunks share `chunk_overlap` bytes of context.
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let text = normalize_blank_lines(text.trim());
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= chunk_size {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = floor_char_boundary(&text, (start + chunk_size).min(text.len()));
        if end < text.len() {
            let half = floor_char_boundary(&text, start + chunk_size / 2);
            if let Some(pos) = text[half..end].rfind("\n\n") {
                end = half + pos + 2;
            } else {
                let sentence = text[half..end].rfind(". ").map(|p| p + 2);
                let line = text[half..end].rfind('\n').map(|p| p + 1);
                if let Some(pos) = sentence.into_iter().chain(line).max() {
                    end = half + pos;
                }
            }
        }

        let chunk = text[start..end].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        if end >= text.len() {
            break;
        }
        let next = floor_char_boundary(&text, end.saturating_sub(chunk_overlap));
        // Always make forward progress, even with degenerate overlap settings
        start = if next > start { next } else { end };
    }
    chunks
}

/// Collapse runs of three or more newlines to a paragraph break.
fn normalize_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for ch in text.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(ch);
            }
        } else {
            newlines = 0;
            out.push(ch);
        }
    }
    out
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
