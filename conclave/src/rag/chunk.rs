//! Overlapping character-window chunking.

/// Default chunk window in characters.
pub const CHUNK_SIZE: usize = 500;
/// Default overlap between consecutive chunks.
pub const CHUNK_OVERLAP: usize = 50;

/// Splits `text` into overlapping windows. Whitespace-only input yields no
/// chunks. Boundaries are adjusted down to char boundaries for multi-byte
/// text.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.trim().is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let mut end = (start + chunk_size).min(text.len());
        while end < text.len() && !text.is_char_boundary(end) {
            end += 1;
        }
        chunks.push(text[start..end].to_string());
        if end == text.len() {
            break;
        }
        start += step;
        while start < text.len() && !text.is_char_boundary(start) {
            start += 1;
        }
    }
    chunks
}
