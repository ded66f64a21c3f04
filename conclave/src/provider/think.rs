//! Stateful `<think>…</think>` extraction for content streams.
//!
//! Reasoning models served over OpenAI-compatible and Ollama endpoints emit
//! their chain of thought inline, wrapped in `<think>` tags. The tags can be
//! split across arbitrary chunk boundaries (`<thi` then `nk>`), so a rolling
//! buffer holds back any suffix that could still turn out to be a tag.

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

/// A piece of classified stream text.
#[derive(Clone, Debug, PartialEq)]
pub enum Piece {
    Content(String),
    Reasoning(String),
}

/// Splits streamed content into content and reasoning pieces.
///
/// Feed raw deltas with [`push`](Self::push); call [`finish`](Self::finish)
/// at end of stream to flush whatever is still buffered (an unclosed think
/// block flushes as reasoning, matching the non-streaming strip behavior).
#[derive(Default)]
pub struct ThinkSplitter {
    buf: String,
    in_think: bool,
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one content delta and returns the pieces that are now
    /// unambiguous.
    pub fn push(&mut self, delta: &str) -> Vec<Piece> {
        self.buf.push_str(delta);
        let mut out = Vec::new();

        loop {
            if self.in_think {
                if let Some(close) = self.buf.find(CLOSE) {
                    if close > 0 {
                        out.push(Piece::Reasoning(self.buf[..close].to_string()));
                    }
                    self.buf.drain(..close + CLOSE.len());
                    self.in_think = false;
                    continue;
                }
                // Everything except a possible partial `</think>` suffix is
                // definitely reasoning.
                let mut safe = self.buf.len().saturating_sub(CLOSE.len());
                while safe > 0 && !self.buf.is_char_boundary(safe) {
                    safe -= 1;
                }
                if safe > 0 {
                    out.push(Piece::Reasoning(self.buf[..safe].to_string()));
                    self.buf.drain(..safe);
                }
                break;
            }

            if let Some(open) = self.buf.find(OPEN) {
                if open > 0 {
                    out.push(Piece::Content(self.buf[..open].to_string()));
                }
                self.buf.drain(..open + OPEN.len());
                self.in_think = true;
                continue;
            }

            // Hold back a suffix that is a prefix of `<think>`.
            let hold = partial_suffix_len(&self.buf, OPEN);
            let safe = self.buf.len() - hold;
            if safe > 0 {
                out.push(Piece::Content(self.buf[..safe].to_string()));
                self.buf.drain(..safe);
            }
            break;
        }

        out
    }

    /// Flushes the remaining buffer at end of stream.
    pub fn finish(&mut self) -> Option<Piece> {
        if self.buf.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.buf);
        if self.in_think {
            Some(Piece::Reasoning(text))
        } else {
            Some(Piece::Content(text))
        }
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of `tag`.
fn partial_suffix_len(s: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(s.len());
    for len in (1..=max).rev() {
        if s.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

/// Non-streaming variant: strips `<think>` blocks from `content`, returning
/// `(clean_content, reasoning)`. An unclosed block is treated as reasoning to
/// the end of the string.
pub fn strip_think_tags(content: &str) -> (String, String) {
    let mut splitter = ThinkSplitter::new();
    let mut clean = String::new();
    let mut reasoning_parts: Vec<String> = Vec::new();
    let mut push_piece = |piece: Piece| match piece {
        Piece::Content(t) => clean.push_str(&t),
        Piece::Reasoning(t) => reasoning_parts.push(t),
    };
    for piece in splitter.push(content) {
        push_piece(piece);
    }
    if let Some(piece) = splitter.finish() {
        push_piece(piece);
    }
    (clean.trim().to_string(), reasoning_parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> Vec<Piece> {
        let mut s = ThinkSplitter::new();
        let mut out = Vec::new();
        for c in chunks {
            out.extend(s.push(c));
        }
        out.extend(s.finish());
        out
    }

    /// Merge adjacent same-kind pieces for assertion convenience.
    fn normalize(pieces: Vec<Piece>) -> Vec<Piece> {
        let mut out: Vec<Piece> = Vec::new();
        for p in pieces {
            match (out.last_mut(), &p) {
                (Some(Piece::Content(a)), Piece::Content(b)) => a.push_str(b),
                (Some(Piece::Reasoning(a)), Piece::Reasoning(b)) => a.push_str(b),
                _ => out.push(p),
            }
        }
        out
    }

    /// **Scenario**: a tag split as `<thi` / `nk>reasoning</think>tail` yields
    /// exactly one reasoning piece and one content piece; no tag text leaks.
    #[test]
    fn partial_open_tag_across_chunks() {
        let pieces = normalize(run(&["<thi", "nk>reasoning</think>tail"]));
        assert_eq!(
            pieces,
            vec![
                Piece::Reasoning("reasoning".into()),
                Piece::Content("tail".into())
            ]
        );
    }

    /// **Scenario**: plain text without tags passes through untouched.
    #[test]
    fn passthrough_without_tags() {
        let pieces = normalize(run(&["hello ", "world"]));
        assert_eq!(pieces, vec![Piece::Content("hello world".into())]);
    }

    /// **Scenario**: a `<` that never becomes a tag is eventually released.
    #[test]
    fn false_partial_is_released() {
        let pieces = normalize(run(&["a <b> c"]));
        assert_eq!(pieces, vec![Piece::Content("a <b> c".into())]);
    }

    /// **Scenario**: close tag split across chunks keeps reasoning intact.
    #[test]
    fn partial_close_tag_across_chunks() {
        let pieces = normalize(run(&["<think>abc</th", "ink>def"]));
        assert_eq!(
            pieces,
            vec![Piece::Reasoning("abc".into()), Piece::Content("def".into())]
        );
    }

    /// **Scenario**: unclosed think block flushes as reasoning at end.
    #[test]
    fn unclosed_block_flushes_as_reasoning() {
        let pieces = normalize(run(&["before<think>trailing thought"]));
        assert_eq!(
            pieces,
            vec![
                Piece::Content("before".into()),
                Piece::Reasoning("trailing thought".into())
            ]
        );
    }

    /// **Scenario**: multiple think blocks in one stream all extract.
    #[test]
    fn multiple_blocks() {
        let pieces = normalize(run(&["a<think>x</think>b<think>y</think>c"]));
        assert_eq!(
            pieces,
            vec![
                Piece::Content("a".into()),
                Piece::Reasoning("x".into()),
                Piece::Content("b".into()),
                Piece::Reasoning("y".into()),
                Piece::Content("c".into()),
            ]
        );
    }

    /// **Scenario**: non-streaming strip mirrors the streaming behavior.
    #[test]
    fn strip_think_tags_basic() {
        let (clean, reasoning) = strip_think_tags("a<think>x</think>b<think>unclosed");
        assert_eq!(clean, "ab");
        assert_eq!(reasoning, "x\nunclosed");
    }
}
