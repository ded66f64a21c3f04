//! Server-Sent Events framing for [`StreamEvent`].
//!
//! A frame is `event: <name>\ndata: <json>\n\n`. Payload JSON is compact and
//! single-line (serde_json never emits raw newlines inside strings), so one
//! `data:` line is always sufficient.

use std::io::{self, Write};

use crate::event::StreamEvent;

/// Renders one event as an SSE frame string.
pub fn sse_frame(event: &StreamEvent) -> String {
    format!("event: {}\ndata: {}\n\n", event.name(), event.payload())
}

/// Writes one event as an SSE frame to `w`.
pub fn write_sse_frame<W: Write>(w: &mut W, event: &StreamEvent) -> io::Result<()> {
    w.write_all(sse_frame(event).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: frame has event line, data line, and a blank terminator.
    #[test]
    fn frame_shape() {
        let frame = sse_frame(&StreamEvent::ContentDelta {
            content: "hello".into(),
        });
        assert!(frame.starts_with("event: content_delta\ndata: "));
        assert!(frame.ends_with("\n\n"));
        let data_line = frame.lines().nth(1).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(data_line.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(v["content"], "hello");
    }

    /// **Scenario**: done terminator carries an empty JSON object.
    #[test]
    fn done_frame_has_empty_data() {
        let frame = sse_frame(&StreamEvent::Done);
        assert_eq!(frame, "event: done\ndata: {}\n\n");
    }

    /// **Scenario**: newlines in content stay escaped inside the JSON string.
    #[test]
    fn multiline_content_stays_single_data_line() {
        let frame = sse_frame(&StreamEvent::ContentDelta {
            content: "a\nb".into(),
        });
        assert_eq!(frame.matches('\n').count(), 3, "event, data, terminator");
    }

    /// **Scenario**: write_sse_frame writes the same bytes as sse_frame.
    #[test]
    fn writer_matches_string_form() {
        let ev = StreamEvent::Error {
            error: "boom".into(),
        };
        let mut buf = Vec::new();
        write_sse_frame(&mut buf, &ev).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), sse_frame(&ev));
    }
}
