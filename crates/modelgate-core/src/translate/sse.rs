//! Server-sent event framing
//!
//! [`SseDecoder`] turns an arbitrary chunking of upstream bytes into whole
//! events; [`SseFrame::to_wire`] renders one event back to text.

use crate::error::{GatewayError, Result};

/// Longest line the decoder will hold while waiting for its newline
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// Unnamed event carrying only `data:`
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Render as it appears on the wire, including the blank terminator line
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental SSE parser. Network chunks may split lines (and UTF-8
/// sequences) anywhere, so bytes are buffered until a newline arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event it completes. Fails once an
    /// unterminated line grows past [`MAX_LINE_BYTES`].
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&*line);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            let held = self.buffer.len();
            self.buffer.clear();
            return Err(GatewayError::translation(format!(
                "event stream line exceeds {} bytes ({} buffered without a newline)",
                MAX_LINE_BYTES, held
            )));
        }
        Ok(frames)
    }

    /// Flush whatever is pending once the byte stream has ended
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id / retry carry nothing the gateway needs
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"a\":1}\n\n").unwrap();
        assert_eq!(frames, vec![SseFrame::data("{\"a\":1}")]);
    }

    #[test]
    fn test_decode_named_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
    }

    #[test]
    fn test_decode_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"da").unwrap().is_empty());
        assert!(decoder.feed(b"ta: hel").unwrap().is_empty());
        assert!(decoder.feed(b"lo\r\n").unwrap().is_empty());
        let frames = decoder.feed(b"\r\ndata: [DONE]\n\n").unwrap();
        assert_eq!(frames, vec![SseFrame::data("hello"), SseFrame::data("[DONE]")]);
    }

    #[test]
    fn test_decode_split_utf8() {
        let bytes = "data: héllo\n\n".as_bytes();
        let (a, b) = bytes.split_at(8);
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(a).unwrap().is_empty());
        let frames = decoder.feed(b).unwrap();
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": keep-alive\nid: 7\nretry: 100\ndata: x\n\n").unwrap();
        assert_eq!(frames, vec![SseFrame::data("x")]);
    }

    #[test]
    fn test_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: a\ndata: b\n\n").unwrap();
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail").unwrap().is_empty());
        assert_eq!(decoder.finish(), Some(SseFrame::data("tail")));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_unterminated_line_is_capped() {
        let mut decoder = SseDecoder::new();
        let chunk = vec![b'x'; 64 * 1024];
        let mut fed = 0;
        let err = loop {
            match decoder.feed(&chunk) {
                Ok(frames) => assert!(frames.is_empty()),
                Err(e) => break e,
            }
            fed += chunk.len();
            assert!(fed <= MAX_LINE_BYTES);
        };
        assert!(matches!(err, GatewayError::Translation(_)));

        // The decoder is usable again afterwards
        let frames = decoder.feed(b"\ndata: ok\n\n").unwrap();
        assert_eq!(frames, vec![SseFrame::data("ok")]);
    }

    #[test]
    fn test_to_wire() {
        assert_eq!(SseFrame::data("[DONE]").to_wire(), "data: [DONE]\n\n");
        assert_eq!(
            SseFrame::named("ping", "{}").to_wire(),
            "event: ping\ndata: {}\n\n"
        );
    }
}
