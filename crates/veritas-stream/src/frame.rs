//! Splitting a byte stream into text frames.
//!
//! The ask backend speaks SSE (`data:` lines, blank-line separated); the
//! deep-research backend writes one JSON object per line. Chunk boundaries
//! can fall anywhere, including inside a multi-byte character.

/// Wire framing of an event body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    Sse,
    JsonLines,
}

impl Framing {
    /// Pick the framing from a response `Content-Type`. Anything that is not
    /// recognisably line-delimited JSON is treated as SSE.
    pub fn from_content_type(content_type: Option<&str>) -> Framing {
        let Some(ct) = content_type else {
            return Framing::Sse;
        };
        let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/x-ndjson" | "application/ndjson" | "application/jsonl"
            | "application/json-lines" | "application/jsonlines" => Framing::JsonLines,
            _ => Framing::Sse,
        }
    }
}

/// Incremental frame splitter.
#[derive(Debug)]
pub struct FrameSplitter {
    framing: Framing,
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl FrameSplitter {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            data_lines: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Feed a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = text.strip_suffix('\r').unwrap_or(&text);
            if let Some(frame) = self.feed_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever the stream left unterminated.
    pub fn finish(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(frame) = self.feed_line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
        }
        if let Some(frame) = self.dispatch() {
            frames.push(frame);
        }
        frames
    }

    fn feed_line(&mut self, line: &str) -> Option<String> {
        match self.framing {
            Framing::JsonLines => {
                let trimmed = line.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Framing::Sse => {
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
                // `event:`, `id:` and `retry:` carry nothing the frame body lacks.
                if field == "data" {
                    self.data_lines.push(value.to_string());
                }
                None
            }
        }
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let frame = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frames_split_on_blank_lines() {
        let mut splitter = FrameSplitter::new(Framing::Sse);
        let frames = splitter.push(b"data: {\"type\":\"ping\"}\n\ndata: {\"type\":\"done\"}\n\n");
        assert_eq!(frames, vec![r#"{"type":"ping"}"#, r#"{"type":"done"}"#]);
    }

    #[test]
    fn sse_tolerates_arbitrary_chunk_boundaries() {
        let body = "data: {\"type\":\"stage_start\",\"message\":\"ünïcödé\"}\r\n\r\ndata: {\"type\":\"done\"}\n\n";
        let bytes = body.as_bytes();
        for split in 0..bytes.len() {
            let mut splitter = FrameSplitter::new(Framing::Sse);
            let mut frames = splitter.push(&bytes[..split]);
            frames.extend(splitter.push(&bytes[split..]));
            frames.extend(splitter.finish());
            assert_eq!(frames.len(), 2, "split at {split}");
            assert!(frames[0].contains("ünïcödé"), "split at {split}: {frames:?}");
        }
    }

    #[test]
    fn sse_joins_multiline_data_and_skips_comments() {
        let mut splitter = FrameSplitter::new(Framing::Sse);
        let frames = splitter.push(b": keepalive\nevent: message\ndata: {\"a\":\ndata: 1}\nid: 7\n\n");
        assert_eq!(frames, vec!["{\"a\":\n1}"]);
    }

    #[test]
    fn sse_comment_only_block_yields_nothing() {
        let mut splitter = FrameSplitter::new(Framing::Sse);
        assert!(splitter.push(b": ping\n\n").is_empty());
        assert!(splitter.finish().is_empty());
    }

    #[test]
    fn sse_trailing_frame_flushed_on_finish() {
        let mut splitter = FrameSplitter::new(Framing::Sse);
        assert!(splitter.push(b"data: {\"type\":\"done\"}").is_empty());
        assert_eq!(splitter.finish(), vec![r#"{"type":"done"}"#]);
    }

    #[test]
    fn json_lines_frames() {
        let mut splitter = FrameSplitter::new(Framing::JsonLines);
        let mut frames = splitter.push(b"{\"type\":\"status\"}\n\n  \n{\"type\":");
        frames.extend(splitter.push(b"\"done\"}"));
        frames.extend(splitter.finish());
        assert_eq!(frames, vec![r#"{"type":"status"}"#, r#"{"type":"done"}"#]);
    }

    #[test]
    fn framing_from_content_type() {
        assert_eq!(Framing::from_content_type(Some("text/event-stream")), Framing::Sse);
        assert_eq!(
            Framing::from_content_type(Some("application/x-ndjson; charset=utf-8")),
            Framing::JsonLines
        );
        assert_eq!(Framing::from_content_type(None), Framing::Sse);
    }
}
