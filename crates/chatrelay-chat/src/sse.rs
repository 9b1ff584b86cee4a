//! Incremental decoding of `text/event-stream` bodies into `data:` payloads.

/// Longest line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Buffers raw body bytes and yields the payload of each complete `data:` line.
///
/// Bytes are kept until a newline arrives, so a multi-byte character split
/// across network chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of body bytes; returns the data payloads it completed.
    ///
    /// Fails once an unterminated line grows past [`MAX_LINE_BYTES`]; the
    /// buffer is cleared and the body should be abandoned.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = Self::data_payload(&line) {
                payloads.push(data);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            let len = self.buffer.len();
            self.buffer = Vec::new();
            return Err(format!("event line exceeds {} bytes ({} buffered)", MAX_LINE_BYTES, len));
        }
        Ok(payloads)
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::data_payload(&line)
    }

    fn data_payload(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);

        // Comments (":") and event/id/retry fields carry no text.
        let data = line.strip_prefix("data:")?;
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data.trim().is_empty() {
            return None;
        }
        Some(data.to_string())
    }
}
