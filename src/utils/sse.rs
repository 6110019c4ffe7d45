/// Incremental parser for `text/event-stream` payloads arriving as arbitrary
/// byte chunks. State is kept between chunks so events split across network
/// reads parse correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

/// One parsed server-sent event. Only the fields the LLM providers use are
/// retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(line) = self.take_line() {
            if line.is_empty() {
                if let Some(event) = self.flush_event() {
                    events.push(event);
                }
            } else {
                self.accept_line(&line);
            }
        }
        events
    }

    /// Removes and returns the next full line from the buffer. `\n`, `\r\n`
    /// and lone `\r` all terminate a line. A `\r` as the last buffered byte
    /// stays put until the next chunk shows whether a `\n` follows it.
    fn take_line(&mut self) -> Option<String> {
        let end = self
            .buffer
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')?;
        let terminator_len = if self.buffer[end] == b'\r' {
            match self.buffer.get(end + 1) {
                Some(b'\n') => 2,
                Some(_) => 1,
                None => return None,
            }
        } else {
            1
        };
        let line = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        self.buffer.drain(..end + terminator_len);
        Some(line)
    }

    fn accept_line(&mut self, line: &str) {
        // A leading ':' marks an SSE comment line (keepalives).
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_event(&mut self) -> Option<SseEvent> {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: self.event_name.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}
