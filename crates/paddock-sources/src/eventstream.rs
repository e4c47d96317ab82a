//! Incremental `text/event-stream` parser.
//!
//! Chunks from the HTTP body arrive at arbitrary boundaries, so bytes are
//! buffered until a full line is available. Lines end in LF or CRLF.
//! Comment lines (leading `:`) are skipped, consecutive `data:` lines are
//! joined with `\n`, and a blank line dispatches the event.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if the event had one.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

/// Reassembles events across body chunks.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamParser {
    /// Feed one body chunk and collect every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            // `id` and `retry` carry nothing the relay needs.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_split_across_chunks() {
        let mut parser = EventStreamParser::default();
        assert!(parser.feed(b"event: upd").is_empty());
        assert!(parser.feed(b"ate\ndata: {\"LapCount\":").is_empty());
        let events = parser.feed(b"{\"CurrentLap\":3}}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("update".to_owned()),
                data: r#"{"LapCount":{"CurrentLap":3}}"#.to_owned(),
            }]
        );
    }

    #[test]
    fn crlf_comments_and_multiline_data() {
        let mut parser = EventStreamParser::default();
        let events = parser.feed(b":keepalive\r\n\r\ndata: line one\r\ndata:line two\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events.first().map(|e| e.data.as_str()), Some("line one\nline two"));
        assert_eq!(events.first().and_then(|e| e.event.clone()), None);
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut parser = EventStreamParser::default();
        let events = parser.feed(b"event: initial\ndata: {}\n\nevent: update\ndata: {\"a\":1}\n\n");
        let names: Vec<_> = events.iter().map(|e| e.event.as_deref()).collect();
        assert_eq!(names, vec![Some("initial"), Some("update")]);
    }

    #[test]
    fn blank_line_without_data_dispatches_nothing() {
        let mut parser = EventStreamParser::default();
        assert!(parser.feed(b"event: orphan\n\n").is_empty());
        let events = parser.feed(b"data: x\n\n");
        assert_eq!(events.first().and_then(|e| e.event.clone()), None);
    }
}
