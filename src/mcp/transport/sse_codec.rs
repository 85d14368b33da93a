//! Incremental `text/event-stream` decoding.

use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::ServerMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, `None` for the default "message" type.
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_message(&self) -> bool {
        self.event.as_deref().is_none_or(|event| event == "message")
    }
}

/// Splits arbitrary byte chunks into lines and folds them into events.
///
/// Events are dispatched on a blank line, or on `finish` for a trailing event
/// the server never terminated.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line = String::from_utf8_lossy(&self.buffer[search_index..line_end]).into_owned();
            if let Some(event) = self.feed_line(&line) {
                events.push(event);
            }

            search_index = newline_index + 1;
        }

        if search_index > 0 {
            self.buffer.drain(..search_index);
        }
        events
    }

    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            if let Some(event) = self.feed_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.trim().is_empty() {
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
            "event" => self.event = Some(value.trim().to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn decode_server_message(payload: &str) -> Result<Option<ServerMessage>, String> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| err.to_string())
}

/// Reads an event-stream response body until the first response or error
/// message arrives.
pub async fn next_sse_server_message(response: reqwest::Response) -> Result<ServerMessage, String> {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for event in decoder.push(&chunk) {
            if let Some(message) = terminal_message(&event)? {
                return Ok(message);
            }
        }
    }

    if let Some(event) = decoder.finish() {
        if let Some(message) = terminal_message(&event)? {
            return Ok(message);
        }
    }

    Err("Empty event-stream response.".to_string())
}

fn terminal_message(event: &SseEvent) -> Result<Option<ServerMessage>, String> {
    if !event.is_message() {
        return Ok(None);
    }
    Ok(decode_server_message(&event.data)?.filter(|message| {
        matches!(
            message,
            ServerMessage::Response(_) | ServerMessage::Error(_)
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: one").is_empty());
        assert_eq!(
            decoder.push(b"\n\n"),
            vec![SseEvent {
                event: None,
                data: "one".to_string()
            }]
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_keeps_event_names_and_joins_data_lines() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"event: endpoint\r\ndata: /messages?session=1\r\n\r\n: keepalive\n\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?session=1");
        assert!(!events[0].is_message());
        assert_eq!(events[1].data, "a\nb");
        assert!(events[1].is_message());
    }

    #[test]
    fn unterminated_event_is_flushed_on_finish() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: message\ndata: {\"x\":1}").is_empty());
        let event = decoder.finish().expect("trailing event");
        assert_eq!(event.data, "{\"x\":1}");
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }
}
