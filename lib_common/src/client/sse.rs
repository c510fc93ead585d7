//! Incremental Server-Sent-Events decoder.
//!
//! Feed it raw body chunks as they arrive; it yields complete frames. Chunk
//! boundaries may fall anywhere, including inside a UTF-8 sequence or between
//! `\r` and `\n`.

use bytes::{Buf, BytesMut};

/// One dispatched SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, `message` when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Stateful line parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drops any partial frame, e.g. before reusing the decoder on a new
    /// connection.
    pub fn reset(&mut self) {
        self.buffer.advance(self.buffer.len());
        self.event = None;
        self.data.clear();
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
            // id / retry and unknown fields carry nothing we use.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: weather-da").is_empty());
        assert!(decoder.push(b"ta\r\ndata: {\"deviceId\":").is_empty());
        let frames = decoder.push(b"1}\r\n\r\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "weather-data".into(),
                data: "{\"deviceId\":1}".into()
            }]
        );
    }

    #[test]
    fn comments_and_empty_frames_are_skipped() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\nevent: status\n\ndata: a\ndata: b\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: status\ndata: half");
        decoder.reset();
        let frames = decoder.push(b"data: whole\n\n");
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "whole");
    }
}
