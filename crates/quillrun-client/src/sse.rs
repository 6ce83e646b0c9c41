//! Server-sent events decoding for generation streams.
//!
//! Frames are separated by a blank line. Network chunks may split a frame
//! anywhere, so bytes are buffered until a full frame is available.

use std::fmt::Display;
use std::pin::Pin;

use futures_util::stream::{self, Stream, StreamExt};
use tracing::debug;

use quillrun_core::{GenerationEvent, ServiceError};

/// One SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// All `data:` lines joined with newlines.
    pub data: String,
}

/// Incremental SSE frame parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the network.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Terminate a trailing frame the server did not close with a blank line.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() && !self.buffer.ends_with(b"\n\n") {
            self.buffer.extend_from_slice(b"\n\n");
        }
    }

    /// Take the next complete frame. Comment-only and empty frames are
    /// skipped.
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            let end = self.buffer.windows(2).position(|w| w == b"\n\n")?;
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&raw[..end]);

            let mut event = None;
            let mut data: Vec<&str> = Vec::new();
            for line in text.lines() {
                if line.starts_with(':') {
                    continue;
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                match field {
                    "event" => event = Some(value.to_string()),
                    "data" => data.push(value),
                    _ => {}
                }
            }

            if event.is_none() && data.is_empty() {
                continue;
            }
            return Some(SseFrame {
                event,
                data: data.join("\n"),
            });
        }
    }
}

const EVENT_KINDS: [&str; 5] = ["start", "progress", "chunk", "done", "error"];

/// Decode a frame into a generation event. Frames of other kinds, such as
/// keep-alives, yield `None`.
pub fn decode_frame(frame: &SseFrame) -> Result<Option<GenerationEvent>, ServiceError> {
    if let Some(kind) = &frame.event {
        if !EVENT_KINDS.contains(&kind.as_str()) {
            debug!(event = %kind, "Skipping SSE frame");
            return Ok(None);
        }
    }
    if frame.data.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&frame.data)
        .map(Some)
        .map_err(|e| ServiceError::Serialization(format!("bad SSE payload: {}", e)))
}

struct Decoder<S> {
    inner: Pin<Box<S>>,
    parser: SseParser,
    closed: bool,
    failed: bool,
}

/// Turn a byte stream into a stream of generation events.
///
/// The stream ends after the first transport or decode error.
pub fn event_stream<S, B, E>(
    bytes: S,
) -> impl Stream<Item = Result<GenerationEvent, ServiceError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let decoder = Decoder {
        inner: Box::pin(bytes),
        parser: SseParser::new(),
        closed: false,
        failed: false,
    };

    stream::unfold(decoder, |mut st| async move {
        if st.failed {
            return None;
        }
        loop {
            if let Some(frame) = st.parser.next_frame() {
                match decode_frame(&frame) {
                    Ok(Some(event)) => return Some((Ok(event), st)),
                    Ok(None) => continue,
                    Err(e) => {
                        st.failed = true;
                        return Some((Err(e), st));
                    }
                }
            }
            if st.closed {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.parser.push(chunk.as_ref()),
                Some(Err(e)) => {
                    st.failed = true;
                    return Some((Err(ServiceError::Stream(e.to_string())), st));
                }
                None => {
                    st.closed = true;
                    st.parser.finish();
                }
            }
        }
    })
}
