// src/stream.rs

//! Server-sent event decoding for `/chat/stream`.
//!
//! Network chunks do not line up with event frames, so bytes are buffered until
//! a newline completes a line. Each complete `data: <json>` line is one frame.
//! The caller sees the full accumulated content after every content frame, not
//! the individual fragment. Backends may send either deltas or the cumulative
//! reply so far; both accumulate to the same content.
//!
//! A content frame strictly longer than the accumulated text that starts with it
//! is taken as a cumulative resend and replaces the text. A genuine delta that
//! happens to have that shape collapses too: `"1"` then `"12"` ends as `"12"`,
//! not `"112"`. Every other frame is appended.

use crate::constants::DATA_PREFIX;
use crate::errors::{PalaverError, PalaverResult};
use futures::{Stream, StreamExt};
use log::{debug, trace};
use serde_json::Value;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = PalaverResult<Vec<u8>>> + Send>>;

/// An open streamed response plus the capability to stop reading it.
pub struct StreamHandle {
    chunks: ByteStream,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn new<S>(chunks: S) -> Self
    where
        S: Stream<Item = PalaverResult<Vec<u8>>> + Send + 'static,
    {
        Self {
            chunks: Box::pin(chunks),
            cancel: CancellationToken::new(),
        }
    }

    /// Stops the stream before its next read. Content already delivered stays.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Content(String),
    Done {
        conversation_id: Option<String>,
        message_id: Option<String>,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingFrame,
    FrameParsed,
    Done,
    Errored,
}

/// Parses one complete line. `None` means the line carries nothing we act on.
pub fn parse_frame(line: &str) -> Option<PalaverResult<Frame>> {
    let payload = line.strip_prefix(DATA_PREFIX)?;

    let json: Value = match serde_json::from_str(payload) {
        Ok(json) => json,
        Err(e) => return Some(Err(PalaverError::parse_error(payload, e.to_string()))),
    };

    if json.get("done").and_then(Value::as_bool) == Some(true) {
        return Some(Ok(Frame::Done {
            conversation_id: json
                .get("conversationId")
                .and_then(Value::as_str)
                .map(str::to_string),
            message_id: json
                .get("messageId")
                .and_then(Value::as_str)
                .map(str::to_string),
        }));
    }

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("An error occurred during streaming");
        return Some(Ok(Frame::Error(message.to_string())));
    }

    match json.get("content").and_then(Value::as_str) {
        Some(content) if !content.is_empty() => Some(Ok(Frame::Content(content.to_string()))),
        _ => None,
    }
}

/// Reassembles lines from arbitrarily split chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: DecoderState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: DecoderState::AwaitingFrame,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Appends a chunk and returns the frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line[..line.len() - 1], &mut frames);
        }
        frames
    }

    /// Flushes an unterminated trailing line once the source has ended.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut frames);
        }
        if self.state != DecoderState::Errored {
            self.state = DecoderState::Done;
        }
        frames
    }

    pub fn fail(&mut self) {
        self.state = DecoderState::Errored;
    }

    fn decode_line(&mut self, line: &[u8], frames: &mut Vec<Frame>) {
        let line = String::from_utf8_lossy(line);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        trace!("SSE line: {:?}", line);

        match parse_frame(line) {
            Some(Ok(frame)) => {
                self.state = DecoderState::FrameParsed;
                frames.push(frame);
            }
            Some(Err(e)) => debug!("Skipping frame: {}", e),
            None => {}
        }
    }
}

/// Everything a completed stream produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamResult {
    pub content: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, Default)]
struct Accumulator {
    content: String,
    conversation_id: Option<String>,
    message_id: Option<String>,
}

impl Accumulator {
    fn apply<F>(&mut self, frame: Frame, on_update: &mut F) -> PalaverResult<()>
    where
        F: FnMut(&str),
    {
        match frame {
            Frame::Content(fragment) => {
                // A frame that extends everything received so far is a resend of
                // the whole reply, not a delta.
                if !self.content.is_empty()
                    && fragment.len() > self.content.len()
                    && fragment.starts_with(&self.content)
                {
                    self.content = fragment;
                } else {
                    self.content.push_str(&fragment);
                }
                on_update(&self.content);
            }
            Frame::Done {
                conversation_id,
                message_id,
            } => {
                self.conversation_id = conversation_id;
                self.message_id = message_id;
            }
            Frame::Error(message) => return Err(PalaverError::backend_error(message)),
        }
        Ok(())
    }

    fn into_result(self) -> StreamResult {
        StreamResult {
            content: self.content,
            conversation_id: self.conversation_id,
            message_id: self.message_id,
        }
    }
}

/// Reads `handle` to the end, calling `on_update` with the accumulated content
/// after every content frame.
///
/// Cancellation is checked before each read and raced against it. A cancelled
/// stream returns [`PalaverError::Cancelled`] carrying the content gathered so
/// far; transport failures and backend error frames return their own errors.
pub async fn decode_stream<F>(handle: StreamHandle, mut on_update: F) -> PalaverResult<StreamResult>
where
    F: FnMut(&str),
{
    let StreamHandle { mut chunks, cancel } = handle;
    let mut decoder = FrameDecoder::new();
    let mut acc = Accumulator::default();

    loop {
        if cancel.is_cancelled() {
            debug!("Stream cancelled after {} bytes of content", acc.content.len());
            return Err(PalaverError::Cancelled {
                content: acc.content,
            });
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => continue,
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                for frame in decoder.push(&bytes) {
                    if let Err(e) = acc.apply(frame, &mut on_update) {
                        decoder.fail();
                        return Err(e);
                    }
                }
            }
            Some(Err(e)) => {
                decoder.fail();
                return Err(e);
            }
            None => {
                for frame in decoder.finish() {
                    if let Err(e) = acc.apply(frame, &mut on_update) {
                        decoder.fail();
                        return Err(e);
                    }
                }
                return Ok(acc.into_result());
            }
        }
    }
}
