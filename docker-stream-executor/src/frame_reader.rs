//! Splits a response byte stream into [`StreamFrame`]s.
//!
//! The reader is a [`FramedRead`] over the body with a [`FrameCodec`] picked by
//! the endpoint's [`Framing`]. It is lazy and finite. Once the body closes it
//! yields a single [`StreamFrame::EndOfStream`], after a fatal error it yields
//! nothing more.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf as _, Bytes, BytesMut};
use futures_util::{Stream, StreamExt as _, stream::BoxStream};
use tokio_util::{
    codec::{Decoder, FramedRead},
    io::StreamReader,
};

use crate::{
    FrameError,
    frames::{ErrorEvent, ErrorPayload, OutputChannel, ProgressEvent, RawChunk, StreamFrame},
};

const MULTIPLEX_HEADER_LEN: usize = 8;

/// How a response body is cut into frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// Concatenated or newline delimited JSON objects
    #[default]
    Json,
    /// Chunks as they arrive
    Raw,
    /// Newline delimited chunks
    Lines,
    /// 8 byte header (channel, padding, big endian length) followed by the payload
    Multiplexed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    framing: Framing,
    // Json only: bytes at the front of the buffer already searched for a newline
    scanned: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            scanned: 0,
        }
    }

    fn decode_frame(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<StreamFrame>, FrameError> {
        match self.framing {
            Framing::Json => self.decode_json(src, eof),
            Framing::Raw => Ok(take_raw(src)),
            Framing::Lines => Ok(decode_line(src, eof)),
            Framing::Multiplexed => decode_multiplexed(src, eof),
        }
    }

    /// Bytes of a frame that was started but not completed.
    fn pending(&self, buffer: &BytesMut) -> usize {
        match self.framing {
            Framing::Json => buffer
                .iter()
                .skip_while(|byte| byte.is_ascii_whitespace())
                .count(),
            _ => buffer.len(),
        }
    }

    /// Parsing waits for a newline or the end of the body.
    fn decode_json(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<StreamFrame>, FrameError> {
        let Some(start) = src.iter().position(|byte| !byte.is_ascii_whitespace()) else {
            src.clear();
            self.scanned = 0;
            return Ok(None);
        };
        src.advance(start);
        self.scanned = self.scanned.saturating_sub(start);

        if !eof && !src[self.scanned..].contains(&b'\n') {
            self.scanned = src.len();
            return Ok(None);
        }

        let (next, consumed) = {
            let mut values =
                serde_json::Deserializer::from_slice(&src[..]).into_iter::<serde_json::Value>();
            let next = values.next();
            (next, values.byte_offset())
        };

        match next {
            Some(Ok(value)) => {
                src.advance(consumed);
                self.scanned = 0;
                Ok(Some(frame_from_value(value)))
            }
            Some(Err(err)) if err.is_eof() => {
                if eof {
                    Err(FrameError::Truncated { pending: src.len() })
                } else {
                    // a frame spanning several lines
                    self.scanned = src.len();
                    Ok(None)
                }
            }
            Some(Err(err)) => {
                // resynchronize on the next line
                let skipped = match src.iter().position(|byte| *byte == b'\n') {
                    Some(newline) => src.split_to(newline + 1),
                    None if eof => src.split(),
                    None => {
                        self.scanned = src.len();
                        return Ok(None);
                    }
                };
                self.scanned = 0;
                tracing::debug!(
                    error = %err,
                    skipped = skipped.len(),
                    "Skipping malformed frame"
                );
                Ok(Some(StreamFrame::Error(ErrorEvent::malformed(format!(
                    "{err}: {}",
                    String::from_utf8_lossy(&skipped).trim()
                )))))
            }
            None => Ok(None),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = StreamFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src, true)
    }
}

fn frame_from_value(value: serde_json::Value) -> StreamFrame {
    if let Ok(payload) = serde_json::from_value::<ErrorPayload>(value.clone())
        && let Some(event) = payload.into_event()
    {
        return StreamFrame::Error(event);
    }

    match serde_json::from_value::<ProgressEvent>(value) {
        Ok(event) => StreamFrame::Progress(event),
        Err(err) => StreamFrame::Error(ErrorEvent::malformed(format!(
            "unexpected frame shape: {err}"
        ))),
    }
}

fn take_raw(src: &mut BytesMut) -> Option<StreamFrame> {
    if src.is_empty() {
        return None;
    }

    Some(StreamFrame::Raw(RawChunk::new(
        OutputChannel::Unknown,
        src.split().freeze(),
    )))
}

fn decode_line(src: &mut BytesMut, eof: bool) -> Option<StreamFrame> {
    match src.iter().position(|byte| *byte == b'\n') {
        Some(newline) => Some(StreamFrame::Raw(RawChunk::new(
            OutputChannel::Unknown,
            src.split_to(newline + 1).freeze(),
        ))),
        None if eof => take_raw(src),
        None => None,
    }
}

fn decode_multiplexed(src: &mut BytesMut, eof: bool) -> Result<Option<StreamFrame>, FrameError> {
    let incomplete = |src: &BytesMut| {
        if eof && !src.is_empty() {
            Err(FrameError::Truncated { pending: src.len() })
        } else {
            Ok(None)
        }
    };

    if src.len() < MULTIPLEX_HEADER_LEN {
        return incomplete(src);
    }

    let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
    if src.len() < MULTIPLEX_HEADER_LEN + length {
        src.reserve(MULTIPLEX_HEADER_LEN + length - src.len());
        return incomplete(src);
    }

    let channel = OutputChannel::from(src[0]);
    src.advance(MULTIPLEX_HEADER_LEN);
    let data = src.split_to(length).freeze();

    Ok(Some(StreamFrame::Raw(RawChunk::new(channel, data))))
}

/// A finite, non-restartable stream of frames read from a response body.
pub struct FrameReader {
    inner: FramedRead<StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>, FrameCodec>,
    finished: bool,
}

impl FrameReader {
    pub fn new<S>(body: S, framing: Framing) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: FramedRead::new(StreamReader::new(body.boxed()), FrameCodec::new(framing)),
            finished: false,
        }
    }

    pub fn framing(&self) -> Framing {
        self.inner.decoder().framing
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("framing", &self.framing())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Stream for FrameReader {
    type Item = Result<StreamFrame, FrameError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let next = ready!(self.inner.poll_next_unpin(cx));
        let item = match next {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(FrameError::Io(err))) => {
                self.finished = true;
                // a connection cut mid-frame surfaces as a body error, not as EOF
                let pending = self.inner.decoder().pending(self.inner.read_buffer());
                if pending > 0 {
                    tracing::debug!(error = %err, pending, "Response body failed inside a frame");
                    Err(FrameError::Truncated { pending })
                } else {
                    Err(FrameError::Io(err))
                }
            }
            Some(Err(err)) => {
                self.finished = true;
                Err(err)
            }
            None => {
                self.finished = true;
                Ok(StreamFrame::EndOfStream)
            }
        };

        Poll::Ready(Some(item))
    }
}
