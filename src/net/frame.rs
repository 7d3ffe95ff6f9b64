//! Channel envelope
//!
//! Every frame is `[u32 length][u8 kind][u64 correlation id][body]`, all
//! integers big-endian, where `length` counts everything after itself.
//! Bodies of requests and responses are opaque to this layer.

use crate::errors::{ChannelError, FrameError};
use crate::routing::ChannelTarget;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Largest accepted frame, length prefix excluded
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;
const ENVELOPE_HEADER: usize = 1 + 8;

const KIND_HELLO: u8 = 0x01;
const KIND_REQUEST: u8 = 0x02;
const KIND_RESPONSE: u8 = 0x03;
const KIND_ERROR: u8 = 0x04;
const KIND_PING: u8 = 0x05;
const KIND_PONG: u8 = 0x06;

const TARGET_GENERIC: u8 = 0;
const TARGET_PARTITION: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// First frame on every channel, client to member
    Hello { client_id: Uuid, target: ChannelTarget },
    Request { correlation_id: u64, payload: Bytes },
    Response { correlation_id: u64, payload: Bytes },
    ErrorResponse { correlation_id: u64, message: String },
    Ping,
    Pong,
}

impl Frame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::ErrorResponse { .. } => "error-response",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Bytes {
        let (kind, correlation_id) = match self {
            Frame::Hello { .. } => (KIND_HELLO, 0),
            Frame::Request { correlation_id, .. } => (KIND_REQUEST, *correlation_id),
            Frame::Response { correlation_id, .. } => (KIND_RESPONSE, *correlation_id),
            Frame::ErrorResponse { correlation_id, .. } => (KIND_ERROR, *correlation_id),
            Frame::Ping => (KIND_PING, 0),
            Frame::Pong => (KIND_PONG, 0),
        };

        let mut body = BytesMut::new();
        match self {
            Frame::Hello { client_id, target } => {
                match target {
                    ChannelTarget::Generic => {
                        body.put_u8(TARGET_GENERIC);
                        body.put_u32(0);
                    }
                    ChannelTarget::Partition(index) => {
                        body.put_u8(TARGET_PARTITION);
                        body.put_u32(*index as u32);
                    }
                }
                body.put_slice(client_id.as_bytes());
            }
            Frame::Request { payload, .. } | Frame::Response { payload, .. } => {
                body.put_slice(payload);
            }
            Frame::ErrorResponse { message, .. } => body.put_slice(message.as_bytes()),
            Frame::Ping | Frame::Pong => {}
        }

        let mut out = BytesMut::with_capacity(LENGTH_PREFIX + ENVELOPE_HEADER + body.len());
        out.put_u32((ENVELOPE_HEADER + body.len()) as u32);
        out.put_u8(kind);
        out.put_u64(correlation_id);
        out.put_slice(&body);
        out.freeze()
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds only part of a frame.
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if len < ENVELOPE_HEADER {
            return Err(FrameError::Truncated(len));
        }
        if buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let mut frame = buf.split_to(len).freeze();
        let kind = frame.get_u8();
        let correlation_id = frame.get_u64();

        let decoded = match kind {
            KIND_HELLO => decode_hello(frame)?,
            KIND_REQUEST => Frame::Request { correlation_id, payload: frame },
            KIND_RESPONSE => Frame::Response { correlation_id, payload: frame },
            KIND_ERROR => Frame::ErrorResponse {
                correlation_id,
                message: String::from_utf8(frame.to_vec()).map_err(|e| {
                    FrameError::MalformedBody { kind: "error-response", reason: e.to_string() }
                })?,
            },
            KIND_PING => Frame::Ping,
            KIND_PONG => Frame::Pong,
            other => return Err(FrameError::UnknownKind(other)),
        };
        Ok(Some(decoded))
    }
}

fn decode_hello(mut body: Bytes) -> Result<Frame, FrameError> {
    if body.len() != 1 + 4 + 16 {
        return Err(FrameError::MalformedBody {
            kind: "hello",
            reason: format!("expected 21 bytes, got {}", body.len()),
        });
    }
    let tag = body.get_u8();
    let index = body.get_u32() as usize;
    let target = match tag {
        TARGET_GENERIC => ChannelTarget::Generic,
        TARGET_PARTITION => ChannelTarget::Partition(index),
        other => {
            return Err(FrameError::MalformedBody {
                kind: "hello",
                reason: format!("unknown channel tag {}", other),
            })
        }
    };
    let client_id = Uuid::from_slice(&body).map_err(|e| FrameError::MalformedBody {
        kind: "hello",
        reason: e.to_string(),
    })?;
    Ok(Frame::Hello { client_id, target })
}

/// Read the next frame, buffering partial reads in `buf`.
///
/// `Ok(None)` means the peer closed the stream on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match Frame::try_decode(buf) {
            Ok(Some(frame)) => return Ok(Some(frame)),
            Ok(None) => {}
            Err(e) => return Err(ChannelError::ProtocolViolation(e.to_string())),
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            )));
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
