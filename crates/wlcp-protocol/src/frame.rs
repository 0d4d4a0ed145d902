// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for QUIC stream framing.
//!
//! Each QUIC stream carries one provisioner call with the following frame format:
//! - 4 bytes: message length (big-endian)
//! - 2 bytes: message type
//! - N bytes: protobuf payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proto::RpcError;

/// Maximum frame size (1 MB). Provisioner messages are small.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Request message
    Request = 1,
    /// Response message
    Response = 2,
    /// The server could not produce a response; payload is an [`RpcError`]
    Error = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("unexpected message type: {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("remote error ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new request frame
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    /// Create a new response frame
    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    /// Create an error frame
    pub fn error(code: &str, message: impl Into<String>) -> Result<Self, FrameError> {
        Self::new(
            MessageType::Error,
            &RpcError {
                code: code.to_string(),
                message: message.into(),
            },
        )
    }

    /// Create a new frame with the given type and message
    pub fn new<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a protobuf message
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Decode a response frame, turning error frames into [`FrameError::Remote`].
    pub fn into_response<M: Message + Default>(self) -> Result<M, FrameError> {
        match self.message_type {
            MessageType::Response => self.decode(),
            MessageType::Error => {
                let err: RpcError = self.decode()?;
                Err(FrameError::Remote {
                    code: err.code,
                    message: err.message,
                })
            }
            other => Err(FrameError::UnexpectedMessageType(other)),
        }
    }

    /// Wire bytes: header followed by payload.
    pub fn encode(&self) -> Bytes {
        let header = FrameHeader {
            length: self.payload.len(),
            message_type: self.message_type,
        };
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        header.put(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a complete frame out of `bytes`.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(truncated("incomplete frame header"));
        }
        let header = FrameHeader::parse(&bytes.split_to(HEADER_SIZE))?;
        if bytes.len() < header.length {
            return Err(truncated("incomplete frame payload"));
        }
        Ok(Self {
            message_type: header.message_type,
            payload: bytes.split_to(header.length),
        })
    }
}

/// Length and type prefix of every frame.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: usize,
    message_type: MessageType,
}

impl FrameHeader {
    fn parse(mut raw: &[u8]) -> Result<Self, FrameError> {
        let length = raw.get_u32() as usize;
        let message_type = MessageType::try_from(raw.get_u16())?;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        Ok(Self {
            length,
            message_type,
        })
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length as u32);
        buf.put_u16(self.message_type as u16);
    }
}

fn truncated(what: &'static str) -> FrameError {
    FrameError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, what))
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read one frame. A stream that ends before any header byte is
/// [`FrameError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut raw = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut raw).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::ConnectionClosed,
            _ => e.into(),
        });
    }
    let header = FrameHeader::parse(&raw)?;

    let mut payload = BytesMut::zeroed(header.length);
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        message_type: header.message_type,
        payload: payload.freeze(),
    })
}

/// Framed codec for a single request/response exchange on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Send a request and wait for a response
    pub async fn request<Req: Message, Resp: Message + Default>(
        &mut self,
        request: &Req,
    ) -> Result<Resp, FrameError> {
        write_frame(&mut self.stream, &Frame::request(request)?).await?;
        read_frame(&mut self.stream).await?.into_response()
    }

    /// Read the next request frame
    pub async fn next_request<Req: Message + Default>(&mut self) -> Result<Req, FrameError> {
        let frame = read_frame(&mut self.stream).await?;
        match frame.message_type {
            MessageType::Request => frame.decode(),
            other => Err(FrameError::UnexpectedMessageType(other)),
        }
    }

    /// Send a response
    pub async fn respond<Resp: Message>(&mut self, response: &Resp) -> Result<(), FrameError> {
        write_frame(&mut self.stream, &Frame::response(response)?).await
    }

    /// Send an error frame
    pub async fn respond_error(&mut self, code: &str, message: &str) -> Result<(), FrameError> {
        write_frame(&mut self.stream, &Frame::error(code, message)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{EchoRequest, EchoResponse, WorkspaceRequest};

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Request as u16, 1);
        assert_eq!(MessageType::Response as u16, 2);
        assert_eq!(MessageType::Error as u16, 3);
    }

    #[test]
    fn test_invalid_message_type() {
        let err = MessageType::try_from(7).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessageType(7)));
    }

    #[test]
    fn test_frame_encode_decode() {
        let msg = WorkspaceRequest { workspace_id: 42 };
        let frame = Frame::request(&msg).unwrap();
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();

        assert_eq!(decoded.message_type, MessageType::Request);
        let back: WorkspaceRequest = decoded.decode().unwrap();
        assert_eq!(back.workspace_id, 42);
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::response(&EchoResponse {
            message: "ping".to_string(),
        })
        .unwrap();
        let encoded = frame.encode();

        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, frame.payload.len());
        assert_eq!(u16::from_be_bytes([encoded[4], encoded[5]]), 2);
        assert_eq!(encoded.len(), HEADER_SIZE + len);
    }

    #[test]
    fn test_incomplete_header() {
        let result = Frame::decode_from_bytes(Bytes::from_static(&[0, 0, 0]));
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_incomplete_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u16(1);
        buf.put_slice(&[1, 2, 3]);
        let result = Frame::decode_from_bytes(buf.freeze());
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u16(1);
        let result = Frame::decode_from_bytes(buf.freeze());
        assert!(matches!(result, Err(FrameError::FrameTooLarge(_))));
    }

    #[test]
    fn test_error_frame_becomes_remote_error() {
        let frame = Frame::error("bad_request", "no payload").unwrap();
        let result: Result<EchoResponse, _> = frame.into_response();
        match result {
            Err(FrameError::Remote { code, message }) => {
                assert_eq!(code, "bad_request");
                assert_eq!(message, "no payload");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_request_frame_is_not_a_response() {
        let frame = Frame::request(&EchoRequest::default()).unwrap();
        let result: Result<EchoResponse, _> = frame.into_response();
        assert!(matches!(
            result,
            Err(FrameError::UnexpectedMessageType(MessageType::Request))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_on_closed_stream() {
        let mut empty: &[u8] = &[];
        let result = read_frame(&mut empty).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_framed_stream_exchange() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = FramedStream::new(client);
        let mut server = FramedStream::new(server);

        let serve = tokio::spawn(async move {
            let req: EchoRequest = server.next_request().await.unwrap();
            server
                .respond(&EchoResponse {
                    message: req.message,
                })
                .await
                .unwrap();
        });

        let resp: EchoResponse = client
            .request(&EchoRequest {
                message: "hello".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.message, "hello");
        serve.await.unwrap();
    }
}
