//! Message framing shared by the WebSocket transports.
//!
//! Binary messages carry length-prefixed MessagePack frames, possibly
//! several per message. Text messages carry exactly one JSON frame. The
//! encoding of the last inbound message decides how replies are encoded.

use bytes::{Bytes, BytesMut};
use ringline_protocol::{codec, Encoding, Frame, ProtocolError};

/// An encoded outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
}

/// Per-connection framing state.
#[derive(Debug)]
pub struct FrameCodec {
    read_buffer: BytesMut,
    encoding: Encoding,
    max_message_size: usize,
}

impl FrameCodec {
    /// Create a codec that rejects inbound messages above `max_message_size`.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            read_buffer: BytesMut::with_capacity(4096),
            encoding: Encoding::default(),
            max_message_size,
        }
    }

    /// Encoding replies are sent in.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decode a frame left over from an earlier binary message.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered data is not a valid frame; the
    /// buffer is discarded.
    pub fn next_buffered(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.read_buffer.is_empty() {
            return Ok(None);
        }
        self.decode_buffer()
    }

    /// Feed a binary message. Returns the first complete frame, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is too large or not a valid frame.
    pub fn feed_binary(&mut self, data: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        if data.len() > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }
        self.encoding = Encoding::MessagePack;
        self.read_buffer.extend_from_slice(data);
        self.decode_buffer()
    }

    /// Decode a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is too large or not a valid frame.
    pub fn feed_text(&mut self, text: &str) -> Result<Frame, ProtocolError> {
        if text.len() > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }
        self.encoding = Encoding::Json;
        codec::decode_json(text)
    }

    fn decode_buffer(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match codec::decode_from(&mut self.read_buffer) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                // A bad frame poisons everything behind it.
                self.read_buffer.clear();
                Err(e)
            }
        }
    }

    /// Encode a frame in the connection's current encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, frame: &Frame) -> Result<Outbound, ProtocolError> {
        match self.encoding {
            Encoding::MessagePack => Ok(Outbound::Binary(codec::encode(frame)?)),
            Encoding::Json => Ok(Outbound::Text(codec::encode_json(frame)?)),
        }
    }
}
