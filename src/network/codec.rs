//! Message framing
//!
//! Every message is a 24-byte header followed by the payload:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | network magic (little-endian)           |
//! | 4      | 12   | command name, ASCII, null-padded        |
//! | 16     | 4    | payload length (little-endian)          |
//! | 20     | 4    | first 4 bytes of double SHA-256(payload) |
//!
//! The decoder is resumable: it returns `Ok(None)` until a whole frame has
//! been buffered, so partial reads never block the reactor.

use crate::crypto::checksum;
use crate::network::message::{Command, Message, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 24;

/// Size of the command field
const COMMAND_SIZE: usize = 12;

/// Framing errors; all of them end the connection
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Bad network magic {found:#010x} (expected {expected:#010x})")]
    BadMagic { expected: u32, found: u32 },
    #[error("Checksum mismatch on {0} message")]
    BadChecksum(String),
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Command field is not null-padded ASCII")]
    BadCommand,
}

/// A complete frame whose checksum has been verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: Command,
    pub checksum: [u8; 4],
    pub payload: Bytes,
}

impl RawMessage {
    /// Decode the payload into a typed message
    pub fn into_message(self) -> Result<Message, crate::network::message::MessageError> {
        Message::decode(self.command, self.payload)
    }
}

/// Codec for magic-tagged, checksummed frames
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    magic: u32,
}

impl MessageCodec {
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }
}

fn parse_command(field: &[u8]) -> Result<Command, FrameError> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    let (name, padding) = field.split_at(end);
    if name.is_empty()
        || !name.iter().all(|b| b.is_ascii_graphic())
        || padding.iter().any(|b| *b != 0)
    {
        return Err(FrameError::BadCommand);
    }
    // All bytes checked ASCII above
    let name = String::from_utf8_lossy(name);
    Ok(Command::from_name(&name))
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        item.encode_payload(&mut payload);

        let command = item.command();
        let name = command.name().as_bytes();
        let name = &name[..name.len().min(COMMAND_SIZE)];

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32_le(self.magic);
        dst.put_slice(name);
        dst.put_bytes(0, COMMAND_SIZE - name.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = RawMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let found = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if found != self.magic {
            return Err(FrameError::BadMagic {
                expected: self.magic,
                found,
            });
        }

        let command = parse_command(&src[4..4 + COMMAND_SIZE])?;
        let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(len));
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_SIZE);
        header.advance(20);
        let expected = [header[0], header[1], header[2], header[3]];
        let payload = src.split_to(len).freeze();

        if checksum(&payload) != expected {
            return Err(FrameError::BadChecksum(command.to_string()));
        }

        Ok(Some(RawMessage {
            command,
            checksum: expected,
            payload,
        }))
    }
}

/// Blocking stream helpers for socket tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::network::message::NETWORK_MAGIC;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    /// Encode `msgs` back to back and write them in one call
    pub fn write_messages(stream: &mut TcpStream, msgs: Vec<Message>) {
        let mut codec = MessageCodec::new(NETWORK_MAGIC);
        let mut buf = BytesMut::new();
        for msg in msgs {
            codec.encode(msg, &mut buf).unwrap();
        }
        stream.write_all(&buf).unwrap();
    }

    /// Read exactly one message
    pub fn read_message(stream: &mut TcpStream) -> Message {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        let mut frame = BytesMut::from(&header[..]);
        frame.resize(HEADER_SIZE + len, 0);
        stream.read_exact(&mut frame[HEADER_SIZE..]).unwrap();
        MessageCodec::new(NETWORK_MAGIC)
            .decode(&mut frame)
            .unwrap()
            .unwrap()
            .into_message()
            .unwrap()
    }
}
