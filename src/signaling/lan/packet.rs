//! Plaintext layout of LAN discovery packets
//!
//! ```text
//! u16 length | u16 packet ID | u64 sender | 8 reserved | body
//! ```
//!
//! All integers are little-endian. `length` counts the bytes after itself.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::protocol::NetworkId;

pub const ID_REQUEST: u16 = 0;
pub const ID_RESPONSE: u16 = 1;
pub const ID_MESSAGE: u16 = 2;

/// Packet ID, sender and reserved bytes
pub const HEADER_SIZE: usize = 18;

/// Largest text carried by one `Message` packet
pub const MAX_MESSAGE_SIZE: usize = 10_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,

    #[error("length field {declared} exceeds {available} available bytes")]
    Length { declared: usize, available: usize },

    #[error("unknown packet ID {0}")]
    UnknownId(u16),

    #[error("invalid hex in response: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("message text is not UTF-8")]
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Asks every host on the subnet to respond
    Request,
    /// Server data blob of a host, hex-encoded on the wire
    Response { data: Vec<u8> },
    /// Signal text or a `Ping` keep-alive for one recipient
    Message { recipient: NetworkId, data: String },
}

impl Packet {
    pub fn id(&self) -> u16 {
        match self {
            Self::Request => ID_REQUEST,
            Self::Response { .. } => ID_RESPONSE,
            Self::Message { .. } => ID_MESSAGE,
        }
    }

    fn write_body(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Request => {}
            Self::Response { data } => {
                let encoded = hex::encode(data);
                buf.put_u32_le(encoded.len() as u32);
                buf.put_slice(encoded.as_bytes());
            }
            Self::Message { recipient, data } => {
                buf.put_u64_le(*recipient);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data.as_bytes());
            }
        }
    }
}

/// Encode `packet` sent by `sender` into its plaintext form
pub fn marshal(packet: &Packet, sender: NetworkId) -> Vec<u8> {
    let mut rest = Vec::with_capacity(HEADER_SIZE + 64);
    rest.put_u16_le(packet.id());
    rest.put_u64_le(sender);
    rest.put_bytes(0, 8);
    packet.write_body(&mut rest);

    let mut plaintext = Vec::with_capacity(2 + rest.len());
    plaintext.put_u16_le(rest.len() as u16);
    plaintext.extend_from_slice(&rest);
    plaintext
}

/// Decode a plaintext packet into its sender and body
pub fn unmarshal(mut plaintext: &[u8]) -> Result<(NetworkId, Packet), PacketError> {
    if plaintext.remaining() < 2 {
        return Err(PacketError::Truncated);
    }
    let declared = plaintext.get_u16_le() as usize;
    if declared > plaintext.remaining() {
        return Err(PacketError::Length {
            declared,
            available: plaintext.remaining(),
        });
    }
    let mut buf = &plaintext[..declared];

    if buf.remaining() < HEADER_SIZE {
        return Err(PacketError::Truncated);
    }
    let id = buf.get_u16_le();
    let sender = buf.get_u64_le();
    // Reserved, written as zero
    buf.advance(8);

    let packet = match id {
        ID_REQUEST => Packet::Request,
        ID_RESPONSE => {
            let encoded = read_prefixed(&mut buf)?;
            Packet::Response {
                data: hex::decode(encoded)?,
            }
        }
        ID_MESSAGE => {
            if buf.remaining() < 8 {
                return Err(PacketError::Truncated);
            }
            let recipient = buf.get_u64_le();
            let text = read_prefixed(&mut buf)?;
            Packet::Message {
                recipient,
                data: String::from_utf8(text.to_vec()).map_err(|_| PacketError::Utf8)?,
            }
        }
        other => return Err(PacketError::UnknownId(other)),
    };

    Ok((sender, packet))
}

fn read_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], PacketError> {
    if buf.remaining() < 4 {
        return Err(PacketError::Truncated);
    }
    let len = buf.get_u32_le() as usize;
    if len > buf.remaining() {
        return Err(PacketError::Truncated);
    }
    let slice: &'a [u8] = *buf;
    let (data, rest) = slice.split_at(len);
    *buf = rest;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let plaintext = marshal(&Packet::Request, 0x0102030405060708);
        assert_eq!(plaintext.len(), 2 + HEADER_SIZE);
        assert_eq!(&plaintext[..2], &(HEADER_SIZE as u16).to_le_bytes());
        assert_eq!(&plaintext[2..4], &[0, 0]);
        assert_eq!(&plaintext[4..12], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&plaintext[12..20], &[0; 8]);

        assert_eq!(
            unmarshal(&plaintext).unwrap(),
            (0x0102030405060708, Packet::Request)
        );
    }

    #[test]
    fn test_response_is_hex_encoded() {
        let packet = Packet::Response {
            data: b"{\"worldName\":\"x\"}".to_vec(),
        };
        let plaintext = marshal(&packet, 5);

        let body = &plaintext[2 + HEADER_SIZE..];
        let encoded = hex::encode(b"{\"worldName\":\"x\"}");
        assert_eq!(&body[..4], &(encoded.len() as u32).to_le_bytes());
        assert_eq!(&body[4..], encoded.as_bytes());

        assert_eq!(unmarshal(&plaintext).unwrap(), (5, packet));
    }

    #[test]
    fn test_message_carries_recipient_and_text() {
        let packet = Packet::Message {
            recipient: 200,
            data: "CONNECTREQUEST 1 v=0\r\na=x y".to_string(),
        };
        let plaintext = marshal(&packet, 100);
        assert_eq!(unmarshal(&plaintext).unwrap(), (100, packet));
    }

    #[test]
    fn test_reserved_bytes_ignored() {
        let mut plaintext = marshal(&Packet::Request, 9);
        plaintext[12..20].copy_from_slice(&[0xFF; 8]);
        assert_eq!(unmarshal(&plaintext).unwrap(), (9, Packet::Request));
    }

    #[test]
    fn test_malformed_packets() {
        assert_eq!(unmarshal(&[1]), Err(PacketError::Truncated));

        let mut plaintext = marshal(&Packet::Request, 9);
        plaintext[0] = 0xFF;
        assert!(matches!(
            unmarshal(&plaintext),
            Err(PacketError::Length { .. })
        ));

        let mut plaintext = marshal(&Packet::Request, 9);
        plaintext[2] = 7;
        assert_eq!(unmarshal(&plaintext), Err(PacketError::UnknownId(7)));

        let plaintext = marshal(
            &Packet::Message {
                recipient: 1,
                data: "Ping".to_string(),
            },
            2,
        );
        let truncated = &plaintext[..plaintext.len() - 2];
        assert!(unmarshal(truncated).is_err());
    }
}
