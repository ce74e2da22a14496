//! # Peer Wire Messages
//!
//! This module defines the message types and framing for the peer wire
//! protocol. Everything after the handshake uses these messages.
//!
//! ## Message Structure
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - length of message ID + payload
//! - **Message ID**: 1 byte - identifies the message type
//! - **Payload**: variable length - message-specific data
//!
//! A length prefix of 0 is a keep-alive: no ID or payload follows.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | one bit per piece, MSB of byte 0 = piece 0 |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block |
//! | 8 | CANCEL | index, begin, length |
//! | 9 | PORT | 2-byte listen port |

use crate::error::FormatError;

use byteorder::{BigEndian, ByteOrder};

type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_PORT: MessageId = 9;

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = 4;

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Raw bitfield bytes; interpreted against the chunk count by the caller.
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
}

impl Message {
    /// Message ID, or `None` for keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MESSAGE_CHOKE,
            Message::Unchoke => MESSAGE_UNCHOKE,
            Message::Interested => MESSAGE_INTERESTED,
            Message::NotInterested => MESSAGE_NOT_INTERESTED,
            Message::Have(_) => MESSAGE_HAVE,
            Message::Bitfield(_) => MESSAGE_BITFIELD,
            Message::Request { .. } => MESSAGE_REQUEST,
            Message::Piece { .. } => MESSAGE_PIECE,
            Message::Cancel { .. } => MESSAGE_CANCEL,
            Message::Port(_) => MESSAGE_PORT,
        };
        Some(id)
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "KEEP_ALIVE",
            Message::Choke => "CHOKE",
            Message::Unchoke => "UNCHOKE",
            Message::Interested => "INTERESTED",
            Message::NotInterested => "NOT_INTERESTED",
            Message::Have(_) => "HAVE",
            Message::Bitfield(_) => "BITFIELD",
            Message::Request { .. } => "REQUEST",
            Message::Piece { .. } => "PIECE",
            Message::Cancel { .. } => "CANCEL",
            Message::Port(_) => "PORT",
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 0,
            Message::Have(_) => 4,
            Message::Bitfield(bits) => bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
            Message::Port(_) => 2,
        }
    }

    /// Serialize message, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0; LENGTH_PREFIX];
        };

        let payload_len = self.payload_len();
        let mut buf = vec![0; LENGTH_PREFIX + 1 + payload_len];
        BigEndian::write_u32(&mut buf[..LENGTH_PREFIX], (1 + payload_len) as u32);
        buf[LENGTH_PREFIX] = id;

        let payload = &mut buf[LENGTH_PREFIX + 1..];
        match self {
            Message::Have(index) => BigEndian::write_u32(payload, *index),
            Message::Bitfield(bits) => payload.copy_from_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                BigEndian::write_u32(&mut payload[0..4], *index);
                BigEndian::write_u32(&mut payload[4..8], *begin);
                BigEndian::write_u32(&mut payload[8..12], *length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                BigEndian::write_u32(&mut payload[0..4], *index);
                BigEndian::write_u32(&mut payload[4..8], *begin);
                payload[8..].copy_from_slice(block);
            }
            Message::Port(port) => BigEndian::write_u16(payload, *port),
            _ => {}
        }

        buf
    }
}

/// Largest frame a peer may legally send for a torrent with the given layout.
///
/// A piece message carries a whole chunk; a bitfield carries one bit per chunk.
pub fn max_frame_len(piece_length: u32, num_pieces: usize) -> usize {
    let piece_frame = 1 + 8 + piece_length as usize;
    let bitfield_frame = 1 + num_pieces.div_ceil(8);
    LENGTH_PREFIX + piece_frame.max(bitfield_frame).max(13)
}

/// Returns the total size of the first frame in `buf` once it is fully buffered.
///
/// `Ok(None)` means more bytes are needed.
pub fn frame_len(buf: &[u8], max: usize) -> Result<Option<usize>, FormatError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = LENGTH_PREFIX + BigEndian::read_u32(&buf[..LENGTH_PREFIX]) as usize;
    if len > max {
        return Err(FormatError::FrameTooLarge { len, max });
    }
    if buf.len() < len {
        return Ok(None);
    }
    Ok(Some(len))
}

/// Deserialize one complete frame, length prefix included.
pub fn deserialize_message(frame: &[u8]) -> Result<Message, FormatError> {
    if frame.len() < LENGTH_PREFIX {
        return Err(FormatError::Truncated {
            id: None,
            len: frame.len(),
        });
    }
    let message_len = BigEndian::read_u32(&frame[..LENGTH_PREFIX]) as usize;
    let body = &frame[LENGTH_PREFIX..];
    if body.len() != message_len {
        return Err(FormatError::Truncated {
            id: body.first().copied(),
            len: body.len(),
        });
    }
    if message_len == 0 {
        return Ok(Message::KeepAlive);
    }

    let id = body[0];
    let payload = &body[1..];

    let fixed = |expected: usize| -> Result<(), FormatError> {
        match payload.len() {
            n if n < expected => Err(FormatError::Truncated { id: Some(id), len: n }),
            n if n > expected => Err(FormatError::PayloadLength { id, len: n }),
            _ => Ok(()),
        }
    };

    let message = match id {
        MESSAGE_CHOKE => fixed(0).map(|_| Message::Choke)?,
        MESSAGE_UNCHOKE => fixed(0).map(|_| Message::Unchoke)?,
        MESSAGE_INTERESTED => fixed(0).map(|_| Message::Interested)?,
        MESSAGE_NOT_INTERESTED => fixed(0).map(|_| Message::NotInterested)?,
        MESSAGE_HAVE => {
            fixed(4)?;
            Message::Have(BigEndian::read_u32(payload))
        }
        MESSAGE_BITFIELD => Message::Bitfield(payload.to_vec()),
        MESSAGE_REQUEST | MESSAGE_CANCEL => {
            fixed(12)?;
            let index = BigEndian::read_u32(&payload[0..4]);
            let begin = BigEndian::read_u32(&payload[4..8]);
            let length = BigEndian::read_u32(&payload[8..12]);
            if id == MESSAGE_REQUEST {
                Message::Request {
                    index,
                    begin,
                    length,
                }
            } else {
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
        }
        MESSAGE_PIECE => {
            if payload.len() < 8 {
                return Err(FormatError::Truncated {
                    id: Some(id),
                    len: payload.len(),
                });
            }
            Message::Piece {
                index: BigEndian::read_u32(&payload[0..4]),
                begin: BigEndian::read_u32(&payload[4..8]),
                block: payload[8..].to_vec(),
            }
        }
        MESSAGE_PORT => {
            fixed(2)?;
            Message::Port(BigEndian::read_u16(payload))
        }
        unknown => return Err(FormatError::UnknownId(unknown)),
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let encoded = message.serialize();
        assert_eq!(frame_len(&encoded, usize::MAX), Ok(Some(encoded.len())));
        assert_eq!(deserialize_message(&encoded), Ok(message));
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(0));
        round_trip(Message::Have(u32::MAX));
        round_trip(Message::Bitfield(vec![0b1010_0000, 0xff]));
        round_trip(Message::Request {
            index: 3,
            begin: 0,
            length: 16384,
        });
        round_trip(Message::Cancel {
            index: 3,
            begin: 16384,
            length: 100,
        });
        round_trip(Message::Port(6881));
        for size in [1usize, 7, 16384, 100_000] {
            round_trip(Message::Piece {
                index: 9,
                begin: 0,
                block: (0..size).map(|i| (i % 251) as u8).collect(),
            });
        }
    }

    #[test]
    fn empty_piece_and_bitfield_round_trip() {
        round_trip(Message::Bitfield(vec![]));
        round_trip(Message::Piece {
            index: 1,
            begin: 0,
            block: vec![],
        });
    }

    #[test]
    fn keep_alive_is_bare_length_prefix() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn have_layout_is_big_endian() {
        assert_eq!(Message::Have(0x0102_0304).serialize(), vec![0, 0, 0, 5, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn unknown_id_is_reported() {
        let frame = [0, 0, 0, 3, 20, 0xaa, 0xbb];
        assert_eq!(deserialize_message(&frame), Err(FormatError::UnknownId(20)));
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        // HAVE with a 2-byte payload
        let frame = [0, 0, 0, 3, MESSAGE_HAVE, 0, 1];
        assert!(matches!(
            deserialize_message(&frame),
            Err(FormatError::Truncated { .. })
        ));

        // PIECE without its begin offset
        let frame = [0, 0, 0, 5, MESSAGE_PIECE, 0, 0, 0, 1];
        assert!(matches!(
            deserialize_message(&frame),
            Err(FormatError::Truncated { .. })
        ));

        // Length prefix promises more than the buffer holds
        let frame = [0, 0, 0, 9, MESSAGE_HAVE, 0, 0, 0, 1];
        assert!(matches!(
            deserialize_message(&frame),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_fixed_payload_is_rejected() {
        let frame = [0, 0, 0, 2, MESSAGE_CHOKE, 0];
        assert_eq!(
            deserialize_message(&frame),
            Err(FormatError::PayloadLength {
                id: MESSAGE_CHOKE,
                len: 1
            })
        );
    }

    #[test]
    fn frame_len_waits_for_complete_frame() {
        let encoded = Message::Have(7).serialize();
        assert_eq!(frame_len(&encoded[..3], 64), Ok(None));
        assert_eq!(frame_len(&encoded[..6], 64), Ok(None));
        assert_eq!(frame_len(&encoded, 64), Ok(Some(9)));
    }

    #[test]
    fn frame_len_rejects_oversized_prefix() {
        let buf = [0x7f, 0xff, 0xff, 0xff];
        assert!(matches!(
            frame_len(&buf, max_frame_len(16384, 10)),
            Err(FormatError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn max_frame_fits_whole_piece() {
        let max = max_frame_len(16384, 4);
        let piece = Message::Piece {
            index: 0,
            begin: 0,
            block: vec![0; 16384],
        };
        assert_eq!(piece.serialize().len(), max);
    }
}
