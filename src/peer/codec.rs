//! Framing and parsing of the BitTorrent peer wire protocol.
//!
//! Pure functions over byte buffers, wired up as [`tokio_util::codec`] codecs
//! so a [`tokio_util::codec::Framed`] stream can be built directly over a
//! `TcpStream`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, PeerId, PieceIndex, Sha1Hash};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;

/// The fixed-size opening exchange between two peers, establishing protocol
/// version, torrent identity, and peer identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// Encodes and decodes the fixed 68-byte handshake. Kept separate from
/// [`PeerCodec`] since the handshake precedes the length-prefixed message
/// stream and is never re-entered once the session moves on to it.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_bytes(0, 8);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(Error::ProtocolError);
        }
        if &buf[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(Error::ProtocolError);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        buf.advance(HANDSHAKE_LEN);
        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// A decoded peer wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    BitField(Bitfield),
    Request {
        index: PieceIndex,
        begin: u32,
        length: u32,
    },
    Piece {
        index: PieceIndex,
        begin: u32,
        data: Vec<u8>,
    },
    Cancel {
        index: PieceIndex,
        begin: u32,
        length: u32,
    },
}

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;

/// Frames and parses the length-prefixed message stream that follows the
/// handshake.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(CHOKE);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(UNCHOKE);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(INTERESTED);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(NOT_INTERESTED);
            }
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(HAVE);
                buf.put_u32(index as u32);
            }
            Message::BitField(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(BITFIELD);
                buf.put_slice(&bytes);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(REQUEST);
                buf.put_u32(index as u32);
                buf.put_u32(begin);
                buf.put_u32(length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(PIECE);
                buf.put_u32(index as u32);
                buf.put_u32(begin);
                buf.put_slice(&data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(CANCEL);
                buf.put_u32(index as u32);
                buf.put_u32(begin);
                buf.put_u32(length);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        if length == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        let id = buf[4];
        let payload = buf[5..4 + length].to_vec();

        let msg = match id {
            CHOKE => Some(Message::Choke),
            UNCHOKE => Some(Message::Unchoke),
            INTERESTED => Some(Message::Interested),
            NOT_INTERESTED => Some(Message::NotInterested),
            HAVE => {
                if payload.len() != 4 {
                    return Err(Error::MalformedMessage);
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                Some(Message::Have(index as PieceIndex))
            }
            BITFIELD => {
                let bitfield = Bitfield::from_vec(payload);
                Some(Message::BitField(bitfield))
            }
            REQUEST | CANCEL => {
                if payload.len() != 12 {
                    return Err(Error::MalformedMessage);
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let length = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                if id == REQUEST {
                    Some(Message::Request {
                        index: index as PieceIndex,
                        begin,
                        length,
                    })
                } else {
                    Some(Message::Cancel {
                        index: index as PieceIndex,
                        begin,
                        length,
                    })
                }
            }
            PIECE => {
                if payload.len() < 8 {
                    return Err(Error::MalformedMessage);
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let data = payload[8..].to_vec();
                Some(Message::Piece {
                    index: index as PieceIndex,
                    begin,
                    data,
                })
            }
            _ => {
                log::debug!("Dropping peer message with unknown id {}", id);
                None
            }
        };

        buf.advance(4 + length);
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let info_hash: Sha1Hash = *b"CDP;~y~\xbf1X#'\xa5\xba\xae5\xb1\x1b\xda\x01";
        let peer_id: PeerId = *b"-qB3200-iTiX3rvfzMpr";
        let handshake = Handshake::new(info_hash, peer_id);

        let mut buf = BytesMut::new();
        let mut codec = HandshakeCodec;
        codec.encode(handshake, &mut buf).unwrap();

        assert_eq!(buf.len(), 68);
        let mut expected = vec![0x13u8];
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0u8; 8]);
        expected.extend_from_slice(&info_hash);
        expected.extend_from_slice(&peer_id);
        assert_eq!(&buf[..], &expected[..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_have_encoding() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Have(33), &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x21][..]
        );
    }

    #[test]
    fn test_request_encoding() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Request {
                    index: 0,
                    begin: 2,
                    length: 16384,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            &[
                0x00, 0x00, 0x00, 0x0d, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x02, 0x00, 0x00, 0x40, 0x00
            ][..]
        );
    }

    #[test]
    fn test_bitfield_parse() {
        let mut payload = vec![0xFFu8; 27];
        *payload.last_mut().unwrap() = 0xF0;
        let mut buf = BytesMut::new();
        buf.put_u32(1 + payload.len() as u32);
        buf.put_u8(BITFIELD);
        buf.put_slice(&payload);

        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::BitField(bitfield) => {
                let n = 26 * 8 + 4;
                for i in 0..n {
                    assert!(bitfield[i], "bit {} should be set", i);
                }
                for i in n..bitfield.len() {
                    assert!(!bitfield[i], "bit {} should be clear", i);
                }
            }
            other => panic!("expected BitField, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_id_silently_dropped() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        let msg = PeerCodec.decode(&mut buf).unwrap();
        assert_eq!(msg, None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
    }

    #[test]
    fn test_piece_round_trip() {
        let mut buf = BytesMut::new();
        let original = Message::Piece {
            index: 7,
            begin: 0,
            data: vec![1, 2, 3, 4, 5],
        };
        PeerCodec.encode(original.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(REQUEST);
        let msg = PeerCodec.decode(&mut buf).unwrap();
        assert_eq!(msg, None);
    }
}
