use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{self, Decoded};

/// Largest length prefix accepted from a peer.
pub const MAX_MESSAGE_LEN: u32 = 2 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            other => Err(other),
        }
    }
}

/// A block within a piece, as named by `Request` and `Cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Every message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    BitField(Bitfield),
    Request(BlockInfo),
    PieceBlock {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::BitField(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::PieceBlock { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 0,
            Message::Have { .. } => 4,
            Message::BitField(bitfield) => bitfield.bits.len(),
            Message::Request(_) | Message::Cancel(_) => 12,
            Message::PieceBlock { data, .. } => 8 + data.len(),
            Message::Port(_) => 2,
        }
    }

    pub fn encode(&self) -> Bytes {
        let Some(id) = self.id() else {
            return Bytes::from_static(&[0, 0, 0, 0]);
        };

        let total_len = 1 + self.payload_len(); // 1 byte for ID
        let mut buf = BytesMut::with_capacity(4 + total_len);
        buf.put_u32(total_len as u32);
        buf.put_u8(id as u8);

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::BitField(bitfield) => buf.put_slice(&bitfield.bits),
            Message::Request(block) | Message::Cancel(block) => {
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            Message::PieceBlock {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            Message::Port(port) => buf.put_u16(*port),
            _ => {}
        }

        buf.freeze()
    }

    /// Decodes one length-prefixed message from the front of `buf`.
    pub fn try_decode(buf: &[u8]) -> Decoded<Self> {
        let Some(len) = codec::read_u32(buf, 0) else {
            return Decoded::Incomplete;
        };
        if len > MAX_MESSAGE_LEN {
            return Decoded::invalid(format!("message length {len} exceeds limit"));
        }
        let frame_end = 4 + len as usize;
        if buf.len() < frame_end {
            return Decoded::Incomplete;
        }
        if len == 0 {
            return Decoded::Complete {
                value: Message::KeepAlive,
                consumed: 4,
            };
        }

        let id = match MessageId::try_from(buf[4]) {
            Ok(id) => id,
            Err(unknown) => return Decoded::invalid(format!("unknown message id {unknown}")),
        };
        let payload = &buf[5..frame_end];

        let message = match Self::decode_payload(id, payload) {
            Some(message) => message,
            None => {
                return Decoded::invalid(format!(
                    "{id:?} with {} byte payload",
                    payload.len()
                ));
            }
        };

        Decoded::Complete {
            value: message,
            consumed: frame_end,
        }
    }

    fn decode_payload(id: MessageId, payload: &[u8]) -> Option<Self> {
        let exact = |expected: usize| (payload.len() == expected).then_some(());
        let block = || {
            Some(BlockInfo {
                piece_index: codec::read_u32(payload, 0)?,
                offset: codec::read_u32(payload, 4)?,
                length: codec::read_u32(payload, 8)?,
            })
        };

        let message = match id {
            MessageId::Choke => exact(0).map(|_| Message::Choke)?,
            MessageId::Unchoke => exact(0).map(|_| Message::Unchoke)?,
            MessageId::Interested => exact(0).map(|_| Message::Interested)?,
            MessageId::NotInterested => exact(0).map(|_| Message::NotInterested)?,
            MessageId::Have => {
                exact(4)?;
                Message::Have {
                    piece_index: codec::read_u32(payload, 0)?,
                }
            }
            MessageId::Bitfield => Message::BitField(Bitfield {
                bits: payload.to_vec(),
            }),
            MessageId::Request => {
                exact(12)?;
                Message::Request(block()?)
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return None;
                }
                Message::PieceBlock {
                    piece_index: codec::read_u32(payload, 0)?,
                    offset: codec::read_u32(payload, 4)?,
                    data: Bytes::copy_from_slice(&payload[8..]),
                }
            }
            MessageId::Cancel => {
                exact(12)?;
                Message::Cancel(block()?)
            }
            MessageId::Port => {
                exact(2)?;
                Message::Port(codec::read_u16(payload, 0)?)
            }
        };
        Some(message)
    }
}

/// One bit per piece, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    pub bits: Vec<u8>, // raw bytes
}

impl Bitfield {
    pub fn has_piece(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = 7 - (index % 8); // MSB first
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        let bit = 7 - (index % 8);
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << bit;
        }
    }

    pub fn from_piece_count(count: usize) -> Self {
        let num_bytes = count.div_ceil(8);
        Bitfield {
            bits: vec![0; num_bytes],
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Grows the field so it can address `count` pieces.
    pub fn ensure_capacity(&mut self, count: usize) {
        let num_bytes = count.div_ceil(8);
        if self.bits.len() < num_bytes {
            self.bits.resize(num_bytes, 0);
        }
    }
}

impl From<Bitfield> for Message {
    fn from(b: Bitfield) -> Self {
        Message::BitField(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn decode_all(buf: &[u8]) -> Message {
        match Message::try_decode(buf) {
            Decoded::Complete { value, consumed } => {
                assert_eq!(consumed, buf.len());
                value
            }
            other => panic!("expected complete message, got {other:?}"),
        }
    }

    #[test]
    fn test_message_id_try_from() {
        assert_eq!(MessageId::try_from(0), Ok(MessageId::Choke));
        assert_eq!(MessageId::try_from(7), Ok(MessageId::Piece));
        assert_eq!(MessageId::try_from(9), Ok(MessageId::Port));
        assert_eq!(MessageId::try_from(10), Err(10));
        assert_eq!(MessageId::try_from(255), Err(255));
    }

    #[test]
    fn test_keep_alive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(decode_all(&[0, 0, 0, 0]), Message::KeepAlive);
    }

    #[test]
    fn test_encode_layouts() {
        assert_eq!(Message::Choke.encode().as_ref(), &[0, 0, 0, 1, 0]);
        assert_eq!(Message::NotInterested.encode().as_ref(), &[0, 0, 0, 1, 3]);
        assert_eq!(
            Message::Have { piece_index: 0x12345678 }.encode().as_ref(),
            &[0, 0, 0, 5, 4, 0x12, 0x34, 0x56, 0x78]
        );
        assert_eq!(
            Message::Request(BlockInfo {
                piece_index: 1,
                offset: 16384,
                length: 16384
            })
            .encode()
            .as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(
            Message::PieceBlock {
                piece_index: 2,
                offset: 4,
                data: Bytes::from_static(b"xy")
            }
            .encode()
            .as_ref(),
            &[0, 0, 0, 11, 7, 0, 0, 0, 2, 0, 0, 0, 4, b'x', b'y']
        );
        assert_eq!(Message::Port(6881).encode().as_ref(), &[0, 0, 0, 3, 9, 0x1A, 0xE1]);
    }

    #[test]
    fn test_decode_consumes_one_frame_at_a_time() {
        let mut buf = Message::Unchoke.encode().to_vec();
        buf.extend_from_slice(&Message::Have { piece_index: 3 }.encode());

        let Decoded::Complete { value, consumed } = Message::try_decode(&buf) else {
            panic!("first frame should decode");
        };
        assert_eq!(value, Message::Unchoke);
        assert_eq!(consumed, 5);
        assert_eq!(
            Message::try_decode(&buf[consumed..]).complete(),
            Some(Message::Have { piece_index: 3 })
        );
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let buf = [0, 0, 0, 5, 4, 0x12]; // says 5 bytes, has 2
        assert_eq!(Message::try_decode(&buf), Decoded::Incomplete);
        assert_eq!(Message::try_decode(&[0, 0]), Decoded::Incomplete);
    }

    #[test]
    fn test_decode_rejects_unknown_id() {
        assert_matches!(Message::try_decode(&[0, 0, 0, 1, 99]), Decoded::Invalid(_));
    }

    #[test]
    fn test_decode_rejects_wrong_payload_sizes() {
        assert_matches!(Message::try_decode(&[0, 0, 0, 2, 0, 1]), Decoded::Invalid(_));
        assert_matches!(Message::try_decode(&[0, 0, 0, 3, 4, 0, 1]), Decoded::Invalid(_));
        assert_matches!(
            Message::try_decode(&[0, 0, 0, 5, 6, 0, 0, 0, 1]),
            Decoded::Invalid(_)
        );
        assert_matches!(Message::try_decode(&[0, 0, 0, 4, 7, 0, 0, 0]), Decoded::Invalid(_));
        assert_matches!(Message::try_decode(&[0, 0, 0, 2, 9, 1]), Decoded::Invalid(_));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        assert_matches!(
            Message::try_decode(&[0xFF, 0xFF, 0xFF, 0xFF, 7]),
            Decoded::Invalid(_)
        );
    }

    #[test]
    fn test_bitfield_has_piece_basic() {
        let bitfield = Bitfield {
            bits: vec![0b10000000, 0b00000001],
        };

        assert!(bitfield.has_piece(0));
        assert!(!bitfield.has_piece(1));
        assert!(!bitfield.has_piece(7));
        assert!(!bitfield.has_piece(8));
        assert!(bitfield.has_piece(15));
        assert!(!bitfield.has_piece(100));
        assert_eq!(bitfield.count_ones(), 2);
    }

    #[test]
    fn test_bitfield_set_piece() {
        let mut bitfield = Bitfield::from_piece_count(9);
        assert_eq!(bitfield.bits.len(), 2);
        assert!(bitfield.is_empty());

        bitfield.set_piece(0);
        bitfield.set_piece(7);
        bitfield.set_piece(8);
        assert_eq!(bitfield.bits, vec![0b10000001, 0b10000000]);

        // out of range is ignored
        bitfield.set_piece(100);
        assert_eq!(bitfield.count_ones(), 3);
    }

    #[test]
    fn test_bitfield_ensure_capacity() {
        let mut bitfield = Bitfield::default();
        bitfield.set_piece(3);
        assert!(!bitfield.has_piece(3));

        bitfield.ensure_capacity(10);
        bitfield.set_piece(3);
        assert!(bitfield.has_piece(3));
        assert_eq!(bitfield.bits.len(), 2);
    }

    #[test]
    fn test_bitfield_message_decodes() {
        let message: Message = Bitfield {
            bits: vec![0xDE, 0xAD],
        }
        .into();
        let encoded = message.encode();
        assert_eq!(encoded.as_ref(), &[0, 0, 0, 3, 5, 0xDE, 0xAD]);
        assert_eq!(decode_all(&encoded), message);
    }

    fn block_strategy() -> impl Strategy<Value = BlockInfo> {
        (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(piece_index, offset, length)| {
            BlockInfo {
                piece_index,
                offset,
                length,
            }
        })
    }

    fn message_strategy() -> impl Strategy<Value = Message> {
        prop_oneof![
            Just(Message::KeepAlive),
            Just(Message::Choke),
            Just(Message::Unchoke),
            Just(Message::Interested),
            Just(Message::NotInterested),
            any::<u32>().prop_map(|piece_index| Message::Have { piece_index }),
            proptest::collection::vec(any::<u8>(), 0..64)
                .prop_map(|bits| Message::BitField(Bitfield { bits })),
            block_strategy().prop_map(Message::Request),
            (any::<u32>(), any::<u32>(), proptest::collection::vec(any::<u8>(), 0..256)).prop_map(
                |(piece_index, offset, data)| Message::PieceBlock {
                    piece_index,
                    offset,
                    data: Bytes::from(data),
                }
            ),
            block_strategy().prop_map(Message::Cancel),
            any::<u16>().prop_map(Message::Port),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(message in message_strategy()) {
            let encoded = message.encode();
            prop_assert_eq!(
                Message::try_decode(&encoded),
                Decoded::Complete { value: message, consumed: encoded.len() }
            );
        }

        #[test]
        fn prop_truncated_frame_is_incomplete(message in message_strategy(), cut in any::<prop::sample::Index>()) {
            let encoded = message.encode();
            let len = cut.index(encoded.len());
            prop_assert_eq!(Message::try_decode(&encoded[..len]), Decoded::Incomplete);
        }
    }
}
