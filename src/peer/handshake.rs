use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::Decoded;
use crate::peer::{PSTR, PSTR_LEN};

pub const HANDSHAKE_LEN: usize = 68;

// Reserved-field flags, numbered from the most significant bit of the
// 8 reserved bytes: bit 43 and bit 44 both live in byte 5.
const FAST_PEER_BYTE: usize = 5;
const FAST_PEER_MASK: u8 = 0x80 >> (43 % 8);
const EXTENDED_BYTE: usize = 5;
const EXTENDED_MASK: u8 = 0x80 >> (44 % 8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub infohash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(infohash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            infohash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    pub fn with_fast_peer(mut self, enabled: bool) -> Self {
        set_flag(&mut self.reserved[FAST_PEER_BYTE], FAST_PEER_MASK, enabled);
        self
    }

    pub fn with_extended_messaging(mut self, enabled: bool) -> Self {
        set_flag(&mut self.reserved[EXTENDED_BYTE], EXTENDED_MASK, enabled);
        self
    }

    pub fn supports_fast_peer(&self) -> bool {
        self.reserved[FAST_PEER_BYTE] & FAST_PEER_MASK != 0
    }

    pub fn supports_extended_messaging(&self) -> bool {
        self.reserved[EXTENDED_BYTE] & EXTENDED_MASK != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PSTR_LEN);
        buf.put_slice(PSTR.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.infohash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Decodes a handshake from the front of `buf`.
    ///
    /// A prefix of a valid handshake is `Incomplete`; a wrong protocol string
    /// is rejected as soon as the differing byte is visible.
    pub fn try_decode(buf: &[u8]) -> Decoded<Self> {
        let Some(&pstr_len) = buf.first() else {
            return Decoded::Incomplete;
        };
        if pstr_len != PSTR_LEN {
            return Decoded::invalid(format!("protocol string length {pstr_len}"));
        }

        let pstr_seen = &buf[1..buf.len().min(1 + PSTR.len())];
        if !PSTR.as_bytes().starts_with(pstr_seen) {
            return Decoded::invalid("unknown protocol string");
        }
        if buf.len() < HANDSHAKE_LEN {
            return Decoded::Incomplete;
        }

        let mut handshake = Handshake::new([0u8; 20], [0u8; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.infohash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);

        Decoded::Complete {
            value: handshake,
            consumed: HANDSHAKE_LEN,
        }
    }
}

fn set_flag(byte: &mut u8, mask: u8, enabled: bool) {
    if enabled {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}
