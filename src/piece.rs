use std::fmt;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::{self, HASH_LEN};
use crate::error::{Error, Result};

/// Final state of a piece once its last missing block has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceVerdict {
    /// The hash matched; carries the full piece buffer.
    Completed(Bytes),
    Corrupted,
}

/// Result of a successful [`Piece::put_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockWrite {
    /// Block stored, piece still waiting for blocks (or already finished earlier).
    Stored,
    /// This write finished the piece.
    Finished(PieceVerdict),
}

/// Called exactly once, from inside the `put_block` call that finished the piece.
pub type VerdictListener = Box<dyn FnOnce(u32, &PieceVerdict) + Send>;

/// A piece being downloaded: its buffer, which blocks arrived, and its hash.
pub struct Piece {
    index: u32,
    expected_hash: [u8; HASH_LEN],
    length: u32,
    block_length: u32,
    block_count: u32,
    data: Vec<u8>,
    blocks: Vec<bool>,
    missing: u32,
    completed: bool,
    corrupted: bool,
    listener: Option<VerdictListener>,
}

impl Piece {
    pub fn new(
        index: u32,
        expected_hash_hex: &str,
        length: u32,
        block_length: u32,
        block_count: u32,
    ) -> Result<Self> {
        let expected_hash = codec::hash_from_hex(expected_hash_hex)?;
        if length == 0 || block_length == 0 || block_count == 0 {
            return Err(Error::invalid_argument(format!(
                "piece {index}: lengths and block count must be positive"
            )));
        }
        if block_count != length.div_ceil(block_length) {
            return Err(Error::invalid_argument(format!(
                "piece {index}: {block_count} blocks cannot hold {length} bytes in blocks of {block_length}"
            )));
        }

        Ok(Self {
            index,
            expected_hash,
            length,
            block_length,
            block_count,
            data: vec![0; length as usize],
            blocks: vec![false; block_count as usize],
            missing: block_count,
            completed: false,
            corrupted: false,
            listener: None,
        })
    }

    pub(crate) fn set_listener(&mut self, listener: VerdictListener) {
        self.listener = Some(listener);
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn block_length(&self) -> u32 {
        self.block_length
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn expected_hash_hex(&self) -> String {
        codec::to_hex(&self.expected_hash)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// All blocks arrived and the content hash matched.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// All blocks arrived but the content hash did not match.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    pub fn is_finished(&self) -> bool {
        self.completed || self.corrupted
    }

    pub fn has_block(&self, block_index: u32) -> bool {
        self.blocks
            .get(block_index as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Size of block `block_index`; the last one may be shorter. `None`
    /// past the last block.
    pub fn block_size(&self, block_index: u32) -> Option<u32> {
        if block_index >= self.block_count {
            return None;
        }
        let offset = block_index * self.block_length;
        Some((self.length - offset).min(self.block_length))
    }

    /// `(offset, length)` of every block not yet written, in order.
    pub fn missing_blocks(&self) -> Vec<(u32, u32)> {
        (0..self.block_count)
            .filter(|&i| !self.blocks[i as usize])
            .filter_map(|i| Some((i * self.block_length, self.block_size(i)?)))
            .collect()
    }

    /// Copies one block into the buffer.
    ///
    /// Rewriting a block is allowed. Once the piece has a verdict further
    /// writes are accepted but never evaluated again.
    pub fn put_block(&mut self, offset: u32, data: &[u8]) -> Result<BlockWrite> {
        if offset % self.block_length != 0 {
            return Err(Error::invalid_argument(format!(
                "piece {}: offset {offset} is not aligned to {}",
                self.index, self.block_length
            )));
        }
        let block_index = offset / self.block_length;
        let Some(expected) = self.block_size(block_index) else {
            return Err(Error::invalid_argument(format!(
                "piece {}: block {block_index} out of range (count {})",
                self.index, self.block_count
            )));
        };
        if data.len() != expected as usize {
            return Err(Error::invalid_argument(format!(
                "piece {}: block {block_index} has {} bytes, expected {expected}",
                self.index,
                data.len()
            )));
        }

        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);

        let slot = &mut self.blocks[block_index as usize];
        if *slot {
            return Ok(BlockWrite::Stored);
        }
        *slot = true;
        self.missing -= 1;

        if self.missing > 0 || self.is_finished() {
            return Ok(BlockWrite::Stored);
        }

        let verdict = self.verify();
        if let Some(listener) = self.listener.take() {
            listener(self.index, &verdict);
        }
        Ok(BlockWrite::Finished(verdict))
    }

    fn verify(&mut self) -> PieceVerdict {
        if codec::sha1(&self.data) == self.expected_hash {
            debug!(piece = self.index, "piece verified");
            self.completed = true;
            PieceVerdict::Completed(Bytes::copy_from_slice(&self.data))
        } else {
            warn!(
                piece = self.index,
                expected = %self.expected_hash_hex(),
                "piece hash mismatch"
            );
            self.corrupted = true;
            PieceVerdict::Corrupted
        }
    }
}

impl fmt::Debug for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("length", &self.length)
            .field("block_length", &self.block_length)
            .field("missing", &self.missing)
            .field("completed", &self.completed)
            .field("corrupted", &self.corrupted)
            .finish()
    }
}
