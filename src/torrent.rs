use crate::codec::{self, HASH_LEN};
use crate::error::{Error, Result};

/// Immutable description of the content being shared, as loaded from a
/// metainfo file by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    pub info_hash: [u8; HASH_LEN],
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; HASH_LEN]>,
    pub piece_length: u32,
    pub block_length: u32,
}

impl TorrentDescriptor {
    pub fn new(
        info_hash: [u8; HASH_LEN],
        total_length: u64,
        piece_hashes: Vec<[u8; HASH_LEN]>,
        piece_length: u32,
        block_length: u32,
    ) -> Result<Self> {
        if total_length == 0 || piece_length == 0 || block_length == 0 {
            return Err(Error::invalid_argument(
                "total, piece and block lengths must be positive",
            ));
        }
        let expected = total_length.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected {
            return Err(Error::invalid_argument(format!(
                "{} piece hashes for {} pieces",
                piece_hashes.len(),
                expected
            )));
        }

        Ok(Self {
            info_hash,
            total_length,
            piece_hashes,
            piece_length,
            block_length,
        })
    }

    /// Builds a descriptor from the concatenated `pieces` string of a metainfo file.
    pub fn from_concatenated_hashes(
        info_hash: [u8; HASH_LEN],
        total_length: u64,
        pieces: &[u8],
        piece_length: u32,
        block_length: u32,
    ) -> Result<Self> {
        if pieces.len() % HASH_LEN != 0 {
            return Err(Error::invalid_argument(
                "piece hash string is not a multiple of 20 bytes",
            ));
        }
        let piece_hashes = pieces
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        Self::new(info_hash, total_length, piece_hashes, piece_length, block_length)
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Byte length of piece `index`; only the last piece may be shorter.
    pub fn piece_size(&self, index: u32) -> Option<u32> {
        if index >= self.piece_count() {
            return None;
        }
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_length - start;
        Some(remaining.min(self.piece_length as u64) as u32)
    }

    pub fn info_hash_hex(&self) -> String {
        codec::to_hex(&self.info_hash)
    }

    pub fn piece_hash_hex(&self, index: u32) -> Option<String> {
        self.piece_hashes
            .get(index as usize)
            .map(|hash| codec::to_hex(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_piece_sizes() {
        let descriptor = TorrentDescriptor::new([1u8; 20], 10, vec![[0u8; 20]; 3], 4, 2).unwrap();
        assert_eq!(descriptor.piece_count(), 3);
        assert_eq!(descriptor.piece_size(0), Some(4));
        assert_eq!(descriptor.piece_size(1), Some(4));
        assert_eq!(descriptor.piece_size(2), Some(2));
        assert_eq!(descriptor.piece_size(3), None);
    }

    #[test]
    fn test_descriptor_rejects_wrong_hash_count() {
        let result = TorrentDescriptor::new([1u8; 20], 10, vec![[0u8; 20]; 2], 4, 2);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_descriptor_rejects_zero_lengths() {
        assert!(TorrentDescriptor::new([1u8; 20], 0, vec![], 4, 2).is_err());
        assert!(TorrentDescriptor::new([1u8; 20], 4, vec![[0u8; 20]], 4, 0).is_err());
    }

    #[test]
    fn test_from_concatenated_hashes() {
        let mut pieces = vec![0xAAu8; 20];
        pieces.extend_from_slice(&[0xBBu8; 20]);
        let descriptor =
            TorrentDescriptor::from_concatenated_hashes([2u8; 20], 8, &pieces, 4, 2).unwrap();
        assert_eq!(descriptor.piece_hashes[1], [0xBBu8; 20]);
        assert_eq!(descriptor.piece_hash_hex(0).unwrap(), "aa".repeat(20));

        let truncated = TorrentDescriptor::from_concatenated_hashes([2u8; 20], 8, &pieces[..30], 4, 2);
        assert!(truncated.is_err());
    }
}
