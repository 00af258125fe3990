use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::message::Bitfield;
use crate::piece::{Piece, PieceVerdict};
use crate::torrent::TorrentDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    CheckedOut,
    Present,
}

/// Relayed to every subscriber of a [`PieceManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceEvent {
    Completed { index: u32, data: Bytes },
    Corrupted { index: u32 },
}

struct Shared {
    statuses: Mutex<Vec<PieceStatus>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PieceEvent>>>,
}

impl Shared {
    fn settle(&self, index: u32, verdict: &PieceVerdict) {
        let event = {
            let mut statuses = self.statuses.lock();
            let slot = &mut statuses[index as usize];
            match verdict {
                PieceVerdict::Completed(data) => {
                    *slot = PieceStatus::Present;
                    PieceEvent::Completed {
                        index,
                        data: data.clone(),
                    }
                }
                PieceVerdict::Corrupted => {
                    *slot = PieceStatus::Missing;
                    PieceEvent::Corrupted { index }
                }
            }
        };

        match &event {
            PieceEvent::Completed { .. } => info!(piece = index, "piece completed"),
            PieceEvent::Corrupted { .. } => warn!(piece = index, "piece corrupted, requeued"),
        }
        self.emit(event);
    }

    fn emit(&self, event: PieceEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Owns the per-torrent piece status bitfield and hands out pieces.
///
/// Cloning is cheap; all clones share the same bitfield.
#[derive(Clone)]
pub struct PieceManager {
    descriptor: Arc<TorrentDescriptor>,
    shared: Arc<Shared>,
}

impl PieceManager {
    pub fn new(descriptor: TorrentDescriptor) -> Self {
        let statuses = vec![PieceStatus::Missing; descriptor.piece_count() as usize];
        Self::from_parts(descriptor, statuses)
    }

    /// Starts from a resumed-download snapshot. `CheckedOut` entries are
    /// treated as `Missing` since no piece buffers survive.
    pub fn with_snapshot(descriptor: TorrentDescriptor, snapshot: &[PieceStatus]) -> Result<Self> {
        if snapshot.len() != descriptor.piece_count() as usize {
            return Err(Error::invalid_argument(format!(
                "snapshot has {} entries for {} pieces",
                snapshot.len(),
                descriptor.piece_count()
            )));
        }
        let statuses = snapshot
            .iter()
            .map(|status| match status {
                PieceStatus::Present => PieceStatus::Present,
                _ => PieceStatus::Missing,
            })
            .collect();
        Ok(Self::from_parts(descriptor, statuses))
    }

    fn from_parts(descriptor: TorrentDescriptor, statuses: Vec<PieceStatus>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            shared: Arc::new(Shared {
                statuses: Mutex::new(statuses),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn descriptor(&self) -> &TorrentDescriptor {
        &self.descriptor
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.descriptor.info_hash
    }

    pub fn piece_count(&self) -> u32 {
        self.descriptor.piece_count()
    }

    /// Receives every completion and corruption from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PieceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn status(&self, index: u32) -> Option<PieceStatus> {
        self.shared.statuses.lock().get(index as usize).copied()
    }

    pub fn snapshot(&self) -> Vec<PieceStatus> {
        self.shared.statuses.lock().clone()
    }

    pub fn present_count(&self) -> usize {
        self.shared
            .statuses
            .lock()
            .iter()
            .filter(|s| **s == PieceStatus::Present)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.shared
            .statuses
            .lock()
            .iter()
            .all(|s| *s == PieceStatus::Present)
    }

    /// Bitfield of verified pieces, as sent in a `BitField` message.
    pub fn to_wire_bitfield(&self) -> Bitfield {
        let statuses = self.shared.statuses.lock();
        let mut bitfield = Bitfield::from_piece_count(statuses.len());
        for (index, status) in statuses.iter().enumerate() {
            if *status == PieceStatus::Present {
                bitfield.set_piece(index);
            }
        }
        bitfield
    }

    /// Lowest missing index, restricted to what `available` has when given.
    pub fn select_next_to_check_out(&self, available: Option<&Bitfield>) -> Option<u32> {
        let statuses = self.shared.statuses.lock();
        Self::select(&statuses, available)
    }

    fn select(statuses: &[PieceStatus], available: Option<&Bitfield>) -> Option<u32> {
        statuses
            .iter()
            .enumerate()
            .find(|(index, status)| {
                **status == PieceStatus::Missing
                    && available.is_none_or(|bitfield| bitfield.has_piece(*index))
            })
            .map(|(index, _)| index as u32)
    }

    /// Moves `index` from `Missing` to `CheckedOut` and returns a fresh piece for it.
    pub fn check_out(&self, index: u32) -> Result<Piece> {
        let mut piece = self.build_piece(index)?;
        {
            let mut statuses = self.shared.statuses.lock();
            let status = statuses[index as usize];
            if status != PieceStatus::Missing {
                return Err(Error::invalid_state(format!(
                    "piece {index} is {status:?}, not Missing"
                )));
            }
            statuses[index as usize] = PieceStatus::CheckedOut;
        }
        self.attach(&mut piece);
        debug!(piece = index, "checked out");
        Ok(piece)
    }

    /// Selects and checks out under one lock, so concurrent peers never
    /// compete for the same index.
    pub fn check_out_next(&self, available: Option<&Bitfield>) -> Option<Piece> {
        let index = {
            let mut statuses = self.shared.statuses.lock();
            let index = Self::select(&statuses, available)?;
            statuses[index as usize] = PieceStatus::CheckedOut;
            index
        };

        match self.build_piece(index) {
            Ok(mut piece) => {
                self.attach(&mut piece);
                debug!(piece = index, "checked out");
                Some(piece)
            }
            Err(e) => {
                warn!(piece = index, error = %e, "failed to build piece");
                self.shared.statuses.lock()[index as usize] = PieceStatus::Missing;
                None
            }
        }
    }

    /// Returns an unfinished checked-out piece to `Missing`.
    pub fn release(&self, index: u32) -> Result<()> {
        let mut statuses = self.shared.statuses.lock();
        match statuses.get(index as usize).copied() {
            Some(PieceStatus::CheckedOut) => {
                statuses[index as usize] = PieceStatus::Missing;
                debug!(piece = index, "released");
                Ok(())
            }
            Some(status) => Err(Error::invalid_state(format!(
                "piece {index} is {status:?}, not CheckedOut"
            ))),
            None => Err(Error::invalid_argument(format!("no piece {index}"))),
        }
    }

    fn build_piece(&self, index: u32) -> Result<Piece> {
        let length = self
            .descriptor
            .piece_size(index)
            .ok_or_else(|| Error::invalid_argument(format!("no piece {index}")))?;
        let hash = self
            .descriptor
            .piece_hash_hex(index)
            .ok_or_else(|| Error::invalid_argument(format!("no piece {index}")))?;
        let block_length = self.descriptor.block_length.min(length);
        Piece::new(
            index,
            &hash,
            length,
            block_length,
            length.div_ceil(block_length),
        )
    }

    fn attach(&self, piece: &mut Piece) {
        let shared = Arc::clone(&self.shared);
        piece.set_listener(Box::new(move |index, verdict| shared.settle(index, verdict)));
    }
}

impl fmt::Debug for PieceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceManager")
            .field("info_hash", &self.descriptor.info_hash_hex())
            .field("pieces", &self.piece_count())
            .field("present", &self.present_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::piece::BlockWrite;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc::error::TryRecvError;

    const CONTENT: &[u8; 16] = b"abcdefghijklmnop";

    fn fixture() -> TorrentDescriptor {
        let hashes = CONTENT.chunks(4).map(codec::sha1).collect();
        TorrentDescriptor::new([7u8; 20], 16, hashes, 4, 2).unwrap()
    }

    #[test]
    fn test_checkout_and_complete_fires_once() {
        let manager = PieceManager::new(fixture());
        let mut events = manager.subscribe();

        let mut piece = manager.check_out(0).unwrap();
        assert_eq!(piece.length(), 4);
        assert_eq!(manager.status(0), Some(PieceStatus::CheckedOut));

        assert_eq!(piece.put_block(0, b"ab").unwrap(), BlockWrite::Stored);
        assert_matches!(piece.put_block(2, b"cd").unwrap(), BlockWrite::Finished(_));
        piece.put_block(2, b"cd").unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            PieceEvent::Completed {
                index: 0,
                data: Bytes::from_static(b"abcd")
            }
        );
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(manager.status(0), Some(PieceStatus::Present));
        assert_eq!(manager.present_count(), 1);
        assert!(!manager.is_complete());
    }

    #[test]
    fn test_checkout_rejects_non_missing() {
        let manager = PieceManager::new(fixture());
        let _piece = manager.check_out(1).unwrap();
        assert_matches!(manager.check_out(1), Err(Error::InvalidState(_)));
        assert_matches!(manager.check_out(4), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_corrupted_piece_is_requeued() {
        let manager = PieceManager::new(fixture());
        let mut events = manager.subscribe();

        let mut piece = manager.check_out(2).unwrap();
        piece.put_block(0, b"ij").unwrap();
        piece.put_block(2, b"??").unwrap();

        assert_eq!(events.try_recv().unwrap(), PieceEvent::Corrupted { index: 2 });
        assert_eq!(manager.status(2), Some(PieceStatus::Missing));

        let mut again = manager.check_out(2).unwrap();
        again.put_block(0, b"ij").unwrap();
        again.put_block(2, b"kl").unwrap();
        assert_eq!(manager.status(2), Some(PieceStatus::Present));
    }

    #[test]
    fn test_is_complete_after_all_pieces() {
        let manager = PieceManager::new(fixture());
        for index in 0..4u32 {
            let mut piece = manager.check_out(index).unwrap();
            let start = index as usize * 4;
            piece.put_block(0, &CONTENT[start..start + 2]).unwrap();
            piece.put_block(2, &CONTENT[start + 2..start + 4]).unwrap();
        }
        assert!(manager.is_complete());
        assert_eq!(manager.to_wire_bitfield().bits, vec![0b1111_0000]);
    }

    #[test]
    fn test_short_last_piece_and_block() {
        let content = b"abcdefghij";
        let hashes = content.chunks(4).map(codec::sha1).collect();
        let descriptor = TorrentDescriptor::new([1u8; 20], 10, hashes, 4, 3).unwrap();
        let manager = PieceManager::new(descriptor);

        let first = manager.check_out(0).unwrap();
        assert_eq!(first.block_count(), 2);
        assert_eq!(first.block_size(1), Some(1));

        let mut last = manager.check_out(2).unwrap();
        assert_eq!(last.length(), 2);
        assert_eq!(last.block_count(), 1);
        assert_matches!(
            last.put_block(0, b"ij").unwrap(),
            BlockWrite::Finished(PieceVerdict::Completed(_))
        );
    }

    #[test]
    fn test_select_is_sequential_and_respects_availability() {
        let manager = PieceManager::new(fixture());
        assert_eq!(manager.select_next_to_check_out(None), Some(0));

        let mut remote = Bitfield::from_piece_count(4);
        remote.set_piece(2);
        remote.set_piece(3);
        assert_eq!(manager.select_next_to_check_out(Some(&remote)), Some(2));

        let piece = manager.check_out_next(Some(&remote)).unwrap();
        assert_eq!(piece.index(), 2);
        assert_eq!(manager.select_next_to_check_out(Some(&remote)), Some(3));
    }

    #[test]
    fn test_release_returns_piece_to_missing() {
        let manager = PieceManager::new(fixture());
        let _piece = manager.check_out(3).unwrap();
        manager.release(3).unwrap();
        assert_eq!(manager.status(3), Some(PieceStatus::Missing));
        assert_matches!(manager.release(3), Err(Error::InvalidState(_)));
    }

    #[test]
    fn test_snapshot_seeds_bitfield() {
        let snapshot = [
            PieceStatus::Present,
            PieceStatus::CheckedOut,
            PieceStatus::Missing,
            PieceStatus::Present,
        ];
        let manager = PieceManager::with_snapshot(fixture(), &snapshot).unwrap();
        assert_eq!(manager.status(1), Some(PieceStatus::Missing));
        assert_matches!(manager.check_out(0), Err(Error::InvalidState(_)));
        assert_eq!(manager.select_next_to_check_out(None), Some(1));

        assert_matches!(
            PieceManager::with_snapshot(fixture(), &snapshot[..2]),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_debug_shows_progress() {
        let manager =
            PieceManager::with_snapshot(fixture(), &[PieceStatus::Present; 4]).unwrap();
        let rendered = format!("{manager:?}");
        assert!(rendered.contains("pieces: 4"));
        assert!(rendered.contains("present: 4"));
    }

    #[test]
    fn test_concurrent_checkout_hands_out_each_piece_once() {
        let manager = PieceManager::new(fixture());
        let handed_out: Vec<u32> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let manager = manager.clone();
                    scope.spawn(move || {
                        manager
                            .check_out_next(None)
                            .map(|piece| piece.index())
                    })
                })
                .collect();
            workers
                .into_iter()
                .filter_map(|w| w.join().unwrap())
                .collect()
        });

        let mut sorted = handed_out.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }
}
