//! Read access to verified piece data, used to answer `Request` messages.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::piece_manager::{PieceEvent, PieceManager};

pub trait BlockStore: Send + Sync {
    /// Bytes `offset..offset + length` of a verified piece, if we have them.
    fn read_block(&self, index: u32, offset: u32, length: u32) -> Option<Bytes>;
}

/// Keeps verified pieces in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    pieces: Arc<RwLock<HashMap<u32, Bytes>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: u32, data: Bytes) {
        self.pieces.write().insert(index, data);
    }

    pub fn contains(&self, index: u32) -> bool {
        self.pieces.read().contains_key(&index)
    }

    /// Stores every piece `manager` reports as completed until it is dropped.
    pub fn follow(&self, manager: &PieceManager) -> JoinHandle<()> {
        let mut events = manager.subscribe();
        let store = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let PieceEvent::Completed { index, data } = event {
                    store.insert(index, data);
                }
            }
        })
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_block(&self, index: u32, offset: u32, length: u32) -> Option<Bytes> {
        let pieces = self.pieces.read();
        let piece = pieces.get(&index)?;
        let start = offset as usize;
        let end = start.checked_add(length as usize)?;
        if end > piece.len() {
            return None;
        }
        Some(piece.slice(start..end))
    }
}
