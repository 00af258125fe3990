pub mod bencode;
pub mod codec;
pub mod config;
pub mod error;
pub mod peer;
pub mod piece;
pub mod piece_manager;
pub mod store;
pub mod throttle;
pub mod torrent;
pub mod tracker;

// Re-export commonly used types for easier access
pub use config::{ClientConfig, PeerConfig, ThrottleConfig, TrackerConfig};
pub use error::{Error, Result};
pub use peer::{Peer, PeerCommunicator, generate_peer_id};
pub use piece::{BlockWrite, Piece, PieceVerdict};
pub use piece_manager::{PieceEvent, PieceManager, PieceStatus};
pub use store::{BlockStore, MemoryBlockStore};
pub use throttle::ThrottlingManager;
pub use torrent::TorrentDescriptor;
pub use tracker::{AnnounceEvent, AnnounceResponse, ScrapeEntry, Tracker, TrackerProtocol};
