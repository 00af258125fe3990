use rand::Rng as _;
use rand::distr::Alphanumeric;

pub mod communicator;
pub mod handshake;
pub mod message;
pub mod session;

pub use communicator::{CommunicatorEvent, ConnectionState, PeerCommunicator};
pub use handshake::Handshake;
pub use message::{Bitfield, BlockInfo, Message, MessageId};
pub use session::Peer;

const PSTR: &str = "BitTorrent protocol";
const PSTR_LEN: u8 = PSTR.len() as u8; // always 19

const PEER_ID_PREFIX: &[u8; 8] = b"-RS0100-";

/// Azureus-style peer id: client prefix followed by random alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::rng();
    for byte in &mut id[8..] {
        *byte = rng.sample(Alphanumeric);
    }
    id
}
