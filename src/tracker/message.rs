//! UDP tracker datagrams. All integers are big-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{HASH_LEN, read_u16, read_u32, read_u64};
use crate::error::{Error, Result};
use crate::tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, ScrapeEntry, parse_compact_peers};

/// Magic constant opening every connect request.
pub const PROTOCOL_ID: u64 = 0x41727101980;

const CONNECT_LEN: usize = 16;
const ANNOUNCE_LEN: usize = 98;
const ANNOUNCE_RESPONSE_HEADER: usize = 20;
const SCRAPE_HEADER: usize = 16;
const SCRAPE_ENTRY_LEN: usize = 12;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect = 0,
    Announce = 1,
    Scrape = 2,
    Error = 3,
}

impl TryFrom<u32> for Action {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Announce),
            2 => Ok(Self::Scrape),
            3 => Ok(Self::Error),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerMessage {
    Connect {
        transaction_id: u32,
    },
    ConnectResponse {
        transaction_id: u32,
        connection_id: u64,
    },
    Announce {
        connection_id: u64,
        transaction_id: u32,
        request: AnnounceRequest,
        ip: u32,
        key: u32,
    },
    AnnounceResponse {
        transaction_id: u32,
        response: AnnounceResponse,
    },
    Scrape {
        connection_id: u64,
        transaction_id: u32,
        info_hashes: Vec<[u8; HASH_LEN]>,
    },
    ScrapeResponse {
        transaction_id: u32,
        entries: Vec<ScrapeEntry>,
    },
    Error {
        transaction_id: u32,
        message: String,
    },
}

impl TrackerMessage {
    pub fn action(&self) -> Action {
        match self {
            Self::Connect { .. } | Self::ConnectResponse { .. } => Action::Connect,
            Self::Announce { .. } | Self::AnnounceResponse { .. } => Action::Announce,
            Self::Scrape { .. } | Self::ScrapeResponse { .. } => Action::Scrape,
            Self::Error { .. } => Action::Error,
        }
    }

    pub fn transaction_id(&self) -> u32 {
        match self {
            Self::Connect { transaction_id }
            | Self::ConnectResponse { transaction_id, .. }
            | Self::Announce { transaction_id, .. }
            | Self::AnnounceResponse { transaction_id, .. }
            | Self::Scrape { transaction_id, .. }
            | Self::ScrapeResponse { transaction_id, .. }
            | Self::Error { transaction_id, .. } => *transaction_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Connect { transaction_id } => {
                buf.put_u64(PROTOCOL_ID);
                buf.put_u32(Action::Connect as u32);
                buf.put_u32(*transaction_id);
            }
            Self::ConnectResponse {
                transaction_id,
                connection_id,
            } => {
                buf.put_u32(Action::Connect as u32);
                buf.put_u32(*transaction_id);
                buf.put_u64(*connection_id);
            }
            Self::Announce {
                connection_id,
                transaction_id,
                request,
                ip,
                key,
            } => {
                buf.reserve(ANNOUNCE_LEN);
                buf.put_u64(*connection_id);
                buf.put_u32(Action::Announce as u32);
                buf.put_u32(*transaction_id);
                buf.put_slice(&request.info_hash);
                buf.put_slice(&request.peer_id);
                buf.put_u64(request.downloaded);
                buf.put_u64(request.left);
                buf.put_u64(request.uploaded);
                buf.put_u32(request.event.udp_id());
                buf.put_u32(*ip);
                buf.put_u32(*key);
                buf.put_i32(request.num_want);
                buf.put_u16(request.port);
            }
            Self::AnnounceResponse {
                transaction_id,
                response,
            } => {
                buf.put_u32(Action::Announce as u32);
                buf.put_u32(*transaction_id);
                buf.put_u32(response.interval);
                buf.put_u32(response.leechers);
                buf.put_u32(response.seeders);
                for peer in &response.peers {
                    // compact entries are IPv4 only
                    if let std::net::SocketAddr::V4(v4) = peer {
                        buf.put_slice(&v4.ip().octets());
                        buf.put_u16(v4.port());
                    }
                }
            }
            Self::Scrape {
                connection_id,
                transaction_id,
                info_hashes,
            } => {
                buf.put_u64(*connection_id);
                buf.put_u32(Action::Scrape as u32);
                buf.put_u32(*transaction_id);
                for hash in info_hashes {
                    buf.put_slice(hash);
                }
            }
            Self::ScrapeResponse {
                transaction_id,
                entries,
            } => {
                buf.put_u32(Action::Scrape as u32);
                buf.put_u32(*transaction_id);
                for entry in entries {
                    buf.put_u32(entry.seeders);
                    buf.put_u32(entry.completed);
                    buf.put_u32(entry.leechers);
                }
            }
            Self::Error {
                transaction_id,
                message,
            } => {
                buf.put_u32(Action::Error as u32);
                buf.put_u32(*transaction_id);
                buf.put_slice(message.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decodes a client-to-tracker datagram.
    pub fn decode_request(buf: &[u8]) -> Result<Self> {
        let head = read_u64(buf, 0).ok_or_else(|| short("request", buf.len()))?;
        let action = read_action(buf, 8)?;
        let transaction_id = read_u32(buf, 12).ok_or_else(|| short("request", buf.len()))?;

        match action {
            Action::Connect => {
                if head != PROTOCOL_ID {
                    return Err(Error::protocol(format!("bad protocol id {head:#x}")));
                }
                expect_len("connect", buf, CONNECT_LEN)?;
                Ok(Self::Connect { transaction_id })
            }
            Action::Announce => {
                expect_len("announce", buf, ANNOUNCE_LEN)?;
                let event_id = read_u32(buf, 80).unwrap_or_default();
                let event = AnnounceEvent::from_udp_id(event_id)
                    .ok_or_else(|| Error::protocol(format!("unknown announce event {event_id}")))?;
                let request = AnnounceRequest {
                    info_hash: hash_at(buf, 16),
                    peer_id: hash_at(buf, 36),
                    downloaded: read_u64(buf, 56).unwrap_or_default(),
                    left: read_u64(buf, 64).unwrap_or_default(),
                    uploaded: read_u64(buf, 72).unwrap_or_default(),
                    event,
                    num_want: read_u32(buf, 92).unwrap_or_default() as i32,
                    port: read_u16(buf, 96).unwrap_or_default(),
                };
                Ok(Self::Announce {
                    connection_id: head,
                    transaction_id,
                    request,
                    ip: read_u32(buf, 84).unwrap_or_default(),
                    key: read_u32(buf, 88).unwrap_or_default(),
                })
            }
            Action::Scrape => {
                let hashes = &buf[SCRAPE_HEADER..];
                if hashes.is_empty() || hashes.len() % HASH_LEN != 0 {
                    return Err(Error::protocol(format!(
                        "scrape with {} bytes of info hashes",
                        hashes.len()
                    )));
                }
                Ok(Self::Scrape {
                    connection_id: head,
                    transaction_id,
                    info_hashes: hashes.chunks_exact(HASH_LEN).map(|c| hash_at(c, 0)).collect(),
                })
            }
            Action::Error => Err(Error::protocol("error action in a request")),
        }
    }

    /// Decodes a tracker-to-client datagram.
    pub fn decode_response(buf: &[u8]) -> Result<Self> {
        let action = read_action(buf, 0)?;
        let transaction_id = read_u32(buf, 4).ok_or_else(|| short("response", buf.len()))?;

        match action {
            Action::Connect => {
                expect_len("connect response", buf, CONNECT_LEN)?;
                Ok(Self::ConnectResponse {
                    transaction_id,
                    connection_id: read_u64(buf, 8).unwrap_or_default(),
                })
            }
            Action::Announce => {
                if buf.len() < ANNOUNCE_RESPONSE_HEADER {
                    return Err(short("announce response", buf.len()));
                }
                let peers = parse_compact_peers(&buf[ANNOUNCE_RESPONSE_HEADER..]).ok_or_else(|| {
                    Error::protocol("announce response peers are not 6-byte entries")
                })?;
                Ok(Self::AnnounceResponse {
                    transaction_id,
                    response: AnnounceResponse {
                        interval: read_u32(buf, 8).unwrap_or_default(),
                        leechers: read_u32(buf, 12).unwrap_or_default(),
                        seeders: read_u32(buf, 16).unwrap_or_default(),
                        peers,
                    },
                })
            }
            Action::Scrape => {
                let body = &buf[8..];
                if body.len() % SCRAPE_ENTRY_LEN != 0 {
                    return Err(Error::protocol(format!(
                        "scrape response body of {} bytes",
                        body.len()
                    )));
                }
                let entries = body
                    .chunks_exact(SCRAPE_ENTRY_LEN)
                    .map(|c| ScrapeEntry {
                        seeders: read_u32(c, 0).unwrap_or_default(),
                        completed: read_u32(c, 4).unwrap_or_default(),
                        leechers: read_u32(c, 8).unwrap_or_default(),
                    })
                    .collect();
                Ok(Self::ScrapeResponse {
                    transaction_id,
                    entries,
                })
            }
            Action::Error => Ok(Self::Error {
                transaction_id,
                message: String::from_utf8_lossy(&buf[8..]).into_owned(),
            }),
        }
    }
}

fn read_action(buf: &[u8], at: usize) -> Result<Action> {
    let raw = read_u32(buf, at).ok_or_else(|| short("datagram", buf.len()))?;
    Action::try_from(raw).map_err(|a| Error::protocol(format!("unknown action {a}")))
}

fn expect_len(what: &str, buf: &[u8], len: usize) -> Result<()> {
    if buf.len() != len {
        return Err(Error::protocol(format!(
            "{what} is {} bytes, expected {len}",
            buf.len()
        )));
    }
    Ok(())
}

fn short(what: &str, len: usize) -> Error {
    Error::protocol(format!("{what} too short ({len} bytes)"))
}

// callers check the length first
fn hash_at(buf: &[u8], at: usize) -> [u8; HASH_LEN] {
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&buf[at..at + HASH_LEN]);
    hash
}
