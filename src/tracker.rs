//! Periodic tracker announces over UDP or HTTP.
//!
//! A [`Tracker`] owns the announce counters and event, and runs a single
//! timer task that announces, waits for the tracker-provided interval and
//! announces again. The transport is a [`TrackerProtocol`] chosen from the
//! URL scheme.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::codec::HASH_LEN;
use crate::config::TrackerConfig;
use crate::error::{Error, Result};

pub mod http;
pub mod message;
pub mod udp;

pub use http::HttpTracker;
pub use message::TrackerMessage;
pub use udp::UdpTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

impl AnnounceEvent {
    pub fn udp_id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }

    pub fn from_udp_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Completed),
            2 => Some(Self::Started),
            3 => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Value of the HTTP `event` parameter; empty for `None`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Completed => "completed",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// Everything one announce reports, shared by both transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; HASH_LEN],
    pub peer_id: [u8; HASH_LEN],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    /// Negative asks for the tracker default.
    pub num_want: i32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnounceResponse {
    /// Seconds until the next announce.
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// Swarm statistics for one info hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrapeEntry {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

/// Parses compact IPv4 peers, 6 bytes each. `None` when the length is not
/// a multiple of 6.
pub fn parse_compact_peers(bytes: &[u8]) -> Option<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return None;
    }
    let peers = bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect();
    Some(peers)
}

/// Transport side of a tracker.
#[async_trait]
pub trait TrackerProtocol: Send {
    /// Called once when tracking starts.
    async fn on_start(&mut self) -> Result<()>;

    async fn on_announce(&mut self, request: &AnnounceRequest) -> Result<AnnounceResponse>;

    /// Called after the final announce; releases transport resources.
    async fn on_stop(&mut self);

    async fn scrape(&mut self, info_hashes: &[[u8; HASH_LEN]]) -> Result<Vec<ScrapeEntry>>;
}

#[derive(Debug, Clone)]
struct TrackerState {
    info_hash: [u8; HASH_LEN],
    peer_id: [u8; HASH_LEN],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    num_want: i32,
    event: AnnounceEvent,
    interval: Duration,
}

impl TrackerState {
    fn request(&self) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            downloaded: self.downloaded,
            left: self.left,
            uploaded: self.uploaded,
            event: self.event,
            num_want: self.num_want,
            port: self.port,
        }
    }
}

struct Inner {
    url: String,
    state: Mutex<TrackerState>,
    protocol: tokio::sync::Mutex<Box<dyn TrackerProtocol>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AnnounceResponse>>>,
}

impl Inner {
    /// One announce. Failures are logged and leave the state untouched.
    async fn announce(&self) -> Option<AnnounceResponse> {
        let mut protocol = self.protocol.lock().await;
        let request = self.state.lock().request();

        match protocol.on_announce(&request).await {
            Ok(response) => {
                info!(
                    url = %self.url,
                    event = ?request.event,
                    peers = response.peers.len(),
                    interval = response.interval,
                    "announce ok"
                );
                {
                    let mut state = self.state.lock();
                    if response.interval > 0 {
                        state.interval = Duration::from_secs(response.interval as u64);
                    }
                    if state.event == request.event && request.event != AnnounceEvent::Stopped {
                        state.event = AnnounceEvent::None;
                    }
                }
                self.subscribers
                    .lock()
                    .retain(|tx| tx.send(response.clone()).is_ok());
                Some(response)
            }
            Err(e) => {
                warn!(url = %self.url, event = ?request.event, error = %e, "announce failed");
                None
            }
        }
    }
}

/// Announces one torrent to one tracker.
pub struct Tracker {
    inner: Arc<Inner>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Tracker {
    /// Picks UDP or HTTP from the scheme of `url`.
    pub fn new(
        url: &str,
        info_hash: [u8; HASH_LEN],
        peer_id: [u8; HASH_LEN],
        port: u16,
        left: u64,
        config: TrackerConfig,
    ) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::invalid_argument(format!("tracker url {url:?}: {e}")))?;
        let protocol: Box<dyn TrackerProtocol> = match parsed.scheme() {
            "udp" => Box::new(UdpTracker::new(&parsed, config.clone())?),
            "http" | "https" => Box::new(HttpTracker::new(parsed, config.clone())),
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported tracker scheme {other:?}"
                )));
            }
        };
        Ok(Self::with_protocol(url, protocol, info_hash, peer_id, port, left, &config))
    }

    pub fn with_protocol(
        url: &str,
        protocol: Box<dyn TrackerProtocol>,
        info_hash: [u8; HASH_LEN],
        peer_id: [u8; HASH_LEN],
        port: u16,
        left: u64,
        config: &TrackerConfig,
    ) -> Self {
        let state = TrackerState {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            num_want: config.num_want,
            event: AnnounceEvent::None,
            interval: config.default_interval,
        };
        Self {
            inner: Arc::new(Inner {
                url: url.to_string(),
                state: Mutex::new(state),
                protocol: tokio::sync::Mutex::new(protocol),
                subscribers: Mutex::new(Vec::new()),
            }),
            shutdown: None,
            task: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_tracking(&self) -> bool {
        self.task.is_some()
    }

    /// Current announce interval: the default until a tracker sets one.
    pub fn interval(&self) -> Duration {
        self.inner.state.lock().interval
    }

    /// Event the next announce will carry.
    pub fn event(&self) -> AnnounceEvent {
        self.inner.state.lock().event
    }

    pub fn update_stats(&self, uploaded: u64, downloaded: u64, left: u64) {
        let mut state = self.inner.state.lock();
        state.uploaded = uploaded;
        state.downloaded = downloaded;
        state.left = left;
    }

    pub fn set_num_want(&self, num_want: i32) {
        self.inner.state.lock().num_want = num_want;
    }

    /// Marks the next announce as `Completed`.
    pub fn set_completed(&self) {
        let mut state = self.inner.state.lock();
        state.left = 0;
        state.event = AnnounceEvent::Completed;
    }

    /// Receives every successful announce response from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AnnounceResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Announces immediately, outside the timer.
    pub async fn announce_now(&self) -> Option<AnnounceResponse> {
        self.inner.announce().await
    }

    pub async fn scrape(&self) -> Result<ScrapeEntry> {
        let info_hash = self.inner.state.lock().info_hash;
        let entries = self.inner.protocol.lock().await.scrape(&[info_hash]).await?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::Tracker("scrape returned no entries".into()))
    }

    /// Announces `Started` now, then again every interval.
    pub async fn start_tracking(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::invalid_state("tracker already running"));
        }
        self.inner.state.lock().event = AnnounceEvent::Started;
        if let Err(e) = self.inner.protocol.lock().await.on_start().await {
            // the first announce retries the connection
            warn!(url = %self.inner.url, error = %e, "tracker start failed");
        }

        let (shutdown, mut stopped) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        self.task = Some(tokio::spawn(async move {
            loop {
                inner.announce().await;
                let wait = inner.state.lock().interval;
                debug!(url = %inner.url, ?wait, "next announce scheduled");
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }));
        self.shutdown = Some(shutdown);
        Ok(())
    }

    /// Stops the timer, then sends a final `Stopped` announce.
    pub async fn stop_tracking(&mut self) -> Result<()> {
        let (Some(shutdown), Some(task)) = (self.shutdown.take(), self.task.take()) else {
            return Err(Error::invalid_state("tracker is not running"));
        };
        let _ = shutdown.send(true);
        // an announce already in flight finishes first
        if let Err(e) = task.await {
            warn!(url = %self.inner.url, error = %e, "tracker task failed");
        }

        self.inner.state.lock().event = AnnounceEvent::Stopped;
        self.inner.announce().await;
        self.inner.protocol.lock().await.on_stop().await;
        Ok(())
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Tracker")
            .field("url", &self.inner.url)
            .field("event", &state.event)
            .field("interval", &state.interval)
            .field("tracking", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}
