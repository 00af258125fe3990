use async_trait::async_trait;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};
use tracing::{debug, trace, warn};
use url::Url;

use crate::codec::HASH_LEN;
use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::tracker::message::TrackerMessage;
use crate::tracker::{AnnounceRequest, AnnounceResponse, ScrapeEntry, TrackerProtocol};

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65_507;

/// BEP 15 tracker client: a connect transaction, then announces and
/// scrapes carrying the connection id it returned.
#[derive(Debug)]
pub struct UdpTracker {
    host: String,
    config: TrackerConfig,
    socket: Option<UdpSocket>,
    connection: Option<(u64, Instant)>,
    key: u32,
}

impl UdpTracker {
    pub fn new(url: &Url, config: TrackerConfig) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_argument(format!("udp tracker {url} has no host")))?;
        let port = url
            .port()
            .ok_or_else(|| Error::invalid_argument(format!("udp tracker {url} has no port")))?;
        Ok(Self {
            host: format!("{host}:{port}"),
            config,
            socket: None,
            connection: None,
            key: rand::rng().random(),
        })
    }

    /// Connection id held from the last connect, if still fresh.
    pub fn connection_id(&self) -> Option<u64> {
        self.connection
            .filter(|(_, obtained)| obtained.elapsed() < self.config.connection_id_lifetime)
            .map(|(id, _)| id)
    }

    async fn ensure_socket(&mut self) -> Result<&UdpSocket> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&self.host).await?;
            debug!(tracker = %self.host, local = ?socket.local_addr().ok(), "udp socket ready");
            self.socket = Some(socket);
        }
        self.socket
            .as_ref()
            .ok_or_else(|| Error::invalid_state("udp socket missing"))
    }

    /// Sends `request` and waits for one datagram back.
    async fn round_trip(&mut self, request: &TrackerMessage) -> Result<TrackerMessage> {
        let send_timeout = self.config.udp_send_timeout;
        let receive_timeout = self.config.udp_receive_timeout;
        let host = self.host.clone();
        let socket = self.ensure_socket().await?;

        trace!(tracker = %host, ?request, "udp send");
        timeout(send_timeout, socket.send(&request.encode())).await??;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = timeout(receive_timeout, socket.recv(&mut buf)).await??;
        let response = TrackerMessage::decode_response(&buf[..n])?;
        trace!(tracker = %host, ?response, "udp receive");

        if let TrackerMessage::Error { message, .. } = response {
            warn!(tracker = %host, %message, "tracker error");
            return Err(Error::Tracker(message));
        }
        if response.transaction_id() != request.transaction_id()
            || response.action() != request.action()
        {
            return Err(Error::protocol(format!(
                "response {:?}/{} does not match request {:?}/{}",
                response.action(),
                response.transaction_id(),
                request.action(),
                request.transaction_id()
            )));
        }
        Ok(response)
    }

    async fn connect(&mut self) -> Result<u64> {
        self.connection = None;
        let transaction_id: u32 = rand::rng().random();
        let response = self
            .round_trip(&TrackerMessage::Connect { transaction_id })
            .await?;
        let TrackerMessage::ConnectResponse { connection_id, .. } = response else {
            return Err(Error::protocol("connect answered with another action"));
        };
        debug!(tracker = %self.host, connection_id, "udp tracker connected");
        self.connection = Some((connection_id, Instant::now()));
        Ok(connection_id)
    }

    async fn fresh_connection_id(&mut self) -> Result<u64> {
        match self.connection_id() {
            Some(id) => Ok(id),
            None => self.connect().await,
        }
    }
}

#[async_trait]
impl TrackerProtocol for UdpTracker {
    async fn on_start(&mut self) -> Result<()> {
        self.connect().await.map(|_| ())
    }

    async fn on_announce(&mut self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let connection_id = self.fresh_connection_id().await?;
        let message = TrackerMessage::Announce {
            connection_id,
            transaction_id: rand::rng().random(),
            request: request.clone(),
            ip: 0,
            key: self.key,
        };
        match self.round_trip(&message).await? {
            TrackerMessage::AnnounceResponse { response, .. } => Ok(response),
            other => Err(Error::protocol(format!("unexpected announce reply {other:?}"))),
        }
    }

    async fn on_stop(&mut self) {
        self.connection = None;
        self.socket = None;
    }

    async fn scrape(&mut self, info_hashes: &[[u8; HASH_LEN]]) -> Result<Vec<ScrapeEntry>> {
        if info_hashes.is_empty() {
            return Err(Error::invalid_argument("scrape needs at least one info hash"));
        }
        let connection_id = self.fresh_connection_id().await?;
        let message = TrackerMessage::Scrape {
            connection_id,
            transaction_id: rand::rng().random(),
            info_hashes: info_hashes.to_vec(),
        };
        match self.round_trip(&message).await? {
            TrackerMessage::ScrapeResponse { entries, .. } => Ok(entries),
            other => Err(Error::protocol(format!("unexpected scrape reply {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AnnounceEvent;
    use assert_matches::assert_matches;
    use std::net::SocketAddr;
    use std::time::Duration;

    const CONNECTION_ID: u64 = 0xC0FFEE;

    async fn fake_tracker() -> (UdpSocket, Url) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let url = Url::parse(&format!("udp://127.0.0.1:{port}/announce")).unwrap();
        (socket, url)
    }

    async fn receive(socket: &UdpSocket) -> (TrackerMessage, SocketAddr) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        (TrackerMessage::decode_request(&buf[..n]).unwrap(), from)
    }

    async fn answer_connect(socket: &UdpSocket) {
        let (request, from) = receive(socket).await;
        assert_matches!(request, TrackerMessage::Connect { .. });
        let reply = TrackerMessage::ConnectResponse {
            transaction_id: request.transaction_id(),
            connection_id: CONNECTION_ID,
        };
        socket.send_to(&reply.encode(), from).await.unwrap();
    }

    fn announce_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [3u8; 20],
            peer_id: [4u8; 20],
            downloaded: 0,
            left: 100,
            uploaded: 0,
            event: AnnounceEvent::Started,
            num_want: -1,
            port: 6881,
        }
    }

    #[test]
    fn test_new_requires_host_and_port() {
        let config = TrackerConfig::default();
        let url = Url::parse("udp://tracker.test:6969/announce").unwrap();
        assert!(UdpTracker::new(&url, config.clone()).is_ok());
        let url = Url::parse("udp://tracker.test/announce").unwrap();
        assert_matches!(UdpTracker::new(&url, config), Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_connect_then_announce() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(&url, TrackerConfig::default()).unwrap();

        let server_task = tokio::spawn(async move {
            answer_connect(&server).await;
            let (request, from) = receive(&server).await;
            let TrackerMessage::Announce {
                connection_id,
                transaction_id,
                request,
                ..
            } = request
            else {
                panic!("expected announce, got {request:?}");
            };
            assert_eq!(connection_id, CONNECTION_ID);
            assert_eq!(request.event, AnnounceEvent::Started);
            assert_eq!(request.port, 6881);

            let reply = TrackerMessage::AnnounceResponse {
                transaction_id,
                response: AnnounceResponse {
                    interval: 900,
                    leechers: 1,
                    seeders: 2,
                    peers: vec!["1.2.3.4:5000".parse().unwrap(), "5.6.7.8:6000".parse().unwrap()],
                },
            };
            server.send_to(&reply.encode(), from).await.unwrap();
        });

        let response = tracker.on_announce(&announce_request()).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1], "5.6.7.8:6000".parse::<SocketAddr>().unwrap());
        assert_eq!(tracker.connection_id(), Some(CONNECTION_ID));
    }

    #[tokio::test]
    async fn test_large_peer_list_is_not_truncated() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(&url, TrackerConfig::default()).unwrap();
        let peers: Vec<SocketAddr> = (0..400u16)
            .map(|i| SocketAddr::from(([10, 0, (i >> 8) as u8, i as u8], 6881 + i)))
            .collect();
        let expected = peers.clone();

        let server_task = tokio::spawn(async move {
            answer_connect(&server).await;
            let (request, from) = receive(&server).await;
            let reply = TrackerMessage::AnnounceResponse {
                transaction_id: request.transaction_id(),
                response: AnnounceResponse {
                    interval: 900,
                    leechers: 0,
                    seeders: 400,
                    peers,
                },
            };
            server.send_to(&reply.encode(), from).await.unwrap();
        });

        let response = tracker.on_announce(&announce_request()).await.unwrap();
        server_task.await.unwrap();
        assert_eq!(response.peers.len(), 400);
        assert_eq!(response.peers, expected);
    }

    #[tokio::test]
    async fn test_mismatched_transaction_fails_connect() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(&url, TrackerConfig::default()).unwrap();

        tokio::spawn(async move {
            let (request, from) = receive(&server).await;
            let reply = TrackerMessage::ConnectResponse {
                transaction_id: request.transaction_id().wrapping_add(1),
                connection_id: CONNECTION_ID,
            };
            server.send_to(&reply.encode(), from).await.unwrap();
        });

        assert_matches!(tracker.on_start().await, Err(Error::Protocol(_)));
        assert_eq!(tracker.connection_id(), None);
    }

    #[tokio::test]
    async fn test_error_datagram_is_tracker_error() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(&url, TrackerConfig::default()).unwrap();

        tokio::spawn(async move {
            answer_connect(&server).await;
            let (request, from) = receive(&server).await;
            let reply = TrackerMessage::Error {
                transaction_id: request.transaction_id(),
                message: "torrent not registered".into(),
            };
            server.send_to(&reply.encode(), from).await.unwrap();
        });

        assert_matches!(
            tracker.on_announce(&announce_request()).await,
            Err(Error::Tracker(message)) if message == "torrent not registered"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_tracker_times_out() {
        let (_server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(&url, TrackerConfig::default()).unwrap();

        let started = Instant::now();
        assert_matches!(tracker.on_announce(&announce_request()).await, Err(Error::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_scrape_reuses_connection() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(&url, TrackerConfig::default()).unwrap();

        let server_task = tokio::spawn(async move {
            answer_connect(&server).await;
            for _ in 0..2 {
                let (request, from) = receive(&server).await;
                let TrackerMessage::Scrape {
                    connection_id,
                    transaction_id,
                    info_hashes,
                } = request
                else {
                    panic!("expected scrape, got {request:?}");
                };
                assert_eq!(connection_id, CONNECTION_ID);
                let reply = TrackerMessage::ScrapeResponse {
                    transaction_id,
                    entries: info_hashes
                        .iter()
                        .map(|h| ScrapeEntry {
                            seeders: h[0] as u32,
                            completed: 0,
                            leechers: 1,
                        })
                        .collect(),
                };
                server.send_to(&reply.encode(), from).await.unwrap();
            }
        });

        let entries = tracker.scrape(&[[7u8; 20], [9u8; 20]]).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.seeders).collect::<Vec<_>>(), vec![7, 9]);
        let entries = tracker.scrape(&[[1u8; 20]]).await.unwrap();
        assert_eq!(entries.len(), 1);
        server_task.await.unwrap();

        assert_matches!(tracker.scrape(&[]).await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_id_is_refreshed() {
        let (_server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(&url, TrackerConfig::default()).unwrap();
        tracker.connection = Some((CONNECTION_ID, Instant::now()));
        assert_eq!(tracker.connection_id(), Some(CONNECTION_ID));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.connection_id(), None);
    }
}
