//! Tunable parameters for peers, trackers and throttling.

use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub peer: PeerConfig,
    pub tracker: TrackerConfig,
    pub throttle: ThrottleConfig,
}

/// Peer wire session settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// A connection that delivers no bytes for this long is closed.
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Outstanding block requests older than this are issued again.
    pub request_timeout: Duration,
    pub max_pipeline_depth: usize,
    /// Unchoke the remote right after the handshake and serve its requests.
    pub upload_enabled: bool,
    /// Largest block length we agree to serve.
    pub max_request_length: u32,
    /// Bytes read from the socket per read call.
    pub read_chunk: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(180),
            keep_alive_interval: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            max_pipeline_depth: 5,
            upload_enabled: true,
            max_request_length: 128 * 1024,
            read_chunk: 32 * 1024,
        }
    }
}

/// Tracker announce settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub default_interval: Duration,
    pub udp_send_timeout: Duration,
    pub udp_receive_timeout: Duration,
    /// Connection IDs handed out by UDP trackers expire after this long.
    pub connection_id_lifetime: Duration,
    pub http_timeout: Duration,
    /// Peers requested per announce; negative means tracker default.
    pub num_want: i32,
    pub user_agent: &'static str,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(600),
            udp_send_timeout: Duration::from_secs(5),
            udp_receive_timeout: Duration::from_secs(15),
            connection_id_lifetime: Duration::from_secs(60),
            http_timeout: Duration::from_secs(30),
            num_want: -1,
            user_agent: "rs_swarm/0.1",
        }
    }
}

/// Bandwidth caps in bytes per second; 0 disables the cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
}
