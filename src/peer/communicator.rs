use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec::Decoded;
use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use crate::throttle::ThrottlingManager;

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Closed,
}

#[derive(Debug)]
pub enum CommunicatorEvent {
    Message(Message),
    /// The decode loop stopped. Every error raised here is fatal.
    Error { error: Error, fatal: bool },
}

/// Owns the socket of one peer: handshake, throttled reads and writes, and
/// the loop turning received bytes into [`CommunicatorEvent`]s.
pub struct PeerCommunicator {
    addr: SocketAddr,
    config: PeerConfig,
    throttle: Arc<ThrottlingManager>,
    state: Arc<Mutex<ConnectionState>>,
    reader: Option<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    recv_buf: BytesMut,
    received: Arc<AtomicU64>,
    sent: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl PeerCommunicator {
    pub async fn connect(
        addr: SocketAddr,
        config: PeerConfig,
        throttle: Arc<ThrottlingManager>,
    ) -> Result<Self> {
        debug!(%addr, "connecting");
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(addr, stream, config, throttle))
    }

    /// Wraps an already-open transport.
    pub fn from_stream<S>(
        addr: SocketAddr,
        stream: S,
        config: PeerConfig,
        throttle: Arc<ThrottlingManager>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown, _) = watch::channel(false);
        Self {
            addr,
            config,
            throttle,
            state: Arc::new(Mutex::new(ConnectionState::Connecting)),
            reader: Some(Box::new(reader)),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            recv_buf: BytesMut::with_capacity(32 * 1024),
            received: Arc::new(AtomicU64::new(0)),
            sent: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Outgoing side: sends our handshake, then waits for theirs.
    pub async fn handshake(&mut self, ours: &Handshake) -> Result<Handshake> {
        self.exchange_handshakes(ours, true).await
    }

    /// Incoming side: waits for the remote handshake, then answers.
    pub async fn accept_handshake(&mut self, ours: &Handshake) -> Result<Handshake> {
        self.exchange_handshakes(ours, false).await
    }

    async fn exchange_handshakes(&mut self, ours: &Handshake, initiator: bool) -> Result<Handshake> {
        if self.state() != ConnectionState::Connecting {
            return Err(Error::invalid_state(format!(
                "handshake in state {:?}",
                self.state()
            )));
        }
        self.set_state(ConnectionState::Handshaking);

        let result = async {
            if initiator {
                self.write_frame(&ours.encode()).await?;
            }
            let theirs = self.receive_handshake().await?;
            if theirs.infohash != ours.infohash {
                return Err(Error::protocol("info hash mismatch"));
            }
            if !initiator {
                self.write_frame(&ours.encode()).await?;
            }
            Ok(theirs)
        }
        .await;

        match result {
            Ok(theirs) => {
                self.set_state(ConnectionState::Connected);
                debug!(addr = %self.addr, fast = theirs.supports_fast_peer(), "handshake complete");
                Ok(theirs)
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "handshake failed");
                self.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// The timeout covers the whole handshake, not each read.
    async fn receive_handshake(&mut self) -> Result<Handshake> {
        let deadline = self.config.handshake_timeout;
        timeout(deadline, self.read_handshake()).await?
    }

    async fn read_handshake(&mut self) -> Result<Handshake> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::invalid_state("reader already taken"))?;

        loop {
            match Handshake::try_decode(&self.recv_buf) {
                Decoded::Complete { value, consumed } => {
                    self.recv_buf.advance(consumed);
                    return Ok(value);
                }
                Decoded::Invalid(reason) => return Err(Error::Protocol(reason)),
                Decoded::Incomplete => {}
            }

            let n = reader.read_buf(&mut self.recv_buf).await?;
            if n == 0 {
                return Err(connection_closed());
            }
            self.received.fetch_add(n as u64, Ordering::Relaxed);
            self.throttle.acquire_read(n).await;
        }
    }

    /// Spawns the decode loop. Bytes that arrived together with the
    /// handshake are decoded first.
    pub fn start(&mut self) -> Result<mpsc::Receiver<CommunicatorEvent>> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::invalid_state(format!(
                "cannot start decode loop in state {:?}",
                self.state()
            )));
        }
        let reader = self
            .reader
            .take()
            .ok_or_else(|| Error::invalid_state("decode loop already started"))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let decode_loop = DecodeLoop {
            addr: self.addr,
            reader,
            buf: std::mem::take(&mut self.recv_buf),
            chunk: vec![0u8; self.config.read_chunk.max(1)],
            idle_timeout: self.config.idle_timeout,
            throttle: Arc::clone(&self.throttle),
            state: Arc::clone(&self.state),
            received: Arc::clone(&self.received),
            events: tx,
            shutdown: self.shutdown.subscribe(),
        };
        tokio::spawn(decode_loop.run());
        Ok(rx)
    }

    /// Sends one message once the write budget allows it.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::invalid_state(format!(
                "send in state {:?}",
                self.state()
            )));
        }
        trace!(addr = %self.addr, ?message, "send");
        let frame = message.encode();
        if let Err(e) = self.write_frame(&frame).await {
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }
        Ok(())
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        self.throttle.acquire_write(frame.len()).await;
        let mut writer = self.writer.lock().await;
        timeout(self.config.idle_timeout, writer.write_all(frame)).await??;
        self.sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Stops the decode loop and shuts the write side down.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);
        let _ = self.shutdown.send(true);
        let mut writer = self.writer.lock().await;
        if let Err(e) = timeout(Duration::from_secs(1), writer.shutdown()).await {
            trace!(addr = %self.addr, error = %e, "shutdown timed out");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

impl Drop for PeerCommunicator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct DecodeLoop {
    addr: SocketAddr,
    reader: BoxedReader,
    buf: BytesMut,
    chunk: Vec<u8>,
    idle_timeout: Duration,
    throttle: Arc<ThrottlingManager>,
    state: Arc<Mutex<ConnectionState>>,
    received: Arc<AtomicU64>,
    events: mpsc::Sender<CommunicatorEvent>,
    shutdown: watch::Receiver<bool>,
}

impl DecodeLoop {
    async fn run(mut self) {
        if let Err(error) = self.pump().await {
            debug!(addr = %self.addr, %error, "decode loop stopped");
            *self.state.lock() = ConnectionState::Closed;
            let _ = self
                .events
                .send(CommunicatorEvent::Error { error, fatal: true })
                .await;
        }
    }

    /// Runs until an error, or `Ok` on shutdown or when nobody listens.
    async fn pump(&mut self) -> Result<()> {
        loop {
            loop {
                match Message::try_decode(&self.buf) {
                    Decoded::Complete { value, consumed } => {
                        self.buf.advance(consumed);
                        trace!(addr = %self.addr, message = ?value, "received");
                        if self.events.send(CommunicatorEvent::Message(value)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Decoded::Incomplete => break,
                    Decoded::Invalid(reason) => return Err(Error::Protocol(reason)),
                }
            }

            let read = tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                read = timeout(self.idle_timeout, self.reader.read(&mut self.chunk)) => read,
            };
            let n = read??;
            if n == 0 {
                return Err(connection_closed());
            }
            self.received.fetch_add(n as u64, Ordering::Relaxed);
            self.throttle.acquire_read(n).await;
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }
}

fn connection_closed() -> Error {
    Error::Transport(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed by peer",
    ))
}
