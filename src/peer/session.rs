use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::peer::communicator::{CommunicatorEvent, PeerCommunicator};
use crate::peer::handshake::Handshake;
use crate::peer::message::{Bitfield, BlockInfo, Message};
use crate::piece::{BlockWrite, Piece, PieceVerdict};
use crate::piece_manager::PieceManager;
use crate::store::BlockStore;
use crate::throttle::ThrottlingManager;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Protocol state machine for one remote peer.
///
/// Downloads one checked-out piece at a time with up to
/// `max_pipeline_depth` block requests in flight, and serves the remote's
/// requests from a [`BlockStore`].
pub struct Peer {
    communicator: PeerCommunicator,
    manager: PieceManager,
    store: Arc<dyn BlockStore>,
    peer_id: [u8; 20],
    config: PeerConfig,

    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    remote_bitfield: Bitfield,
    remote_peer_id: Option<[u8; 20]>,
    listen_port: Option<u16>,

    pending_requests: HashMap<BlockInfo, Instant>, // blocks we asked for, with send time
    current: Option<Piece>,
    replies: VecDeque<BlockInfo>,
    outbox: Vec<Message>,
    last_sent: Instant,
    uploaded: u64,
    downloaded: u64,
}

impl Peer {
    pub fn new(
        communicator: PeerCommunicator,
        manager: PieceManager,
        store: Arc<dyn BlockStore>,
        peer_id: [u8; 20],
        config: PeerConfig,
    ) -> Self {
        let remote_bitfield = Bitfield::from_piece_count(manager.piece_count() as usize);
        Self {
            communicator,
            manager,
            store,
            peer_id,
            config,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_bitfield,
            remote_peer_id: None,
            listen_port: None,
            pending_requests: HashMap::new(),
            current: None,
            replies: VecDeque::new(),
            outbox: Vec::new(),
            last_sent: Instant::now(),
            uploaded: 0,
            downloaded: 0,
        }
    }

    /// Opens a TCP connection to `addr`. The handshake happens in [`Peer::run`].
    pub async fn connect(
        addr: SocketAddr,
        manager: PieceManager,
        store: Arc<dyn BlockStore>,
        peer_id: [u8; 20],
        config: PeerConfig,
        throttle: Arc<ThrottlingManager>,
    ) -> Result<Self> {
        let communicator = PeerCommunicator::connect(addr, config.clone(), throttle).await?;
        Ok(Self::new(communicator, manager, store, peer_id, config))
    }

    pub fn addr(&self) -> SocketAddr {
        self.communicator.addr()
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }

    pub fn remote_bitfield(&self) -> &Bitfield {
        &self.remote_bitfield
    }

    /// Port announced by the remote in a `Port` message.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    pub fn is_choked(&self) -> bool {
        self.peer_choking
    }

    pub fn is_interested(&self) -> bool {
        self.am_interested
    }

    pub fn is_remote_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    /// Payload bytes served to the remote.
    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    /// Payload bytes received in `Piece` messages.
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Runs an outgoing session until the connection ends.
    pub async fn run(&mut self) -> Result<()> {
        self.drive(true).await
    }

    /// Runs a session for a connection the remote opened.
    pub async fn run_incoming(&mut self) -> Result<()> {
        self.drive(false).await
    }

    async fn drive(&mut self, initiator: bool) -> Result<()> {
        let result = self.session(initiator).await;
        if let Err(e) = &result {
            debug!(addr = %self.addr(), error = %e, "session ended");
        }
        self.teardown().await;
        result
    }

    async fn session(&mut self, initiator: bool) -> Result<()> {
        let ours = Handshake::new(self.manager.info_hash(), self.peer_id);
        let theirs = if initiator {
            self.communicator.handshake(&ours).await?
        } else {
            self.communicator.accept_handshake(&ours).await?
        };
        self.remote_peer_id = Some(theirs.peer_id);
        info!(addr = %self.addr(), "peer connected");

        let mut events = self.communicator.start()?;
        self.open();
        self.flush().await?;

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    self.process(event)?;
                    self.drain(&mut events)?;
                    self.after_batch();
                }
                _ = tick.tick() => self.on_tick(Instant::now()),
            }
            self.flush().await?;
        }
    }

    /// Processes every event already queued, so replies see the whole batch.
    fn drain(&mut self, events: &mut mpsc::Receiver<CommunicatorEvent>) -> Result<()> {
        while let Ok(event) = events.try_recv() {
            self.process(event)?;
        }
        Ok(())
    }

    fn process(&mut self, event: CommunicatorEvent) -> Result<()> {
        match event {
            CommunicatorEvent::Message(message) => self.handle_message(message),
            CommunicatorEvent::Error { error, .. } => Err(error),
        }
    }

    /// First messages after the handshake.
    fn open(&mut self) {
        if self.manager.present_count() > 0 {
            self.outbox.push(self.manager.to_wire_bitfield().into());
        }
        if self.config.upload_enabled {
            self.am_choking = false;
            self.outbox.push(Message::Unchoke);
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!(addr = %self.addr(), ?message, "handling");
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                // the remote discards everything we asked for
                self.pending_requests.clear();
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => {
                if piece_index >= self.manager.piece_count() {
                    return Err(Error::protocol(format!("have for unknown piece {piece_index}")));
                }
                self.remote_bitfield.set_piece(piece_index as usize);
            }
            Message::BitField(mut bitfield) => {
                bitfield.ensure_capacity(self.manager.piece_count() as usize);
                self.remote_bitfield = bitfield;
            }
            Message::Request(block) => self.queue_reply(block),
            Message::PieceBlock {
                piece_index,
                offset,
                data,
            } => self.store_block(piece_index, offset, &data),
            Message::Cancel(block) => self.replies.retain(|queued| *queued != block),
            Message::Port(port) => self.listen_port = Some(port),
        }
        Ok(())
    }

    fn queue_reply(&mut self, block: BlockInfo) {
        if self.am_choking {
            debug!(addr = %self.addr(), ?block, "request while choked, ignoring");
            return;
        }
        if block.length == 0 || block.length > self.config.max_request_length {
            debug!(addr = %self.addr(), ?block, "request length refused");
            return;
        }
        self.replies.push_back(block);
    }

    fn store_block(&mut self, piece_index: u32, offset: u32, data: &[u8]) {
        let block = BlockInfo {
            piece_index,
            offset,
            length: data.len() as u32,
        };
        if self.pending_requests.remove(&block).is_none() {
            trace!(addr = %self.addr(), ?block, "unrequested block");
        }

        let Some(piece) = self.current.as_mut().filter(|p| p.index() == piece_index) else {
            debug!(addr = %self.addr(), ?block, "block for a piece we are not downloading");
            return;
        };
        let written = piece.put_block(offset, data);
        if written.is_ok() {
            self.downloaded += data.len() as u64;
        }

        match written {
            Ok(BlockWrite::Stored) => {}
            Ok(BlockWrite::Finished(verdict)) => {
                self.current = None;
                self.pending_requests.retain(|b, _| b.piece_index != piece_index);
                if let PieceVerdict::Completed(_) = verdict {
                    self.outbox.push(Message::Have { piece_index });
                }
            }
            Err(e) => warn!(addr = %self.addr(), error = %e, "rejected block"),
        }
    }

    /// Serves queued requests that survived the batch, then refreshes our
    /// interest and request pipeline.
    fn after_batch(&mut self) {
        while let Some(block) = self.replies.pop_front() {
            match self
                .store
                .read_block(block.piece_index, block.offset, block.length)
            {
                Some(data) => {
                    self.uploaded += data.len() as u64;
                    self.outbox.push(Message::PieceBlock {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    });
                }
                None => debug!(addr = %self.addr(), ?block, "requested block not available"),
            }
        }
        self.update_interest();
        self.fill_pipeline();
    }

    fn update_interest(&mut self) {
        let wanted = self.current.is_some()
            || self
                .manager
                .select_next_to_check_out(Some(&self.remote_bitfield))
                .is_some();
        if wanted != self.am_interested {
            self.am_interested = wanted;
            self.outbox.push(if wanted {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    fn can_request(&self) -> bool {
        !self.peer_choking
            && self.am_interested
            && self.pending_requests.len() < self.config.max_pipeline_depth
    }

    fn fill_pipeline(&mut self) {
        if !self.can_request() {
            return;
        }
        if self.current.is_none() {
            self.current = self.manager.check_out_next(Some(&self.remote_bitfield));
        }
        let Some(piece) = &self.current else {
            return;
        };

        let now = Instant::now();
        let index = piece.index();
        for (offset, length) in piece.missing_blocks() {
            if self.pending_requests.len() >= self.config.max_pipeline_depth {
                break;
            }
            let block = BlockInfo {
                piece_index: index,
                offset,
                length,
            };
            if self.pending_requests.contains_key(&block) {
                continue;
            }
            self.pending_requests.insert(block, now);
            self.outbox.push(Message::Request(block));
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if !self.peer_choking {
            let timeout = self.config.request_timeout;
            let mut reissued = Vec::new();
            for (block, sent_at) in self.pending_requests.iter_mut() {
                if now.duration_since(*sent_at) > timeout {
                    *sent_at = now;
                    reissued.push(*block);
                }
            }
            for block in reissued {
                debug!(addr = %self.addr(), ?block, "request timed out, reissuing");
                self.outbox.push(Message::Request(block));
            }
        }

        if self.outbox.is_empty()
            && now.duration_since(self.last_sent) >= self.config.keep_alive_interval
        {
            self.outbox.push(Message::KeepAlive);
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let outgoing = std::mem::take(&mut self.outbox);
        if outgoing.is_empty() {
            return Ok(());
        }
        for message in &outgoing {
            self.communicator.send(message).await?;
        }
        self.last_sent = Instant::now();
        Ok(())
    }

    fn release_current(&mut self) {
        if let Some(piece) = self.current.take()
            && !piece.is_finished()
            && let Err(e) = self.manager.release(piece.index())
        {
            warn!(piece = piece.index(), error = %e, "failed to release piece");
        }
    }

    async fn teardown(&mut self) {
        self.release_current();
        self.pending_requests.clear();
        self.replies.clear();
        self.communicator.close().await;
        info!(
            addr = %self.addr(),
            uploaded = self.uploaded,
            downloaded = self.downloaded,
            "peer disconnected"
        );
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.release_current();
    }
}
