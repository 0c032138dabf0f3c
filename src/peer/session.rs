//! Drives the handshake and choke/interest state machine with one remote
//! peer, pulling requests from the piece manager and forwarding delivered
//! blocks back to it.
//!
//! A single type serves both directions: an outbound session dials and
//! initiates the handshake, an inbound session accepts an already-connected
//! socket and waits for the remote's handshake. The two differ only in who
//! speaks first and in which messages are meaningful to send (`is_inbound`
//! gates that), matching the minimal upload behavior described for the
//! listener: Interested -> Unchoke, Request -> Piece if Have.

use std::{cell::Cell, net::SocketAddr, rc::Rc, time::Duration};

use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    engine::StopHandle,
    error::*,
    peer::{
        codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        stream::{Event, PeerStream},
    },
    piece_manager::PieceManager,
    storage::Storage,
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

/// This side's session state with a remote peer. The two-independent-tag-
/// sets semantics of the protocol (`my_state`/`peer_state`) is re-expressed
/// as six explicit booleans rather than a set of tags, so every state
/// combination is a plain field read instead of a set-membership check.
#[derive(Debug)]
struct SessionState {
    /// `peer_state` ∋ Choked: the remote has us choked; we may not request.
    am_choked_by_peer: bool,
    /// `my_state` ∋ Interested: whether we've told the remote we're
    /// interested in its pieces.
    am_interested_in_peer: bool,
    /// `peer_state` ∋ Interested: whether the remote has told us it's
    /// interested in our pieces.
    is_peer_interested: bool,
    /// Whether we've choked the remote; starts `true` per the default-choked
    /// rule, cleared once the remote sends `Interested`.
    is_peer_choked_by_us: bool,
    /// `my_state` ∋ PendingRequest: at most one outstanding Request.
    has_inflight_request: bool,
    /// `my_state` ∋ Stopped: set by the engine to end the session for good.
    stopped: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            am_choked_by_peer: false,
            am_interested_in_peer: false,
            is_peer_interested: false,
            is_peer_choked_by_us: true,
            has_inflight_request: false,
            stopped: false,
        }
    }
}

/// One peer connection, inbound or outbound.
pub(crate) struct PeerSession {
    our_id: PeerId,
    info_hash: Sha1Hash,
    piece_manager: Rc<std::cell::RefCell<PieceManager>>,
    observer: Rc<dyn crate::observer::Observer>,
    /// Cumulative bytes uploaded across every session in the pool, shared
    /// with the engine's speed estimator.
    uploaded: Rc<Cell<u64>>,
    stop: StopHandle,
    is_inbound: bool,
    state: SessionState,
    remote_id: Option<PeerId>,
    dial_timeout: Duration,
    handshake_timeout: Duration,
    read_timeout: Duration,
}

impl PeerSession {
    /// Constructs a session for an outbound connection, before dialing.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        our_id: PeerId,
        info_hash: Sha1Hash,
        piece_manager: Rc<std::cell::RefCell<PieceManager>>,
        observer: Rc<dyn crate::observer::Observer>,
        uploaded: Rc<Cell<u64>>,
        stop: StopHandle,
        dial_timeout: Duration,
        handshake_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            our_id,
            info_hash,
            piece_manager,
            observer,
            uploaded,
            stop,
            is_inbound: false,
            state: SessionState::default(),
            remote_id: None,
            dial_timeout,
            handshake_timeout,
            read_timeout,
        }
    }

    /// Constructs a session for a connection already accepted by the
    /// listener.
    #[allow(clippy::too_many_arguments)]
    pub fn inbound(
        our_id: PeerId,
        info_hash: Sha1Hash,
        piece_manager: Rc<std::cell::RefCell<PieceManager>>,
        observer: Rc<dyn crate::observer::Observer>,
        uploaded: Rc<Cell<u64>>,
        stop: StopHandle,
        dial_timeout: Duration,
        handshake_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            our_id,
            info_hash,
            piece_manager,
            observer,
            uploaded,
            stop,
            is_inbound: true,
            state: SessionState::default(),
            remote_id: None,
            dial_timeout,
            handshake_timeout,
            read_timeout,
        }
    }

    /// Dials `addr`, performs the handshake, then runs the session loop
    /// until the peer disconnects, a protocol error occurs, or the engine
    /// stops the session. Never returns `Err` for peer-local problems
    /// (`MalformedMessage`, `ProtocolError`, dial/read timeouts) -- those are
    /// logged and simply end the session so the engine can pull the next
    /// address from the queue; only truly unexpected failures propagate.
    pub async fn start(&mut self, addr: SocketAddr) {
        let socket = match timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                log::warn!("Dial to {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                log::warn!("Dial to {} timed out", addr);
                return;
            }
        };

        self.observer.on_peer_connected(addr);
        match self.run(socket).await {
            Ok(()) => self.observer.on_peer_disconnected(addr, "closed"),
            Err(e) => {
                log::warn!("Session with {} ended: {}", addr, e);
                self.observer.on_peer_disconnected(addr, &e.to_string());
            }
        }
    }

    /// Runs the session loop over an already-connected socket (used both
    /// after a successful outbound dial and for sockets handed in by the
    /// listener).
    pub async fn run(&mut self, mut socket: TcpStream) -> Result<()> {
        if !self.is_inbound {
            self.send_handshake(&mut socket).await?;
        }

        let remote_handshake = self.read_handshake(&mut socket).await?;
        if remote_handshake.info_hash != self.info_hash {
            return Err(Error::ProtocolError);
        }
        self.remote_id = Some(remote_handshake.peer_id);

        if self.is_inbound {
            self.send_handshake(&mut socket).await?;
        } else {
            write_message(&mut socket, Message::Interested).await?;
            self.state.am_interested_in_peer = true;
        }

        let mut stream = PeerStream::new(socket, self.read_timeout);
        let result = self.session_loop(&mut stream).await;
        if let Some(remote_id) = self.remote_id {
            self.piece_manager.borrow_mut().remove_peer(&remote_id);
        }
        result
    }

    async fn send_handshake(&self, socket: &mut TcpStream) -> Result<()> {
        let mut buf = bytes::BytesMut::new();
        HandshakeCodec.encode(Handshake::new(self.info_hash, self.our_id), &mut buf)?;
        socket.write_all(&buf).await?;
        Ok(())
    }

    async fn read_handshake(&self, socket: &mut TcpStream) -> Result<Handshake> {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 68];
        timeout(self.handshake_timeout, socket.read_exact(&mut buf))
            .await
            .map_err(|_| Error::ProtocolError)??;
        let mut bytes = bytes::BytesMut::from(&buf[..]);
        HandshakeCodec
            .decode(&mut bytes)?
            .ok_or(Error::ProtocolError)
    }

    async fn session_loop(&mut self, stream: &mut PeerStream) -> Result<()> {
        // a session that never hears from its peer still needs a Framed
        // writer half once a message needs sending; we rebuild it lazily by
        // writing directly over the socket retained in `PeerStream`
        loop {
            if self.state.stopped || self.stop.is_stopped() {
                return Ok(());
            }

            match stream.next().await {
                Event::Message(msg) => self.handle_message(stream, msg).await?,
                Event::Idle => {
                    self.state.has_inflight_request = false;
                }
                Event::End => return Ok(()),
            }

            self.maybe_request_next(stream).await?;
        }
    }

    async fn handle_message(&mut self, stream: &mut PeerStream, msg: Message) -> Result<()> {
        let peer_id = self.remote_id.expect("handshake already completed");
        match msg {
            Message::BitField(bitfield) => {
                self.register_bitfield(peer_id, bitfield);
            }
            Message::Have(index) => {
                self.piece_manager.borrow_mut().update_peer(peer_id, index);
            }
            Message::Choke => {
                self.state.am_choked_by_peer = true;
            }
            Message::Unchoke => {
                self.state.am_choked_by_peer = false;
                self.state.has_inflight_request = false;
            }
            Message::Interested => {
                self.state.is_peer_interested = true;
                if self.is_inbound && self.state.is_peer_choked_by_us {
                    self.send(stream, Message::Unchoke).await?;
                    self.state.is_peer_choked_by_us = false;
                }
            }
            Message::NotInterested => {
                self.state.is_peer_interested = false;
            }
            Message::Piece { index, begin, data } => {
                self.state.has_inflight_request = false;
                let payload = self
                    .piece_manager
                    .borrow_mut()
                    .block_received(peer_id, index, begin, data)?;
                if let Some(payload) = payload {
                    let storage = self.piece_manager.borrow().storage();
                    storage.write_piece(index, payload).await?;
                    self.piece_manager
                        .borrow_mut()
                        .commit_piece(index, self.observer.as_ref());
                }
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                self.serve_request(stream, index, begin, length).await?;
            }
            Message::Cancel { .. } => {}
            Message::KeepAlive => {
                self.state.has_inflight_request = false;
            }
        }
        Ok(())
    }

    fn register_bitfield(&mut self, peer_id: PeerId, bitfield: Bitfield) {
        self.piece_manager.borrow_mut().add_peer(peer_id, bitfield);
    }

    async fn serve_request(
        &self,
        stream: &mut PeerStream,
        index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<()> {
        if self.state.is_peer_choked_by_us {
            return Ok(());
        }
        let has_piece = self.piece_manager.borrow().has_piece(index);
        if !has_piece {
            return Ok(());
        }
        let storage: Rc<Storage> = self.piece_manager.borrow().storage();
        let data = storage.read_block(index, begin, length).await?;
        let len = data.len() as u64;
        self.send(
            stream,
            Message::Piece {
                index,
                begin,
                data,
            },
        )
        .await?;
        self.uploaded.set(self.uploaded.get() + len);
        Ok(())
    }

    /// After each processed message, if we're not choked, we're interested,
    /// and we have no in-flight request, ask the piece manager for the next
    /// block and issue it.
    async fn maybe_request_next(&mut self, stream: &mut PeerStream) -> Result<()> {
        if self.state.am_choked_by_peer
            || !self.state.am_interested_in_peer
            || self.state.has_inflight_request
        {
            return Ok(());
        }
        let peer_id = match self.remote_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let next = self.piece_manager.borrow_mut().next_request(peer_id);
        if let Some(block) = next {
            self.send(
                stream,
                Message::Request {
                    index: block.piece_index,
                    begin: block.offset,
                    length: block.len,
                },
            )
            .await?;
            self.state.has_inflight_request = true;
        }
        Ok(())
    }

    async fn send(&self, stream: &mut PeerStream, msg: Message) -> Result<()> {
        stream.write(msg).await
    }

    /// Marks the session Stopped; observed at the next suspension point in
    /// `session_loop`.
    pub fn stop(&mut self) {
        self.state.stopped = true;
    }
}

async fn write_message(socket: &mut TcpStream, msg: Message) -> Result<()> {
    let mut buf = bytes::BytesMut::new();
    PeerCodec.encode(msg, &mut buf)?;
    socket.write_all(&buf).await?;
    Ok(())
}
