//! The top-level orchestrator: owns the bounded peer-address queue, the
//! fixed-size pool of peer sessions, the piece manager and file placement,
//! and drives the tracker announce loop.
//!
//! Everything here runs on a single-threaded [`tokio::task::LocalSet`]: the
//! piece manager and peer-address queue are shared via `Rc`/`Rc<RefCell<_>>`
//! rather than `Arc`/`Mutex`, since cooperative scheduling on one thread
//! already serializes every mutation between suspension points (see the
//! concurrency model this crate follows). File placement's blocking I/O is
//! the one deliberate exception; see `src/storage.rs`.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use tokio::{net::TcpListener, sync::Notify, task::LocalSet};

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    observer::{NoopObserver, Observer},
    peer::session::PeerSession,
    piece_manager::PieceManager,
    storage::Storage,
    storage_info::StorageInfo,
    tracker::{Event, Tracker},
};

/// How often the speed estimator samples cumulative byte counters.
const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// The estimator aggregates arrivals over this many most recent samples.
const SPEED_WINDOW: usize = 5;
/// Re-announce interval used instead of the tracker's suggested interval
/// when the address queue is under `min_requested_peer_count`.
const UNDERSTOCKED_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// A bounded FIFO of peer addresses. The tracker loop pushes, and sessions
/// pop; once full, the newest address is dropped rather than blocking the
/// announce loop or growing without limit.
struct AddressQueue {
    addrs: VecDeque<SocketAddr>,
    capacity: usize,
}

impl AddressQueue {
    fn new(capacity: usize) -> Self {
        Self {
            addrs: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, addr: SocketAddr) {
        if self.addrs.len() >= self.capacity {
            log::debug!(
                "Peer address queue full ({} entries), dropping {}",
                self.capacity,
                addr
            );
            return;
        }
        self.addrs.push_back(addr);
    }

    fn pop(&mut self) -> Option<SocketAddr> {
        self.addrs.pop_front()
    }

    fn len(&self) -> usize {
        self.addrs.len()
    }
}

/// A cloneable signal that tells every task an engine owns -- peer sessions,
/// the listener's accept loop, the announce loop, the speed estimator -- to
/// wind down. Checked at each task's suspension points, per the cooperative
/// cancellation model: there is no preemption, so a task only notices a stop
/// request the next time it would otherwise suspend.
#[derive(Clone)]
pub(crate) struct StopHandle {
    stopped: Rc<Cell<bool>>,
    notify: Rc<Notify>,
}

impl StopHandle {
    fn new() -> Self {
        Self {
            stopped: Rc::new(Cell::new(false)),
            notify: Rc::new(Notify::new()),
        }
    }

    /// Requests an orderly shutdown. Idempotent.
    pub fn stop(&self) {
        self.stopped.set(true);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Sleeps for `duration`, or returns early if [`StopHandle::stop`] is
    /// called in the meantime.
    async fn sleep_or_stop(&self, duration: Duration) {
        if self.is_stopped() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Runs one torrent download to completion (or until stopped).
pub struct Engine {
    conf: Conf,
    metainfo: Metainfo,
    observer: Rc<dyn Observer>,
    stop: StopHandle,
}

impl Engine {
    /// Constructs an engine for `metainfo`, using `conf` for its settings and
    /// a no-op observer. Use [`Engine::with_observer`] to receive progress
    /// events.
    pub fn new(conf: Conf, metainfo: Metainfo) -> Self {
        Self {
            conf,
            metainfo,
            observer: Rc::new(NoopObserver),
            stop: StopHandle::new(),
        }
    }

    /// Constructs an engine that reports progress to `observer`.
    pub fn with_observer(conf: Conf, metainfo: Metainfo, observer: Rc<dyn Observer>) -> Self {
        Self {
            conf,
            metainfo,
            observer,
            stop: StopHandle::new(),
        }
    }

    /// Returns a cloneable handle that can request this engine's shutdown
    /// from another task. Calling [`StopHandle::stop`] signals every peer
    /// session, the listener's accept loop, and the announce loop to wind
    /// down at their next suspension point; [`Engine::run`] then sends a
    /// best-effort final `event=stopped` announce and returns.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs the download to completion. Spawns the fixed session pool, the
    /// tracker announce loop, and the inbound listener on a single-threaded
    /// [`LocalSet`], and returns once every selected piece is in Have or the
    /// engine is stopped via a [`StopHandle`] obtained from
    /// [`Engine::stop_handle`].
    pub async fn run(self) -> Result<()> {
        let local = LocalSet::new();
        local.run_until(self.run_local()).await
    }

    async fn run_local(self) -> Result<()> {
        let storage_info =
            StorageInfo::new(&self.metainfo, self.conf.torrent.download_dir.clone());
        let storage = Storage::new(
            storage_info.clone(),
            self.conf.torrent.chosen_files.as_ref(),
        )?;

        let piece_manager = Rc::new(RefCell::new(PieceManager::new(
            &self.metainfo,
            &storage_info,
            storage,
            self.conf.torrent.chosen_files.as_ref(),
            self.conf.torrent.request_timeout,
            self.conf.torrent.max_ongoing_pieces,
        )?));

        let queue = Rc::new(RefCell::new(AddressQueue::new(
            self.conf.engine.peer_queue_capacity,
        )));

        let tracker = Rc::new(Tracker::new(
            self.metainfo.announce.clone(),
            self.metainfo.announce_list.clone(),
            self.metainfo.info_hash,
            self.conf.engine.client_id,
            self.conf.engine.listener_port,
            self.conf.torrent.tracker_error_threshold,
        ));

        let uploaded = Rc::new(Cell::new(0u64));

        let listener = TcpListener::bind(("0.0.0.0", self.conf.engine.listener_port))
            .await
            .ok();
        if listener.is_none() {
            log::warn!(
                "Could not bind inbound listener on port {}; running outbound-only",
                self.conf.engine.listener_port
            );
        }

        for _ in 0..self.conf.torrent.session_count {
            let queue = Rc::clone(&queue);
            let piece_manager = Rc::clone(&piece_manager);
            let observer = Rc::clone(&self.observer);
            let uploaded = Rc::clone(&uploaded);
            let stop = self.stop.clone();
            let our_id = self.conf.engine.client_id;
            let info_hash = self.metainfo.info_hash;
            let dial_timeout = self.conf.torrent.dial_timeout;
            let handshake_timeout = self.conf.torrent.handshake_timeout;
            let read_timeout = self.conf.torrent.read_timeout;
            tokio::task::spawn_local(async move {
                while !stop.is_stopped() {
                    let addr = loop {
                        if stop.is_stopped() {
                            return;
                        }
                        if let Some(addr) = queue.borrow_mut().pop() {
                            break addr;
                        }
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    };
                    let mut session = PeerSession::outbound(
                        our_id,
                        info_hash,
                        Rc::clone(&piece_manager),
                        Rc::clone(&observer),
                        Rc::clone(&uploaded),
                        stop.clone(),
                        dial_timeout,
                        handshake_timeout,
                        read_timeout,
                    );
                    session.start(addr).await;
                }
            });
        }

        if let Some(listener) = listener {
            let piece_manager = Rc::clone(&piece_manager);
            let observer = Rc::clone(&self.observer);
            let uploaded = Rc::clone(&uploaded);
            let stop = self.stop.clone();
            let our_id = self.conf.engine.client_id;
            let info_hash = self.metainfo.info_hash;
            let max_connected = self.conf.torrent.max_connected_peer_count;
            let dial_timeout = self.conf.torrent.dial_timeout;
            let handshake_timeout = self.conf.torrent.handshake_timeout;
            let read_timeout = self.conf.torrent.read_timeout;
            let connected = Rc::new(Cell::new(0usize));
            tokio::task::spawn_local(async move {
                while !stop.is_stopped() {
                    tokio::select! {
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((socket, addr)) => {
                                    if connected.get() >= max_connected {
                                        log::debug!(
                                            "Dropping inbound connection from {}: at max_connected_peer_count ({})",
                                            addr, max_connected
                                        );
                                        continue;
                                    }
                                    log::debug!("Accepted inbound connection from {}", addr);
                                    observer.on_peer_connected(addr);
                                    connected.set(connected.get() + 1);
                                    let piece_manager = Rc::clone(&piece_manager);
                                    let observer = Rc::clone(&observer);
                                    let uploaded = Rc::clone(&uploaded);
                                    let stop = stop.clone();
                                    let connected = Rc::clone(&connected);
                                    tokio::task::spawn_local(async move {
                                        let mut session = PeerSession::inbound(
                                            our_id,
                                            info_hash,
                                            piece_manager,
                                            Rc::clone(&observer),
                                            uploaded,
                                            stop,
                                            dial_timeout,
                                            handshake_timeout,
                                            read_timeout,
                                        );
                                        match session.run(socket).await {
                                            Ok(()) => observer.on_peer_disconnected(addr, "closed"),
                                            Err(e) => {
                                                log::debug!("Inbound session with {} ended: {}", addr, e);
                                                observer.on_peer_disconnected(addr, &e.to_string());
                                            }
                                        }
                                        connected.set(connected.get() - 1);
                                    });
                                }
                                Err(e) => log::warn!("Listener accept failed: {}", e),
                            }
                        }
                        _ = stop.sleep_or_stop(Duration::from_secs(3600)) => {}
                    }
                }
            });
        }

        self.spawn_speed_estimator(Rc::clone(&piece_manager), Rc::clone(&uploaded));

        self.announce_loop(
            Rc::clone(&tracker),
            queue,
            Rc::clone(&piece_manager),
            Rc::clone(&uploaded),
        )
        .await;

        let downloaded = piece_manager.borrow().bytes_downloaded();
        let left = self.metainfo.structure.download_len() - downloaded;
        tracker.announce_stop(uploaded.get(), downloaded, left).await;

        Ok(())
    }

    /// Every second, samples the piece manager's cumulative downloaded bytes
    /// and the session pool's cumulative uploaded bytes, keeps the last
    /// [`SPEED_WINDOW`] samples, and reports the delta over that window to
    /// the observer as a bytes-per-second rate.
    fn spawn_speed_estimator(
        &self,
        piece_manager: Rc<RefCell<PieceManager>>,
        uploaded: Rc<Cell<u64>>,
    ) {
        let observer = Rc::clone(&self.observer);
        let stop = self.stop.clone();
        tokio::task::spawn_local(async move {
            let mut down_samples = VecDeque::with_capacity(SPEED_WINDOW + 1);
            let mut up_samples = VecDeque::with_capacity(SPEED_WINDOW + 1);
            while !stop.is_stopped() {
                stop.sleep_or_stop(SPEED_SAMPLE_INTERVAL).await;
                if stop.is_stopped() {
                    break;
                }

                down_samples.push_back(piece_manager.borrow().bytes_downloaded());
                up_samples.push_back(uploaded.get());
                if down_samples.len() > SPEED_WINDOW {
                    down_samples.pop_front();
                    up_samples.pop_front();
                }

                if down_samples.len() >= 2 {
                    let elapsed_secs = (down_samples.len() - 1) as u64;
                    let down_bps = (down_samples.back().unwrap() - down_samples.front().unwrap())
                        / elapsed_secs.max(1);
                    let up_bps = (up_samples.back().unwrap() - up_samples.front().unwrap())
                        / elapsed_secs.max(1);
                    observer.on_speed_update(down_bps, up_bps);
                }
            }
        });
    }

    /// Drains the queue only implicitly (sessions do the draining); this
    /// loop's job is solely to refill it. On each tick it announces, enqueues
    /// the returned peers, then sleeps the tracker's suggested interval
    /// (falling back to the configured default if the tracker didn't specify
    /// one, per the TorrentConf `announce_interval` default), exiting as soon
    /// as the engine is signaled to stop.
    async fn announce_loop(
        &self,
        tracker: Rc<Tracker>,
        queue: Rc<RefCell<AddressQueue>>,
        piece_manager: Rc<RefCell<PieceManager>>,
        uploaded: Rc<Cell<u64>>,
    ) {
        let total_len = self.metainfo.structure.download_len();
        let mut event = Event::Started;
        while !self.stop.is_stopped() {
            let downloaded = piece_manager.borrow().bytes_downloaded();
            let left = total_len - downloaded;
            let announce = tracker
                .announce(uploaded.get(), downloaded, left, event)
                .await;
            event = Event::None;

            let interval = match announce {
                Some(announce) => {
                    for addr in announce.peers {
                        queue.borrow_mut().push(addr);
                    }
                    announce.interval
                }
                None => self.conf.torrent.announce_interval,
            };

            // Below the configured floor, re-announce sooner than the
            // tracker's suggested interval rather than starving the session
            // pool of addresses to dial.
            let interval = if queue.borrow().len() < self.conf.torrent.min_requested_peer_count {
                interval.min(UNDERSTOCKED_ANNOUNCE_INTERVAL)
            } else {
                interval
            };

            self.stop.sleep_or_stop(interval).await;
        }
    }
}
