//! Client session with the PC server
//!
//! Owns the two UDP sockets, the connection state machine, the request/ACK
//! correlation table and the keepalive timer. Two tasks run per connection
//! attempt: the receive loop dispatches inbound datagrams, the keepalive loop
//! enforces liveness. Both stop when the attempt's cancellation token fires.
//!
//! ```text
//!   Disconnected --connect()--> Connecting --Connect ACK--> Connected
//!        ^                          |                           |
//!        +------ teardown (disconnect / timeout / server Disconnect)
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::channel::AudioSenders;
use crate::error::{NetworkError, Result};
use crate::messages::{SharedMessageQueue, SystemMessage};
use crate::network::loss::{LossCounter, SequenceTracker, SequenceVerdict};
use crate::network::socket::{bind_receive_socket, bind_send_socket};
use crate::protocol::{
    encode_datagram, read_header, Ack, AudioData, Category, Compression, Connect, Hotkey,
    Modifiers, Payload, SetFormat, CLIENT_KEEPALIVE_DATAGRAM, DISCONNECT_DATAGRAM, HEADER_SIZE,
    MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};

/// Keepalive period
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Silence from the server longer than this ends the session
pub const CONTACT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection status exposed to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Session timing
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keepalive_interval: Duration,
    pub contact_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            contact_timeout: CONTACT_TIMEOUT,
        }
    }
}

/// Requests that expect an ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Connect,
    SetFormat,
}

impl RequestKind {
    const ALL: [Self; 2] = [Self::Connect, Self::SetFormat];

    pub const fn category(self) -> Category {
        match self {
            Self::Connect => Category::Connect,
            Self::SetFormat => Category::SetFormat,
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Connect => 0,
            Self::SetFormat => 1,
        }
    }
}

/// An outstanding request awaiting its ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: u16,
    pub created: Instant,
}

/// One slot per request kind; a new request replaces the old one.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: [Option<PendingRequest>; 2],
}

impl PendingRequests {
    pub fn track(&mut self, kind: RequestKind, request_id: u16) {
        self.slots[kind.slot()] = Some(PendingRequest {
            request_id,
            created: Instant::now(),
        });
    }

    /// Remove and return the request matching `request_id`, if any.
    pub fn take(&mut self, request_id: u16) -> Option<(RequestKind, PendingRequest)> {
        RequestKind::ALL.into_iter().find_map(|kind| {
            let slot = &mut self.slots[kind.slot()];
            if slot.is_some_and(|pending| pending.request_id == request_id) {
                slot.take().map(|pending| (kind, pending))
            } else {
                None
            }
        })
    }

    pub fn get(&self, kind: RequestKind) -> Option<&PendingRequest> {
        self.slots[kind.slot()].as_ref()
    }

    pub fn clear(&mut self) {
        self.slots = [None; 2];
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Send half of a live connection
struct Outbound {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
}

/// Tasks and cancellation of one connection attempt
struct Link {
    generation: u64,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    next_generation: u64,
    link: Option<Link>,
    outbound: Option<Outbound>,
    local_addr: Option<SocketAddr>,
    protocol_version: Option<u32>,
    last_contact: Instant,
    pending: PendingRequests,
    sequence: SequenceTracker,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }
}

struct Shared {
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
    /// Serializes every outbound datagram
    send_lock: tokio::sync::Mutex<()>,
    audio: AudioSenders,
    loss: LossCounter,
    messages: SharedMessageQueue,
    forward_audio: AtomicBool,
}

/// UDP session with the server
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        audio: AudioSenders,
        loss: LossCounter,
        messages: SharedMessageQueue,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                state,
                inner: Mutex::new(Inner {
                    next_generation: 0,
                    link: None,
                    outbound: None,
                    local_addr: None,
                    protocol_version: None,
                    last_contact: Instant::now(),
                    pending: PendingRequests::default(),
                    sequence: SequenceTracker::new(),
                }),
                send_lock: tokio::sync::Mutex::new(()),
                audio,
                loss,
                messages,
                forward_audio: AtomicBool::new(false),
            }),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Protocol version negotiated by the last successful handshake
    pub fn protocol_version(&self) -> Option<u32> {
        self.shared.inner.lock().protocol_version
    }

    /// Address the receive socket is bound to while a session is active
    pub fn local_receive_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().local_addr
    }

    /// Gate forwarding of inbound audio to playback.
    ///
    /// Packets are not tracked while forwarding is off, so turning it back on
    /// starts a new run and discards loss counted before the pause.
    pub fn set_audio_forwarding(&self, enabled: bool) {
        let mut inner = self.shared.inner.lock();
        let was_enabled = self.shared.forward_audio.swap(enabled, Ordering::AcqRel);
        if enabled && !was_enabled {
            inner.sequence.reset();
            self.shared.loss.take();
        }
    }

    pub fn is_audio_forwarding(&self) -> bool {
        self.shared.forward_audio.load(Ordering::Acquire)
    }

    /// Start a new connection attempt, tearing down any previous one.
    ///
    /// On bind failure a system message is emitted, the error is returned and
    /// the session stays `Disconnected`.
    pub async fn connect(
        &self,
        address: IpAddr,
        server_port: u16,
        local_port: u16,
        compression: Compression,
    ) -> Result<()> {
        self.shared.teardown_current().await;

        let server = SocketAddr::new(address, server_port);

        let recv_socket = match bind_receive_socket(server, local_port) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(local_port, "Failed to bind receive socket: {}", e);
                self.shared.messages.push(bind_failure(local_port, &e));
                return Err(e.into());
            }
        };
        let send_socket = match bind_send_socket(server) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(%server, "Failed to bind send socket: {}", e);
                self.shared.messages.push(bind_failure(local_port, &e));
                return Err(e.into());
            }
        };

        let request_id: u16 = rand::random();
        let cancel = CancellationToken::new();

        let generation = {
            let mut inner = self.shared.inner.lock();
            inner.next_generation += 1;
            let generation = inner.next_generation;

            inner.link = Some(Link {
                generation,
                cancel: cancel.clone(),
                tasks: Vec::with_capacity(2),
            });
            inner.outbound = Some(Outbound {
                socket: Arc::new(send_socket),
                server,
            });
            inner.local_addr = recv_socket.local_addr().ok();
            inner.protocol_version = None;
            inner.last_contact = Instant::now();
            inner.sequence.reset();
            inner.pending.clear();
            inner.pending.track(RequestKind::Connect, request_id);

            self.shared.state.send_replace(ConnectionState::Connecting);
            generation
        };

        info!(%server, local_port, %compression, "Connecting");

        let tasks = vec![
            tokio::spawn(receive_loop(
                self.shared.clone(),
                recv_socket,
                cancel.clone(),
                generation,
            )),
            tokio::spawn(keepalive_loop(self.shared.clone(), cancel, generation)),
        ];
        {
            let mut inner = self.shared.inner.lock();
            match inner.link.as_mut() {
                Some(link) if link.generation == generation => link.tasks = tasks,
                // Already torn down; the tasks observe their cancelled token
                _ => drop(tasks),
            }
        }

        let datagram = encode_datagram(&Connect {
            protocol_version: PROTOCOL_VERSION,
            request_id,
            compression,
        })?;
        if let Err(e) = self.shared.send(&datagram).await {
            warn!("Failed to send connect request: {}", e);
            join_tasks(self.shared.teardown(generation)).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Tell the server we are leaving, then tear down. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if self.state() != ConnectionState::Disconnected {
            if let Err(e) = self.shared.send(&DISCONNECT_DATAGRAM).await {
                debug!("Failed to send disconnect: {}", e);
            }
        }
        self.shared.teardown_current().await;
    }

    /// Fire-and-forget key press
    pub async fn send_hotkey(&self, key_code: u16, modifiers: Modifiers) -> Result<()> {
        let datagram = encode_datagram(&Hotkey {
            key_code,
            modifiers,
        })?;
        self.shared.send(&datagram).await?;
        trace!(key_code, modifiers = modifiers.bits(), "Hotkey sent");
        Ok(())
    }

    /// Ask the server to switch compression level
    pub async fn send_set_format(&self, compression: Compression) -> Result<()> {
        let request_id: u16 = rand::random();
        {
            let mut inner = self.shared.inner.lock();
            if inner.link.is_none() {
                return Err(NetworkError::NotConnected.into());
            }
            inner.pending.track(RequestKind::SetFormat, request_id);
        }

        let datagram = encode_datagram(&SetFormat {
            request_id,
            compression,
        })?;
        self.shared.send(&datagram).await?;
        debug!(request_id, %compression, "Format change requested");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Tasks observe their cancelled token; nothing left to await here
        let _ = self.shared.teardown_any();
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Single exclusive send path
    async fn send(&self, datagram: &[u8]) -> std::result::Result<(), NetworkError> {
        let (socket, server) = {
            let inner = self.inner.lock();
            let outbound = inner.outbound.as_ref().ok_or(NetworkError::NotConnected)?;
            (outbound.socket.clone(), outbound.server)
        };

        let _guard = self.send_lock.lock().await;
        let sent = socket
            .send_to(datagram, server)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        if sent != datagram.len() {
            return Err(NetworkError::SendFailed(format!(
                "short send: {} of {} bytes",
                sent,
                datagram.len()
            )));
        }
        Ok(())
    }

    /// Tear down the attempt identified by `generation`.
    ///
    /// Returns its tasks, or `None` if that attempt is no longer current.
    fn teardown(&self, generation: u64) -> Option<Vec<JoinHandle<()>>> {
        let mut inner = self.inner.lock();
        if !inner.is_current(generation) {
            return None;
        }
        Some(Self::teardown_locked(&mut inner, &self.state))
    }

    fn teardown_any(&self) -> Option<Vec<JoinHandle<()>>> {
        let mut inner = self.inner.lock();
        inner.link.as_ref()?;
        Some(Self::teardown_locked(&mut inner, &self.state))
    }

    fn teardown_locked(
        inner: &mut Inner,
        state: &watch::Sender<ConnectionState>,
    ) -> Vec<JoinHandle<()>> {
        let Some(link) = inner.link.take() else {
            return Vec::new();
        };

        // The receive socket closes once its loop observes this
        link.cancel.cancel();
        inner.outbound = None;
        inner.local_addr = None;
        inner.pending.clear();
        state.send_replace(ConnectionState::Disconnected);

        info!(generation = link.generation, "Session torn down");
        link.tasks
    }

    /// Tear down whatever is active and wait for its tasks to finish
    async fn teardown_current(&self) {
        if let Some(tasks) = self.teardown_any() {
            join_tasks(Some(tasks)).await;
        }
    }

    fn touch(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.is_current(generation) {
            inner.last_contact = Instant::now();
        }
    }

    /// Handle one datagram. Returns `false` once the receive loop should stop.
    async fn dispatch(&self, datagram: &[u8], generation: u64, cancel: &CancellationToken) -> bool {
        let header = match read_header(datagram) {
            Ok(header) => header,
            Err(e) => {
                trace!(len = datagram.len(), "Dropping invalid datagram: {}", e);
                return true;
            }
        };
        let Some(category) = header.category() else {
            trace!(category = header.category, "Ignoring unknown category");
            return true;
        };
        let mut body = &datagram[HEADER_SIZE..];

        match category {
            Category::Disconnect => {
                if self.teardown(generation).is_some() {
                    info!("Server closed the session");
                    self.messages.push(SystemMessage::DisconnectedByServer);
                }
                return false;
            }
            audio if audio.is_audio() => {
                self.forward_audio(audio, &mut body, generation, cancel)
                    .await;
            }
            Category::ServerKeepAlive => self.touch(generation),
            Category::Ack => match Ack::read(&mut body) {
                Ok(ack) => self.handle_ack(ack, generation),
                Err(e) => trace!("Dropping malformed ack: {}", e),
            },
            other => trace!(?other, "Ignoring category"),
        }
        true
    }

    async fn forward_audio<B: Buf>(
        &self,
        category: Category,
        body: &mut B,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        if self.state() != ConnectionState::Connected || !self.forward_audio.load(Ordering::Acquire)
        {
            return;
        }

        let audio = match AudioData::read(body) {
            Ok(audio) => audio,
            Err(e) => {
                trace!("Dropping malformed audio packet: {}", e);
                return;
            }
        };

        let lost = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            match inner.sequence.observe(audio.sequence) {
                SequenceVerdict::Stale => {
                    trace!(sequence = audio.sequence, "Dropping late audio packet");
                    return;
                }
                SequenceVerdict::Forward { lost } => {
                    inner.last_contact = Instant::now();
                    lost
                }
            }
        };

        if lost > 0 {
            debug!(lost, sequence = audio.sequence, "Audio packets missing");
            self.loss.add(lost.into());
        }

        let tx = match category {
            Category::AudioDataUncompressed => &self.audio.uncompressed,
            _ => &self.audio.opus,
        };

        // A full queue suspends the receive loop until playback catches up
        tokio::select! {
            _ = cancel.cancelled() => {}
            sent = tx.send(audio.payload) => {
                if sent.is_err() {
                    trace!("Playback queue closed, dropping audio");
                }
            }
        }
    }

    fn handle_ack(&self, ack: Ack, generation: u64) {
        let mut inner = self.inner.lock();
        if !inner.is_current(generation) {
            return;
        }

        let Some((kind, pending)) = inner.pending.take(ack.request_id) else {
            debug!(request_id = ack.request_id, "Ignoring unmatched ack");
            return;
        };

        match kind {
            RequestKind::Connect => {
                if self.state() != ConnectionState::Connecting {
                    return;
                }
                let version = ack.protocol_version();
                inner.protocol_version = Some(version);
                inner.last_contact = Instant::now();
                self.state.send_replace(ConnectionState::Connected);
                info!(
                    protocol_version = version,
                    rtt = ?pending.created.elapsed(),
                    "Connected"
                );
            }
            RequestKind::SetFormat => {
                // The server applies the change on its own; nothing to update here yet
                debug!(request_id = ack.request_id, "Format change acknowledged");
            }
        }
    }
}

/// Message reported when a socket for `local_port` could not be set up
fn bind_failure(local_port: u16, err: &NetworkError) -> SystemMessage {
    match err {
        NetworkError::AddressInUse(port) => SystemMessage::PortInUse { port: *port },
        other => SystemMessage::BindFailed {
            port: local_port,
            reason: other.to_string(),
        },
    }
}

async fn join_tasks(tasks: Option<Vec<JoinHandle<()>>>) {
    for result in join_all(tasks.unwrap_or_default()).await {
        if let Err(e) = result {
            if e.is_panic() {
                warn!("Session task panicked: {}", e);
            }
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

async fn receive_loop(
    shared: Arc<Shared>,
    socket: UdpSocket,
    cancel: CancellationToken,
    generation: u64,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, _from)) => {
                if !shared.dispatch(&buf[..len], generation, &cancel).await {
                    break;
                }
            }
            Err(e) if is_transient(&e) => trace!("Transient receive error: {}", e),
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        }
    }

    debug!(generation, "Receive loop stopped");
}

async fn keepalive_loop(shared: Arc<Shared>, cancel: CancellationToken, generation: u64) {
    let interval = shared.config.keepalive_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let silent_for = {
            let inner = shared.inner.lock();
            if !inner.is_current(generation) {
                break;
            }
            inner.last_contact.elapsed()
        };

        if silent_for >= shared.config.contact_timeout {
            let message = match shared.state() {
                ConnectionState::Connecting => SystemMessage::ConnectFailed,
                _ => SystemMessage::Disconnected,
            };
            warn!(?silent_for, "Server timed out");
            if shared.teardown(generation).is_some() {
                shared.messages.push(message);
            }
            break;
        }

        if let Err(e) = shared.send(&CLIENT_KEEPALIVE_DATAGRAM).await {
            warn!("Keepalive send failed: {}", e);
        }
    }

    debug!(generation, "Keepalive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::channel::{audio_channels, AudioReceivers};
    use crate::messages::MessageQueue;
    use crate::protocol::Packet;
    use bytes::Bytes;

    const WAIT: Duration = Duration::from_secs(3);

    struct FakeServer {
        socket: tokio::net::UdpSocket,
    }

    impl FakeServer {
        async fn bind() -> Self {
            Self {
                socket: tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn port(&self) -> u16 {
            self.socket.local_addr().unwrap().port()
        }

        async fn recv(&self) -> Packet {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (len, _) = tokio::time::timeout(WAIT, self.socket.recv_from(&mut buf))
                .await
                .expect("server timed out waiting for client")
                .unwrap();
            Packet::decode(&buf[..len]).unwrap()
        }

        /// Next packet of a category other than keepalive
        async fn recv_skipping_keepalives(&self) -> Packet {
            loop {
                let packet = self.recv().await;
                if packet != Packet::ClientKeepAlive {
                    return packet;
                }
            }
        }

        async fn send(&self, client: SocketAddr, packet: &Packet) {
            self.send_raw(client, &packet.encode().unwrap()).await;
        }

        async fn send_raw(&self, client: SocketAddr, bytes: &[u8]) {
            self.socket.send_to(bytes, client).await.unwrap();
        }
    }

    struct Harness {
        session: Session,
        server: FakeServer,
        receivers: AudioReceivers,
        loss: LossCounter,
        messages: SharedMessageQueue,
    }

    impl Harness {
        async fn new(config: SessionConfig) -> Self {
            Self::with_queue(config, 8).await
        }

        async fn with_queue(config: SessionConfig, capacity: usize) -> Self {
            let (senders, receivers) = audio_channels(capacity);
            let loss = LossCounter::new();
            let messages = Arc::new(MessageQueue::default());
            let session = Session::new(config, senders, loss.clone(), messages.clone());
            Self {
                session,
                server: FakeServer::bind().await,
                receivers,
                loss,
                messages,
            }
        }

        async fn connect(&self) -> u16 {
            self.session
                .connect(
                    IpAddr::from([127, 0, 0, 1]),
                    self.server.port(),
                    0,
                    Compression::Kbps128,
                )
                .await
                .unwrap();
            match self.server.recv_skipping_keepalives().await {
                Packet::Connect(connect) => {
                    assert_eq!(connect.protocol_version, PROTOCOL_VERSION);
                    assert_eq!(connect.compression, Compression::Kbps128);
                    connect.request_id
                }
                other => panic!("expected connect, got {:?}", other),
            }
        }

        fn client_addr(&self) -> SocketAddr {
            let port = self.session.local_receive_addr().unwrap().port();
            SocketAddr::from(([127, 0, 0, 1], port))
        }

        async fn connected(&self) {
            let request_id = self.connect().await;
            self.server
                .send(
                    self.client_addr(),
                    &Packet::Ack(Ack {
                        request_id,
                        custom: 3u32.to_be_bytes(),
                    }),
                )
                .await;
            self.wait_for(ConnectionState::Connected).await;
        }

        async fn wait_for(&self, state: ConnectionState) {
            let mut rx = self.session.subscribe();
            tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
                .await
                .unwrap_or_else(|_| panic!("never reached {:?}", state))
                .unwrap();
        }

        async fn send_audio(&self, opus: bool, sequence: u16, payload: &'static [u8]) {
            let audio = AudioData {
                sequence,
                payload: Bytes::from_static(payload),
            };
            let packet = if opus {
                Packet::AudioOpus(audio)
            } else {
                Packet::AudioUncompressed(audio)
            };
            self.server.send(self.client_addr(), &packet).await;
        }
    }

    async fn recv(rx: &mut tokio::sync::mpsc::Receiver<Bytes>) -> Bytes {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn quick() -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_millis(50),
            contact_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_pending_requests() {
        let mut pending = PendingRequests::default();
        assert!(pending.is_empty());

        pending.track(RequestKind::Connect, 10);
        pending.track(RequestKind::SetFormat, 20);
        // A new request of the same kind replaces the old one
        pending.track(RequestKind::Connect, 11);

        assert!(pending.take(10).is_none());
        let (kind, request) = pending.take(11).unwrap();
        assert_eq!(kind, RequestKind::Connect);
        assert_eq!(request.request_id, 11);
        assert!(pending.get(RequestKind::Connect).is_none());

        assert_eq!(pending.take(20).map(|(k, _)| k), Some(RequestKind::SetFormat));
        assert!(pending.is_empty());
        assert_eq!(RequestKind::SetFormat.category(), Category::SetFormat);
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let h = Harness::new(quick()).await;
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(h.session.local_receive_addr().is_none());
        assert!(h.session.send_hotkey(1, Modifiers::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake() {
        let h = Harness::new(quick()).await;
        let request_id = h.connect().await;
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        // Garbage and foreign ACKs do not complete the handshake
        h.server.send_raw(h.client_addr(), &[0xDE, 0xAD, 0xBE, 0xEF]).await;
        h.server
            .send(
                h.client_addr(),
                &Packet::Ack(Ack {
                    request_id: request_id.wrapping_add(1),
                    custom: [0, 0, 0, 9],
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        h.server
            .send(
                h.client_addr(),
                &Packet::Ack(Ack {
                    request_id,
                    custom: 7u32.to_be_bytes(),
                }),
            )
            .await;
        h.wait_for(ConnectionState::Connected).await;
        assert_eq!(h.session.protocol_version(), Some(7));
    }

    #[tokio::test]
    async fn test_set_format_ack_is_not_a_handshake() {
        let h = Harness::new(quick()).await;
        h.connect().await;

        h.session.send_set_format(Compression::None).await.unwrap();
        let request_id = match h.server.recv_skipping_keepalives().await {
            Packet::SetFormat(set) => {
                assert_eq!(set.compression, Compression::None);
                set.request_id
            }
            other => panic!("expected set format, got {:?}", other),
        };

        h.server
            .send(
                h.client_addr(),
                &Packet::Ack(Ack {
                    request_id,
                    custom: [0; 4],
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.session.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_hotkey_and_keepalive_reach_server() {
        let h = Harness::new(quick()).await;
        h.connected().await;

        h.session
            .send_hotkey(0xB3, Modifiers::from_bits(Modifiers::CTRL))
            .await
            .unwrap();
        match h.server.recv_skipping_keepalives().await {
            Packet::Hotkey(hotkey) => {
                assert_eq!(hotkey.key_code, 0xB3);
                assert!(hotkey.modifiers.contains(Modifiers::CTRL));
            }
            other => panic!("expected hotkey, got {:?}", other),
        }

        assert_eq!(h.server.recv().await, Packet::ClientKeepAlive);
    }

    #[tokio::test]
    async fn test_audio_routing_and_loss() {
        let mut h = Harness::new(quick()).await;
        h.connected().await;

        // Not forwarded until enabled
        h.send_audio(true, 1, b"early").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.receivers.opus.try_recv().is_err());

        h.session.set_audio_forwarding(true);
        h.send_audio(true, 10, b"opus-a").await;
        h.send_audio(false, 11, b"pcm-a").await;
        h.send_audio(true, 14, b"opus-b").await;
        // Late packet is dropped
        h.send_audio(true, 12, b"late").await;
        h.send_audio(true, 15, b"opus-c").await;

        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"opus-a"));
        assert_eq!(recv(&mut h.receivers.uncompressed).await, Bytes::from_static(b"pcm-a"));
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"opus-b"));
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"opus-c"));
        assert_eq!(h.loss.take(), 2);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let h = Harness::new(SessionConfig {
            keepalive_interval: Duration::from_millis(50),
            contact_timeout: Duration::from_millis(250),
        })
        .await;
        h.connect().await;

        h.wait_for(ConnectionState::Disconnected).await;
        assert_eq!(h.messages.try_pop(), Some(SystemMessage::ConnectFailed));
    }

    #[tokio::test]
    async fn test_connected_timeout() {
        let h = Harness::new(SessionConfig {
            keepalive_interval: Duration::from_millis(50),
            contact_timeout: Duration::from_millis(400),
        })
        .await;
        h.connected().await;

        h.wait_for(ConnectionState::Disconnected).await;
        assert_eq!(h.messages.try_pop(), Some(SystemMessage::Disconnected));
        assert!(h.session.protocol_version().is_some());
    }

    #[tokio::test]
    async fn test_server_keepalive_keeps_session_alive() {
        let h = Harness::new(SessionConfig {
            keepalive_interval: Duration::from_millis(50),
            contact_timeout: Duration::from_millis(300),
        })
        .await;
        h.connected().await;

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.server.send(h.client_addr(), &Packet::ServerKeepAlive).await;
        }
        assert_eq!(h.session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_server_disconnect() {
        let h = Harness::new(quick()).await;
        h.connected().await;

        h.server.send(h.client_addr(), &Packet::Disconnect).await;
        h.wait_for(ConnectionState::Disconnected).await;
        assert_eq!(
            h.messages.try_pop(),
            Some(SystemMessage::DisconnectedByServer)
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let h = Harness::new(quick()).await;
        h.connected().await;

        h.session.disconnect().await;
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert_eq!(h.server.recv_skipping_keepalives().await, Packet::Disconnect);

        h.session.disconnect().await;
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(h.session.local_receive_addr().is_none());
        assert!(h.messages.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_attempt() {
        let h = Harness::new(quick()).await;
        let first = h.connect().await;
        let second = h.connect().await;
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        // The first attempt's request is no longer tracked
        h.server
            .send(
                h.client_addr(),
                &Packet::Ack(Ack {
                    request_id: first,
                    custom: [0, 0, 0, 1],
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if first != second {
            assert_eq!(h.session.state(), ConnectionState::Connecting);
        }

        h.server
            .send(
                h.client_addr(),
                &Packet::Ack(Ack {
                    request_id: second,
                    custom: [0, 0, 0, 1],
                }),
            )
            .await;
        h.wait_for(ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let h = Harness::new(quick()).await;
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let result = h
            .session
            .connect(
                IpAddr::from([127, 0, 0, 1]),
                h.server.port(),
                port,
                Compression::None,
            )
            .await;

        assert!(matches!(
            result,
            Err(crate::Error::Network(NetworkError::AddressInUse(p))) if p == port
        ));
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert_eq!(h.messages.try_pop(), Some(SystemMessage::PortInUse { port }));
    }

    #[test]
    fn test_bind_failure_messages() {
        assert_eq!(
            bind_failure(5000, &NetworkError::AddressInUse(5000)),
            SystemMessage::PortInUse { port: 5000 }
        );
        assert_eq!(
            bind_failure(5000, &NetworkError::BindFailed("permission denied".into())),
            SystemMessage::BindFailed {
                port: 5000,
                reason: "Socket bind failed: permission denied".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting() {
        let h = Harness::new(quick()).await;
        let request_id = h.connect().await;
        let client = h.client_addr();
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        h.session.disconnect().await;
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert_eq!(h.server.recv_skipping_keepalives().await, Packet::Disconnect);
        assert!(h.session.local_receive_addr().is_none());

        // A late ACK for the abandoned attempt goes nowhere
        h.server
            .send(
                client,
                &Packet::Ack(Ack {
                    request_id,
                    custom: [0, 0, 0, 1],
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(h.messages.is_empty());
    }

    #[tokio::test]
    async fn test_forwarding_pause_starts_new_run() {
        let mut h = Harness::new(quick()).await;
        h.connected().await;

        h.session.set_audio_forwarding(true);
        h.send_audio(true, 1, b"before").await;
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"before"));

        h.session.set_audio_forwarding(false);
        for sequence in 2..=20 {
            h.send_audio(true, sequence, b"paused").await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.session.set_audio_forwarding(true);
        h.send_audio(true, 1001, b"after").await;
        h.send_audio(true, 1002, b"after-2").await;

        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"after"));
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"after-2"));
        assert_eq!(h.loss.get(), 0);
    }

    #[tokio::test]
    async fn test_forwarding_enable_is_not_a_reset_when_already_on() {
        let mut h = Harness::new(quick()).await;
        h.connected().await;

        h.session.set_audio_forwarding(true);
        h.send_audio(true, 1, b"a").await;
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"a"));

        h.session.set_audio_forwarding(true);
        h.send_audio(true, 4, b"b").await;
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"b"));
        assert_eq!(h.loss.get(), 2);
    }

    #[tokio::test]
    async fn test_sequence_jump_resyncs() {
        let mut h = Harness::new(quick()).await;
        h.connected().await;
        h.session.set_audio_forwarding(true);

        h.send_audio(true, 1, b"start").await;
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"start"));

        for sequence in 40000..40010 {
            h.send_audio(true, sequence, b"jumped").await;
        }
        assert_eq!(recv(&mut h.receivers.opus).await, Bytes::from_static(b"jumped"));
        assert_eq!(h.loss.get(), 0);
    }

    #[tokio::test]
    async fn test_paused_forwarding_keeps_session_alive() {
        let mut h = Harness::with_queue(
            SessionConfig {
                keepalive_interval: Duration::from_millis(50),
                contact_timeout: Duration::from_millis(300),
            },
            2,
        )
        .await;
        h.connected().await;
        h.session.set_audio_forwarding(false);

        // Nobody drains the queues; audio must not back up into the receive loop
        for sequence in 0..10 {
            h.send_audio(true, sequence, b"unplayed").await;
        }
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.server.send(h.client_addr(), &Packet::ServerKeepAlive).await;
        }

        assert_eq!(h.session.state(), ConnectionState::Connected);
        assert!(h.receivers.opus.try_recv().is_err());
        assert!(h.messages.is_empty());
    }
}
