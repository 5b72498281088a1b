//! Dual-role connection endpoint.
//!
//! A [`ConnectionEndpoint`] owns at most one TCP socket at a time. It either
//! listens for a single inbound connection or connects outbound, runs one
//! receive loop while connected, and buffers sends made while no connection
//! exists. Everything it observes is pushed into an unbounded event channel
//! tagged with the endpoint's [`Side`].
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──listen──▶ Listening ──accept──▶ Connected ──peer close / error──▶ Disconnected
//!   │                                        ▲   │                             │
//!   └──connect──▶ Connecting ──connected─────┘   └──disconnect()──────────────▶│
//!                                                                              │
//!                     Disconnected ──listen / connect──▶ ... (re-armable) ◀────┘
//! ```
//!
//! Every transition happens under the endpoint's state lock and bumps a
//! generation counter. Socket tasks carry the generation they were started
//! with and stop publishing reads as soon as it no longer matches, so no data
//! from a torn-down connection reaches the event channel after `disconnect`
//! returns.
//!
//! Bytes accepted by `send` are never silently lost. A disconnect closes the
//! writer queue; the connection writes what is still queued, then sends FIN.
//! If the peer goes away first, queued chunks move back to the pending buffer.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EndpointOptions;
use crate::error::RelayError;
use crate::event::{EndpointEvent, Side};
use crate::notification::Notification;

/// Sender half of an endpoint's event channel.
pub type EventSender = mpsc::UnboundedSender<EndpointEvent>;

/// Receiver half of an endpoint's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<EndpointEvent>;

/// Current phase of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointMode {
    /// Never started.
    #[default]
    Idle,
    /// Bound and waiting for one inbound connection.
    Listening,
    /// Outbound connect in flight.
    Connecting,
    /// Connection established, receive loop running.
    Connected,
    /// Connection ended; may be started again.
    Disconnected,
}

impl EndpointMode {
    /// Returns the mode as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Listening => "Listening",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
        }
    }

    /// Returns true while a socket is held (listening, connecting or connected).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Listening | Self::Connecting | Self::Connected)
    }
}

impl std::fmt::Display for EndpointMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a connection's I/O stopped.
#[derive(Debug)]
enum Ended {
    PeerClosed,
    Failed(io::Error),
    /// Torn down locally.
    Closing,
}

#[derive(Debug, Default)]
struct State {
    mode: EndpointMode,
    address: Option<SocketAddrV4>,
    local_addr: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    generation: u64,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    pending: VecDeque<Bytes>,
    connected: bool,
    task: Option<JoinHandle<()>>,
}

impl State {
    fn pending_len(&self) -> usize {
        self.pending.iter().map(Bytes::len).sum()
    }

    fn target(&self) -> String {
        match (self.peer, self.address) {
            (Some(peer), _) => peer.to_string(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => "<unbound>".to_string(),
        }
    }
}

struct Shared {
    side: Side,
    options: EndpointOptions,
    events: EventSender,
    runtime: Handle,
    state: Mutex<State>,
}

/// One side of the relay: a reusable listen-or-connect TCP endpoint.
///
/// All methods are synchronous and return immediately; socket work runs on
/// the Tokio runtime captured at construction. Failures never surface as
/// return values, only as [`Notification`] events.
pub struct ConnectionEndpoint {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ConnectionEndpoint")
            .field("side", &self.shared.side)
            .field("mode", &state.mode)
            .field("address", &state.address)
            .field("peer", &state.peer)
            .field("pending_bytes", &state.pending_len())
            .finish()
    }
}

impl ConnectionEndpoint {
    /// Creates an endpoint on the current Tokio runtime.
    ///
    /// Must be called from within a runtime context.
    pub fn new(side: Side, options: EndpointOptions, events: EventSender) -> Self {
        Self::with_handle(side, options, events, Handle::current())
    }

    /// Creates an endpoint that spawns its socket tasks on `runtime`.
    pub fn with_handle(
        side: Side,
        options: EndpointOptions,
        events: EventSender,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                side,
                options,
                events,
                runtime,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns which side of the relay this endpoint serves.
    pub fn side(&self) -> Side {
        self.shared.side
    }

    /// Returns the current mode.
    pub fn mode(&self) -> EndpointMode {
        self.shared.state.lock().mode
    }

    /// Returns true while a connection is established.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Returns the address passed to the last `listen` or `connect`.
    pub fn address(&self) -> Option<SocketAddrV4> {
        self.shared.state.lock().address
    }

    /// Returns the locally bound address of the listener or connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local_addr
    }

    /// Returns the number of bytes waiting for a connection.
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending_len()
    }

    /// Discards data buffered while disconnected. Returns the bytes dropped.
    pub fn clear_pending(&self) -> usize {
        let mut state = self.shared.state.lock();
        let dropped = state.pending_len();
        state.pending.clear();
        dropped
    }

    /// Binds to `addr` and waits for a single inbound connection.
    ///
    /// Any active socket is torn down first. The listening socket is closed
    /// once the first connection is accepted, so later inbound attempts are
    /// refused until `listen` is called again.
    pub fn listen(&self, addr: SocketAddrV4) {
        let shared = &self.shared;
        let generation = {
            let mut state = shared.state.lock();
            shared.teardown(&mut state);
            state.address = Some(addr);
            state.local_addr = None;
            state.peer = None;
            state.generation
        };

        let listener = match shared.bind_listener(addr) {
            Ok(listener) => listener,
            Err(e) => {
                let err = RelayError::Bind(SocketAddr::V4(addr), e);
                tracing::warn!("[{}] {}", shared.side, err);
                let mut state = shared.state.lock();
                if state.generation == generation {
                    state.address = None;
                }
                shared.emit(Notification::from(&err));
                return;
            }
        };

        {
            let mut state = shared.state.lock();
            if state.generation != generation {
                return;
            }
            state.mode = EndpointMode::Listening;
            state.local_addr = listener.local_addr().ok();
            let bound = state.local_addr.map(|a| a.to_string()).unwrap_or_default();
            tracing::info!("[{}] Listening on {}", shared.side, bound);
            shared.emit(Notification::info(format!(
                "Connecting to {} (Listen Mode)",
                bound
            )));
        }

        let task = Arc::clone(shared);
        let handle = shared.runtime.spawn(async move {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    drop(listener);
                    task.establish(generation, stream, peer).await;
                }
                Err(e) => task.setup_failed(generation, RelayError::Io(e)),
            }
        });
        shared.store_task(generation, handle);
    }

    /// Starts a non-blocking outbound connection to `addr`.
    ///
    /// Any active socket is torn down first. Data buffered by [`send`] is
    /// flushed in order once the connection is established.
    ///
    /// [`send`]: ConnectionEndpoint::send
    pub fn connect(&self, addr: SocketAddrV4) {
        let shared = &self.shared;
        let generation = {
            let mut state = shared.state.lock();
            shared.teardown(&mut state);
            state.address = Some(addr);
            state.local_addr = None;
            state.peer = None;
            state.mode = EndpointMode::Connecting;
            tracing::info!("[{}] Connecting to {}", shared.side, addr);
            shared.emit(Notification::info(format!(
                "Connecting to {} (Send Mode)",
                addr
            )));
            state.generation
        };

        let task = Arc::clone(shared);
        let handle = shared.runtime.spawn(async move {
            let opened = task.open_connection(addr).await;
            match opened {
                Ok(stream) => {
                    let peer = SocketAddr::V4(addr);
                    task.establish(generation, stream, peer).await;
                }
                Err(err) => task.setup_failed(generation, err),
            }
        });
        shared.store_task(generation, handle);
    }

    /// Sends `data` to the peer, or buffers it until a connection exists.
    ///
    /// Never waits for the network. Buffered chunks keep their arrival order
    /// and are transmitted before anything sent after the connection comes up.
    pub fn send(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }

        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.mode == EndpointMode::Connected && state.writer.is_some() {
            shared.transmit(&mut state, data);
        } else {
            shared.buffer(&mut state, data);
        }
    }

    /// Ends the active connection, or stops listening or connecting.
    ///
    /// Chunks already handed to the connection are written before it closes.
    /// Idempotent: connected=false is emitted only if a connection was up.
    pub fn disconnect(&self) {
        let mut state = self.shared.state.lock();
        self.shared.teardown(&mut state);
    }

    /// Disconnects and forgets the bound address.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        self.shared.teardown(&mut state);
        state.address = None;
        state.local_addr = None;
        state.peer = None;
    }
}

impl Drop for ConnectionEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn emit(&self, notification: Notification) {
        let _ = self
            .events
            .send(EndpointEvent::notice(self.side, notification));
    }

    fn set_connected(&self, state: &mut State, connected: bool) {
        if state.connected != connected {
            state.connected = connected;
            let _ = self
                .events
                .send(EndpointEvent::connected(self.side, connected));
        }
    }

    fn store_task(&self, generation: u64, handle: JoinHandle<()>) {
        let mut state = self.state.lock();
        if state.generation == generation && state.mode.is_active() {
            state.task = Some(handle);
        } else if state.generation != generation {
            handle.abort();
        }
    }

    fn bind_listener(&self, addr: SocketAddrV4) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(addr).into())?;
        socket.listen(1)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        let _guard = self.runtime.enter();
        TcpListener::from_std(std_listener)
    }

    async fn open_connection(&self, addr: SocketAddrV4) -> Result<TcpStream, RelayError> {
        let target = SocketAddr::V4(addr);
        let socket = TcpSocket::new_v4().map_err(|e| RelayError::Connect(target, e))?;
        let connecting = socket.connect(target);

        match self.options.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connecting).await {
                Ok(result) => result.map_err(|e| RelayError::Connect(target, e)),
                Err(_) => Err(RelayError::ConnectTimeout(target, limit)),
            },
            None => connecting.await.map_err(|e| RelayError::Connect(target, e)),
        }
    }

    fn setup_failed(&self, generation: u64, err: RelayError) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        tracing::warn!("[{}] {}", self.side, err);
        state.generation += 1;
        state.mode = EndpointMode::Disconnected;
        state.local_addr = None;
        state.task = None;
        self.emit(Notification::from(&err));
        self.set_connected(&mut state, false);
    }

    /// Promotes a freshly accepted or connected stream to the active
    /// connection and runs its I/O until it ends.
    async fn establish(self: Arc<Self>, generation: u64, stream: TcpStream, peer: SocketAddr) {
        if self.options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", self.side, e);
            }
        }
        let local_addr = stream.local_addr().ok();

        let outgoing = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            state.mode = EndpointMode::Connected;
            state.peer = Some(peer);
            state.local_addr = local_addr;
            state.writer = Some(tx);

            tracing::info!("[{}] Connection established with {}", self.side, peer);
            self.emit(Notification::info(format!(
                "Connection Established: {}",
                peer
            )));
            self.set_connected(&mut state, true);

            let pending = std::mem::take(&mut state.pending);
            if !pending.is_empty() {
                let total: usize = pending.iter().map(Bytes::len).sum();
                tracing::debug!("[{}] Flushing {} buffered bytes", self.side, total);
                for chunk in pending {
                    self.transmit(&mut state, chunk);
                }
            }
            rx
        };

        self.run_connection(generation, stream, outgoing, peer).await;
    }

    /// Writes queued chunks until the queue closes or the connection fails.
    /// Reads run in their own task so a write is never cut short.
    async fn run_connection(
        self: Arc<Self>,
        generation: u64,
        stream: TcpStream,
        mut outgoing: mpsc::UnboundedReceiver<Bytes>,
        peer: SocketAddr,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut reading = {
            let shared = Arc::clone(&self);
            self.runtime
                .spawn(async move { shared.read_loop(generation, reader).await })
        };
        let mut reader_done = false;

        let ended = loop {
            tokio::select! {
                chunk = outgoing.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(e) = self.write_chunk(&mut writer, chunk, peer).await {
                            break Ended::Failed(e);
                        }
                    }
                    None => break Ended::Closing,
                },
                joined = &mut reading, if !reader_done => {
                    reader_done = true;
                    match joined {
                        // keep writing until the queue closes
                        Ok(Ended::Closing) => {}
                        Ok(ended) => break ended,
                        Err(e) => {
                            break Ended::Failed(io::Error::new(io::ErrorKind::Other, e.to_string()))
                        }
                    }
                }
            }
        };
        reading.abort();

        match ended {
            Ended::Closing => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("[{}] Shutdown of {} failed: {}", self.side, peer, e);
                }
                tracing::debug!("[{}] Flushed and closed connection to {}", self.side, peer);
            }
            ended => self.connection_lost(generation, ended, &mut outgoing, peer),
        }
    }

    async fn read_loop(&self, generation: u64, mut reader: OwnedReadHalf) -> Ended {
        let mut buf = vec![0u8; self.options.recv_buffer_size.max(1)];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return Ended::PeerClosed,
                Ok(n) => {
                    tracing::debug!("[{}] Received {} bytes", self.side, n);
                    if !self.deliver(generation, Bytes::copy_from_slice(&buf[..n])) {
                        return Ended::Closing;
                    }
                }
                Err(e) => return Ended::Failed(e),
            }
        }
    }

    async fn write_chunk(
        &self,
        writer: &mut OwnedWriteHalf,
        chunk: Bytes,
        peer: SocketAddr,
    ) -> io::Result<()> {
        match writer.write_all(&chunk).await {
            Ok(()) => {
                tracing::debug!("[{}] Sent {} bytes to {}", self.side, chunk.len(), peer);
                self.emit(Notification::info(format!(
                    "Sent to {} ({} Bytes)",
                    peer,
                    chunk.len()
                )));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("[{}] Write to {} failed: {}", self.side, peer, e);
                self.emit(Notification::error(format!(
                    "Dropped {} Bytes for {}: {}",
                    chunk.len(),
                    peer,
                    e
                )));
                Err(e)
            }
        }
    }

    /// Publishes received bytes unless the connection has been torn down.
    fn deliver(&self, generation: u64, data: Bytes) -> bool {
        let state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        let _ = self.events.send(EndpointEvent::data(self.side, data));
        true
    }

    fn transmit(&self, state: &mut State, data: Bytes) {
        let target = state.target();
        let len = data.len();
        let Some(writer) = state.writer.as_ref() else {
            self.buffer(state, data);
            return;
        };

        self.emit(Notification::info(format!(
            "Sending to {} ({} Bytes)",
            target, len
        )));
        if let Err(mpsc::error::SendError(data)) = writer.send(data) {
            self.buffer(state, data);
        }
    }

    fn buffer(&self, state: &mut State, data: Bytes) {
        let len = data.len();
        state.pending.push_back(data);
        tracing::debug!(
            "[{}] Not connected, buffered {} bytes ({} pending)",
            self.side,
            len,
            state.pending_len()
        );
        self.emit(Notification::error(format!(
            "Cannot send data when not connected: buffered {} Bytes for {}",
            len,
            state.target()
        )));
    }

    /// Handles a connection the peer or the network ended. Chunks still
    /// queued for writing go back to the pending buffer in order.
    fn connection_lost(
        &self,
        generation: u64,
        ended: Ended,
        outgoing: &mut mpsc::UnboundedReceiver<Bytes>,
        peer: SocketAddr,
    ) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }

        let message = match ended {
            Ended::PeerClosed => format!("Connection closed by {}", peer),
            Ended::Failed(e) => RelayError::Io(e).to_string(),
            Ended::Closing => format!("Connection to {} ended", peer),
        };
        tracing::warn!("[{}] {}", self.side, message);

        state.generation += 1;
        state.mode = EndpointMode::Disconnected;
        state.writer = None;
        state.task = None;
        state.local_addr = None;

        outgoing.close();
        let mut kept = 0;
        while let Ok(chunk) = outgoing.try_recv() {
            kept += chunk.len();
            state.pending.push_back(chunk);
        }

        self.emit(Notification::error(message));
        if kept > 0 {
            tracing::warn!("[{}] Kept {} unsent bytes for {}", self.side, kept, peer);
            self.emit(Notification::error(format!(
                "Connection lost: buffered {} unsent Bytes for {}",
                kept, peer
            )));
        }
        self.set_connected(&mut state, false);
    }

    /// Releases whatever socket the endpoint holds. Safe in every mode.
    ///
    /// A live connection is left to flush its writer queue, bounded by the
    /// drain timeout; listen and connect attempts are cancelled outright.
    fn teardown(self: &Arc<Self>, state: &mut State) {
        state.generation += 1;
        let draining = state.writer.take().is_some();

        if let Some(task) = state.task.take() {
            if draining {
                self.watch_drain(task, state.target());
            } else {
                task.abort();
            }
        }
        if state.mode.is_active() {
            state.mode = EndpointMode::Disconnected;
            state.local_addr = None;
            tracing::info!("[{}] Disconnected from {}", self.side, state.target());
            self.emit(Notification::info(format!(
                "Disconnected from {}",
                state.target()
            )));
        }
        self.set_connected(state, false);
    }

    fn watch_drain(self: &Arc<Self>, mut task: JoinHandle<()>, target: String) {
        let shared = Arc::clone(self);
        let limit = self.options.drain_timeout;
        self.runtime.spawn(async move {
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                task.abort();
                tracing::warn!("[{}] Gave up flushing data to {}", shared.side, target);
                shared.emit(Notification::error(format!(
                    "Gave up flushing data to {} after {} ms",
                    target,
                    limit.as_millis()
                )));
            }
        });
    }
}
