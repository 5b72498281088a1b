//! Relay orchestrator.
//!
//! Owns a listen-role endpoint facing the local client and a connect-role
//! endpoint facing the remote service, and pipes bytes between them.
//!
//! ## Architecture
//!
//! ```text
//! local client ──▶ Local endpoint ──┐                ┌──▶ Remote endpoint ──▶ remote peer
//!                                   ▼                │
//!                            endpoint events ──▶ pump ──▶ subscribers (RelayEvent)
//!                                   ▲                │
//! local client ◀── Local endpoint ◀─┘◀───────────────┘◀── Remote endpoint ◀── remote peer
//! ```
//!
//! A single pump task consumes both endpoints' events in order, forwards data
//! to the opposite endpoint's send path, cascades a local disconnect into a
//! remote disconnect, and republishes everything to subscribers.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::{EndpointOptions, RelayConfig};
use crate::endpoint::{ConnectionEndpoint, EventReceiver};
use crate::error::RelayError;
use crate::event::{EndpointEvent, EndpointEventKind, RelayEvent, Side};
use crate::notification::Notification;
use crate::resolve::{AddressResolver, SystemResolver};

/// Receiver of an orchestrator subscription.
pub type RelayEvents = mpsc::UnboundedReceiver<RelayEvent>;

/// Snapshot of relayed traffic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    /// Bytes received from the local client.
    pub local_bytes: u64,
    /// Chunks received from the local client.
    pub local_chunks: u64,
    /// Bytes received from the remote peer.
    pub remote_bytes: u64,
    /// Chunks received from the remote peer.
    pub remote_chunks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    local_bytes: AtomicU64,
    local_chunks: AtomicU64,
    remote_bytes: AtomicU64,
    remote_chunks: AtomicU64,
}

impl Counters {
    fn record(&self, side: Side, len: usize) {
        let (bytes, chunks) = match side {
            Side::Local => (&self.local_bytes, &self.local_chunks),
            Side::Remote => (&self.remote_bytes, &self.remote_chunks),
        };
        bytes.fetch_add(len as u64, Ordering::Relaxed);
        chunks.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            local_bytes: self.local_bytes.load(Ordering::Relaxed),
            local_chunks: self.local_chunks.load(Ordering::Relaxed),
            remote_bytes: self.remote_bytes.load(Ordering::Relaxed),
            remote_chunks: self.remote_chunks.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out list. Each subscriber has its own unbounded queue; closed
/// subscribers are pruned on the next publish.
#[derive(Debug, Default)]
struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<RelayEvent>>>,
}

impl Subscribers {
    fn subscribe(&self) -> RelayEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    fn publish(&self, event: RelayEvent) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn len(&self) -> usize {
        self.senders.lock().len()
    }
}

/// Full-duplex intercepting relay between one local client and one remote
/// service.
///
/// Must be created inside a Tokio runtime. All methods are synchronous;
/// failures are reported on the notification stream, never returned.
pub struct RelayOrchestrator {
    local: Arc<ConnectionEndpoint>,
    remote: Arc<ConnectionEndpoint>,
    resolver: Arc<dyn AddressResolver>,
    subscribers: Arc<Subscribers>,
    counters: Arc<Counters>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for RelayOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayOrchestrator")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("resolver", &"AddressResolver")
            .field("subscribers", &self.subscribers.len())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RelayOrchestrator {
    /// Creates a relay using the operating system resolver.
    pub fn new(options: EndpointOptions) -> Self {
        Self::with_resolver(options, Arc::new(SystemResolver::new()))
    }

    /// Creates a relay from a loaded configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.endpoint_options())
    }

    /// Creates a relay with a custom resolver.
    pub fn with_resolver(options: EndpointOptions, resolver: Arc<dyn AddressResolver>) -> Self {
        let runtime = Handle::current();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let local = Arc::new(ConnectionEndpoint::with_handle(
            Side::Local,
            options,
            events_tx.clone(),
            runtime.clone(),
        ));
        let remote = Arc::new(ConnectionEndpoint::with_handle(
            Side::Remote,
            options,
            events_tx,
            runtime.clone(),
        ));

        let subscribers = Arc::new(Subscribers::default());
        let counters = Arc::new(Counters::default());

        runtime.spawn(pump(
            events_rx,
            Arc::downgrade(&local),
            Arc::downgrade(&remote),
            Arc::clone(&subscribers),
            Arc::clone(&counters),
        ));

        Self {
            local,
            remote,
            resolver,
            subscribers,
            counters,
            disposed: AtomicBool::new(false),
        }
    }

    /// Registers a new observer. Events raised before this call are not
    /// replayed.
    pub fn subscribe(&self) -> RelayEvents {
        self.subscribers.subscribe()
    }

    /// Returns the listen-role endpoint.
    pub fn local(&self) -> &ConnectionEndpoint {
        &self.local
    }

    /// Returns the connect-role endpoint.
    pub fn remote(&self) -> &ConnectionEndpoint {
        &self.remote
    }

    /// Returns traffic counters.
    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    /// Resolves `host` and starts listening for the local client.
    pub fn start_listener(&self, host: &str, port: u16) {
        match self.resolver.resolve_ipv4(host) {
            Some(ip) => self.start_listener_at(SocketAddrV4::new(ip, port)),
            None => self.reject(RelayError::Unresolvable(host.to_string())),
        }
    }

    /// Starts listening on `addr`, which must belong to this host.
    pub fn start_listener_at(&self, addr: SocketAddrV4) {
        if self.is_disposed() {
            return;
        }
        if !self.resolver.is_local(*addr.ip()) {
            self.reject(RelayError::NotLocal(*addr.ip()));
            return;
        }
        tracing::info!("Starting listener on {}", addr);
        self.local.listen(addr);
    }

    /// Resolves `host` and connects to the remote service.
    pub fn start_sender(&self, host: &str, port: u16) {
        match self.resolver.resolve_ipv4(host) {
            Some(ip) => self.start_sender_at(SocketAddrV4::new(ip, port)),
            None => self.reject(RelayError::Unresolvable(host.to_string())),
        }
    }

    /// Connects to the remote service at `addr`.
    pub fn start_sender_at(&self, addr: SocketAddrV4) {
        if self.is_disposed() {
            return;
        }
        tracing::info!("Starting sender to {}", addr);
        self.remote.connect(addr);
    }

    /// Drops the local client and closes the listener.
    pub fn stop_listener(&self) {
        self.local.disconnect();
    }

    /// Drops the remote connection.
    pub fn stop_sender(&self) {
        self.remote.disconnect();
    }

    /// Sends bytes to the remote peer, buffering if it is not connected.
    pub fn send_to_remote(&self, data: impl Into<Bytes>) {
        self.remote.send(data);
    }

    /// Sends bytes to the local client, buffering if it is not connected.
    pub fn send_to_local(&self, data: impl Into<Bytes>) {
        self.local.send(data);
    }

    /// Closes both endpoints. Safe to call repeatedly and on a relay that was
    /// never started; later start calls are ignored.
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down relay");
        self.remote.close();
        self.local.close();
    }

    /// Returns true once [`shutdown`](RelayOrchestrator::shutdown) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn reject(&self, err: RelayError) {
        tracing::warn!("{}", err);
        self.subscribers
            .publish(RelayEvent::Notification(Notification::from(&err)));
    }
}

impl Drop for RelayOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Relay loop. Holds only weak references so dropping the orchestrator
/// closes the endpoints, which closes the event channel and ends the loop.
async fn pump(
    mut events: EventReceiver,
    local: Weak<ConnectionEndpoint>,
    remote: Weak<ConnectionEndpoint>,
    subscribers: Arc<Subscribers>,
    counters: Arc<Counters>,
) {
    while let Some(event) = events.recv().await {
        let EndpointEvent { side, kind } = &event;
        match kind {
            EndpointEventKind::Data(data) => {
                counters.record(*side, data.len());
                let target = match side.peer() {
                    Side::Local => &local,
                    Side::Remote => &remote,
                };
                if let Some(target) = target.upgrade() {
                    target.send(data.clone());
                }
            }
            EndpointEventKind::Connected(false) if *side == Side::Local => {
                if let Some(remote) = remote.upgrade() {
                    tracing::info!("Local client disconnected, dropping remote connection");
                    remote.disconnect();
                }
            }
            _ => {}
        }
        subscribers.publish(RelayEvent::from_endpoint(event));
    }
    tracing::debug!("Relay event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Severity;
    use crate::resolve::StaticResolver;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const WAIT: Duration = Duration::from_secs(5);

    fn relay() -> (RelayOrchestrator, RelayEvents) {
        let resolver = StaticResolver::new().with_host("remote.test", Ipv4Addr::LOCALHOST);
        let relay = RelayOrchestrator::with_resolver(EndpointOptions::default(), Arc::new(resolver));
        let events = relay.subscribe();
        (relay, events)
    }

    async fn wait_for<F>(rx: &mut RelayEvents, mut pred: F) -> RelayEvent
    where
        F: FnMut(&RelayEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.expect("subscription closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for relay event")
    }

    async fn wait_event(rx: &mut RelayEvents, expected: RelayEvent) {
        wait_for(rx, |e| *e == expected).await;
    }

    async fn drain(rx: &mut RelayEvents) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            events.push(event);
        }
        events
    }

    fn is_notification(event: &RelayEvent, severity: Severity) -> bool {
        matches!(event, RelayEvent::Notification(n) if n.severity == severity)
    }

    /// Brings up remote peer and local client. Returns (client, peer).
    async fn established(relay: &RelayOrchestrator, rx: &mut RelayEvents) -> (TcpStream, TcpStream) {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = remote_listener.local_addr().unwrap().port();

        relay.start_sender("remote.test", remote_port);
        let (peer, _) = remote_listener.accept().await.unwrap();
        wait_event(rx, RelayEvent::RemoteConnected(true)).await;

        relay.start_listener("127.0.0.1", 0);
        let bound = relay.local().local_addr().unwrap();
        let client = TcpStream::connect(bound).await.unwrap();
        wait_event(rx, RelayEvent::LocalConnected(true)).await;

        (client, peer)
    }

    #[tokio::test]
    async fn local_bytes_reach_remote_peer() {
        let (relay, mut rx) = relay();
        let (mut client, mut peer) = established(&relay, &mut rx).await;

        client.write_all(&[0xDE, 0xAD]).await.unwrap();
        wait_event(&mut rx, RelayEvent::LocalData(Bytes::from_static(&[0xDE, 0xAD]))).await;

        let mut received = [0u8; 2];
        tokio::time::timeout(WAIT, peer.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, [0xDE, 0xAD]);
        assert_eq!(relay.stats().local_bytes, 2);
    }

    #[tokio::test]
    async fn remote_bytes_reach_local_client() {
        let (relay, mut rx) = relay();
        let (mut client, mut peer) = established(&relay, &mut rx).await;

        peer.write_all(b"pong").await.unwrap();
        wait_for(&mut rx, |e| matches!(e, RelayEvent::RemoteData(_))).await;

        let mut received = [0u8; 4];
        tokio::time::timeout(WAIT, client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"pong");
    }

    #[tokio::test]
    async fn large_stream_arrives_in_order() {
        let (relay, mut rx) = relay();
        let (mut client, mut peer) = established(&relay, &mut rx).await;

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        tokio::time::timeout(WAIT, peer.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn non_local_listener_is_rejected() {
        let relay = RelayOrchestrator::new(EndpointOptions::default());
        let mut rx = relay.subscribe();

        relay.start_listener("8.8.8.8", 5000);

        let event = wait_for(&mut rx, |e| matches!(e, RelayEvent::Notification(_))).await;
        assert!(is_notification(&event, Severity::Fatal));
        let rest = drain(&mut rx).await;
        assert!(rest
            .iter()
            .all(|e| !matches!(e, RelayEvent::LocalConnected(_))));
        assert_eq!(relay.local().mode(), crate::EndpointMode::Idle);
    }

    #[tokio::test]
    async fn unresolvable_host_is_rejected() {
        let (relay, mut rx) = relay();

        relay.start_sender("nowhere.test", 500);

        let event = wait_for(&mut rx, |e| matches!(e, RelayEvent::Notification(_))).await;
        assert!(is_notification(&event, Severity::Fatal));
        assert!(drain(&mut rx).await.is_empty());
        assert_eq!(relay.remote().mode(), crate::EndpointMode::Idle);
    }

    #[tokio::test]
    async fn data_sent_before_remote_connects_is_buffered() {
        let (relay, mut rx) = relay();
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = remote_listener.local_addr().unwrap().port();

        relay.send_to_remote(vec![1u8, 2, 3, 4, 5]);
        let event = wait_for(&mut rx, |e| matches!(e, RelayEvent::Notification(_))).await;
        match event {
            RelayEvent::Notification(n) => {
                assert_eq!(n.severity, Severity::Error);
                assert_eq!(n.origin, Some(Side::Remote));
                assert!(n.message.contains("buffered"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(relay.remote().pending_len(), 5);

        relay.start_sender_at(SocketAddrV4::new(Ipv4Addr::LOCALHOST, remote_port));
        let (mut peer, _) = remote_listener.accept().await.unwrap();
        wait_event(&mut rx, RelayEvent::RemoteConnected(true)).await;
        relay.send_to_remote(vec![6u8, 7]);

        let mut received = [0u8; 7];
        tokio::time::timeout(WAIT, peer.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(relay.remote().pending_len(), 0);
    }

    #[tokio::test]
    async fn remote_close_does_not_drop_local_client() {
        let (relay, mut rx) = relay();
        let (_client, peer) = established(&relay, &mut rx).await;

        drop(peer);

        wait_for(&mut rx, |e| {
            matches!(e, RelayEvent::Notification(n)
                if n.severity == Severity::Error && n.origin == Some(Side::Remote))
        })
        .await;
        wait_event(&mut rx, RelayEvent::RemoteConnected(false)).await;

        let rest = drain(&mut rx).await;
        assert!(!rest.contains(&RelayEvent::LocalConnected(false)));
        assert!(relay.local().is_connected());
        assert!(!relay.remote().is_connected());
    }

    #[tokio::test]
    async fn local_disconnect_cascades_to_remote() {
        let (relay, mut rx) = relay();
        let (client, mut peer) = established(&relay, &mut rx).await;

        drop(client);

        wait_event(&mut rx, RelayEvent::LocalConnected(false)).await;
        let mut between = Vec::new();
        loop {
            let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if event == RelayEvent::RemoteConnected(false) {
                break;
            }
            between.push(event);
        }
        assert!(!between.iter().any(|e| matches!(
            e,
            RelayEvent::Notification(n)
                if n.origin == Some(Side::Remote) && n.message.starts_with("Sent")
        )));
        assert!(!relay.remote().is_connected());

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(WAIT, peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn final_client_write_reaches_remote_before_cascade() {
        let (relay, mut rx) = relay();
        let (mut client, mut peer) = established(&relay, &mut rx).await;

        client.write_all(b"goodbye").await.unwrap();
        drop(client);

        let mut received = Vec::new();
        tokio::time::timeout(WAIT, peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"goodbye");
        wait_event(&mut rx, RelayEvent::RemoteConnected(false)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_sender_flushes_what_was_sent() {
        let (relay, mut rx) = relay();
        let (_client, mut peer) = established(&relay, &mut rx).await;

        relay.send_to_remote(vec![7u8; 5]);
        relay.stop_sender();

        let mut received = Vec::new();
        tokio::time::timeout(WAIT, peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vec![7u8; 5]);
        assert_eq!(relay.remote().pending_len(), 0);
    }

    #[tokio::test]
    async fn stop_listener_cascades_once() {
        let (relay, mut rx) = relay();
        let (_client, _peer) = established(&relay, &mut rx).await;

        relay.stop_listener();
        relay.stop_listener();

        let events = drain(&mut rx).await;
        let local_downs = events
            .iter()
            .filter(|e| **e == RelayEvent::LocalConnected(false))
            .count();
        let remote_downs = events
            .iter()
            .filter(|e| **e == RelayEvent::RemoteConnected(false))
            .count();
        assert_eq!(local_downs, 1);
        assert_eq!(remote_downs, 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let (relay, mut first) = relay();
        let mut second = relay.subscribe();

        relay.send_to_local(vec![9u8]);

        let a = wait_for(&mut first, |e| matches!(e, RelayEvent::Notification(_))).await;
        let b = wait_for(&mut second, |e| matches!(e, RelayEvent::Notification(_))).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let (relay, rx) = relay();
        drop(rx);
        relay.send_to_remote(vec![1u8]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.subscribers.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_without_start_is_safe() {
        let relay = RelayOrchestrator::new(EndpointOptions::default());
        relay.stop_sender();
        relay.stop_listener();
        relay.shutdown();
        relay.shutdown();
        assert!(relay.is_disposed());

        relay.start_listener("127.0.0.1", 0);
        assert_eq!(relay.local().mode(), crate::EndpointMode::Idle);
    }

    #[tokio::test]
    async fn stats_count_both_directions() {
        let (relay, mut rx) = relay();
        let (mut client, mut peer) = established(&relay, &mut rx).await;

        client.write_all(b"abc").await.unwrap();
        wait_for(&mut rx, |e| matches!(e, RelayEvent::LocalData(_))).await;
        peer.write_all(b"defgh").await.unwrap();
        wait_for(&mut rx, |e| matches!(e, RelayEvent::RemoteData(_))).await;

        let stats = relay.stats();
        assert_eq!(stats.local_bytes, 3);
        assert_eq!(stats.remote_bytes, 5);
        assert!(stats.local_chunks >= 1);
        assert!(stats.remote_chunks >= 1);
    }
}
