//! Datagram transport: listen/dial/close with connection-oriented
//! semantics over UDP. Virtual connections are multiplexed over one bound
//! socket per listener; dials get their own ephemeral socket. A registry
//! of transport variants picks an implementation by the address's
//! protocol tag.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use palaver_core::wire::{decode_frame, encode_frame, Frame, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
use palaver_core::{Keypair, Multiaddr, PeerId, Proto};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conn::Connection;

/// Invoked for every connection an upgrade completes on a listener.
pub type ConnHandler = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

const HELLO_RESEND: Duration = Duration::from_millis(500);
const RECV_BUF_LEN: usize = MAX_PAYLOAD_LEN + 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),
    #[error("dial timed out")]
    DialTimeout,
    #[error("remote rejected or sent an invalid hello")]
    UpgradeRejected,
    #[error("remote identity mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },
    #[error("no listener on {0}")]
    NotFound(Multiaddr),
    #[error("no transport handles {0}")]
    Unsupported(Multiaddr),
}

/// Connection-upgrade step: both sides exchange a hello carrying the
/// protocol version and their public key; the remote peer ID is derived
/// from the key before a connection is surfaced.
#[derive(Clone)]
pub struct Upgrader {
    version: u8,
    public_key: [u8; 32],
}

impl Upgrader {
    pub fn new(keypair: &Keypair) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            public_key: keypair.public_key_bytes(),
        }
    }

    fn hello(&self) -> Frame {
        Frame::Hello {
            version: self.version,
            public_key: self.public_key,
        }
    }

    /// Validate a received hello; `None` means ignore the sender.
    fn accept(&self, version: u8, public_key: &[u8; 32]) -> Option<PeerId> {
        if version != self.version {
            return None;
        }
        PeerId::from_public_key_bytes(public_key).ok()
    }
}

struct ListenerEntry {
    socket: Arc<UdpSocket>,
    local: Multiaddr,
    conns: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// The UDP transport. Listener and connection registries are each behind
/// their own lock; every registered entry installs a close hook that
/// removes itself, so the registries never hold closed entries.
pub struct UdpTransport {
    upgrader: Upgrader,
    dial_timeout: Duration,
    closed: AtomicBool,
    listeners: Mutex<HashMap<Multiaddr, Arc<ListenerEntry>>>,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl UdpTransport {
    pub fn new(upgrader: Upgrader, dial_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            upgrader,
            dial_timeout,
            closed: AtomicBool::new(false),
            listeners: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn handles(&self, addr: &Multiaddr) -> bool {
        addr.proto() == Proto::Udp
    }

    /// Bind a datagram socket at `addr` and route upgraded inbound
    /// connections to `on_connection`. Returns the post-bind local
    /// address, reflecting any OS-assigned port.
    pub async fn listen(
        self: &Arc<Self>,
        addr: &Multiaddr,
        on_connection: ConnHandler,
    ) -> Result<Multiaddr, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.handles(addr) {
            return Err(TransportError::Unsupported(*addr));
        }
        let socket = UdpSocket::bind(addr.socket_addr())
            .await
            .map_err(TransportError::Bind)?;
        let bound = socket.local_addr().map_err(TransportError::Bind)?;
        let entry = Arc::new(ListenerEntry {
            socket: Arc::new(socket),
            local: Multiaddr::from_socket_addr(bound, Proto::Udp),
            conns: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        });
        self.listeners.lock().unwrap().insert(*addr, entry.clone());
        let task = tokio::spawn(Self::listener_loop(
            self.clone(),
            entry.clone(),
            on_connection,
        ));
        *entry.task.lock().unwrap() = Some(task);
        Ok(entry.local)
    }

    async fn listener_loop(
        transport: Arc<Self>,
        entry: Arc<ListenerEntry>,
        on_connection: ConnHandler,
    ) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let (len, src) = match entry.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("listener recv error: {e}");
                    break;
                }
            };
            let frame = match decode_frame(&buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("dropping stray datagram from {src}: {e}");
                    continue;
                }
            };
            match frame {
                Frame::Hello {
                    version,
                    public_key,
                } => {
                    if entry.conns.lock().unwrap().contains_key(&src) {
                        // our reply may have been lost; answer again
                        if let Ok(reply) = encode_frame(&transport.upgrader.hello()) {
                            let _ = entry.socket.send_to(&reply, src).await;
                        }
                        continue;
                    }
                    let peer = match transport.upgrader.accept(version, &public_key) {
                        Some(peer) => peer,
                        None => {
                            warn!("rejecting hello from {src}");
                            continue;
                        }
                    };
                    if let Ok(reply) = encode_frame(&transport.upgrader.hello()) {
                        let _ = entry.socket.send_to(&reply, src).await;
                    }
                    let conn = Connection::new(entry.socket.clone(), src, peer);
                    transport.register(&conn);
                    entry.conns.lock().unwrap().insert(src, conn.clone());
                    let entry_weak = Arc::downgrade(&entry);
                    conn.on_close(Box::new(move || {
                        if let Some(entry) = entry_weak.upgrade() {
                            entry.conns.lock().unwrap().remove(&src);
                        }
                    }));
                    on_connection(conn);
                }
                Frame::Data(payload) => {
                    let conn = entry.conns.lock().unwrap().get(&src).cloned();
                    if let Some(conn) = conn {
                        conn.stream().deliver(&payload);
                    }
                }
                Frame::Close => {
                    let conn = entry.conns.lock().unwrap().get(&src).cloned();
                    if let Some(conn) = conn {
                        conn.close_remote();
                    }
                }
            }
        }
    }

    /// Open an outbound connection: ephemeral socket, hello exchange with
    /// retransmission until the dial timeout, then the upgraded
    /// connection. When `addr` names a peer, the hello-derived identity
    /// must match it.
    pub async fn dial(self: &Arc<Self>, addr: &Multiaddr) -> Result<Arc<Connection>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.handles(addr) {
            return Err(TransportError::Unsupported(*addr));
        }
        let remote = addr.socket_addr();
        let bind_ip: IpAddr = match remote.ip() {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((bind_ip, 0))
            .await
            .map_err(TransportError::Dial)?;
        let socket = Arc::new(socket);
        let peer = self.upgrade_outbound(&socket, addr).await?;
        let conn = Connection::new(socket.clone(), remote, peer);
        self.register(&conn);
        conn.set_recv_task(tokio::spawn(Self::conn_recv_loop(socket, conn.clone())));
        Ok(conn)
    }

    async fn upgrade_outbound(
        &self,
        socket: &UdpSocket,
        addr: &Multiaddr,
    ) -> Result<PeerId, TransportError> {
        let remote = addr.socket_addr();
        let hello = encode_frame(&self.upgrader.hello())
            .map_err(|e| TransportError::Dial(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let deadline = tokio::time::Instant::now() + self.dial_timeout;
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::DialTimeout);
            }
            socket
                .send_to(&hello, remote)
                .await
                .map_err(TransportError::Dial)?;
            let received = match tokio::time::timeout(HELLO_RESEND, socket.recv_from(&mut buf)).await
            {
                Err(_) => continue, // resend the hello
                Ok(Err(e)) => return Err(TransportError::Dial(e)),
                Ok(Ok(received)) => received,
            };
            let (len, src) = received;
            if src != remote {
                continue;
            }
            match decode_frame(&buf[..len]) {
                Ok(Frame::Hello {
                    version,
                    public_key,
                }) => {
                    let actual = self
                        .upgrader
                        .accept(version, &public_key)
                        .ok_or(TransportError::UpgradeRejected)?;
                    if let Some(expected) = addr.peer() {
                        if expected != actual {
                            return Err(TransportError::PeerMismatch { expected, actual });
                        }
                    }
                    return Ok(actual);
                }
                _ => continue,
            }
        }
    }

    async fn conn_recv_loop(socket: Arc<UdpSocket>, conn: Arc<Connection>) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let remote = conn.remote_addr();
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("connection recv error: {e}");
                    conn.close_remote();
                    break;
                }
            };
            if src != remote {
                continue;
            }
            match decode_frame(&buf[..len]) {
                Ok(Frame::Data(payload)) => conn.stream().deliver(&payload),
                Ok(Frame::Close) => {
                    conn.close_remote();
                    break;
                }
                Ok(Frame::Hello { .. }) => {} // late duplicate of the upgrade reply
                Err(e) => debug!("dropping garbled datagram from {src}: {e}"),
            }
        }
    }

    fn register(self: &Arc<Self>, conn: &Arc<Connection>) {
        self.connections.lock().unwrap().push(conn.clone());
        let transport = Arc::downgrade(self);
        let conn_weak = Arc::downgrade(conn);
        conn.on_close(Box::new(move || {
            if let (Some(transport), Some(conn)) = (transport.upgrade(), conn_weak.upgrade()) {
                transport
                    .connections
                    .lock()
                    .unwrap()
                    .retain(|c| !Arc::ptr_eq(c, &conn));
            }
        }));
    }

    /// Close the listener bound at `addr`, and with it every connection it
    /// accepted.
    pub fn unlisten(&self, addr: &Multiaddr) -> Result<(), TransportError> {
        let entry = self
            .listeners
            .lock()
            .unwrap()
            .remove(addr)
            .ok_or(TransportError::NotFound(*addr))?;
        if let Some(task) = entry.task.lock().unwrap().take() {
            task.abort();
        }
        let conns: Vec<_> = entry.conns.lock().unwrap().values().cloned().collect();
        for conn in conns {
            conn.close();
        }
        Ok(())
    }

    /// Current bound address of every active listener.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listeners
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.local)
            .collect()
    }

    /// Mark the transport closed (later listen/dial fail immediately),
    /// close every listener and connection, and wait for in-flight writes
    /// to drain. Safe to call more than once.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &listeners {
            if let Some(task) = entry.task.lock().unwrap().take() {
                task.abort();
            }
        }
        let conns: Vec<_> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain(..).collect()
        };
        for conn in &conns {
            conn.close();
        }
        for conn in &conns {
            conn.drained().await;
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

/// Transport variants, keyed by the address protocol tag they handle.
pub enum TransportVariant {
    Udp(Arc<UdpTransport>),
}

impl TransportVariant {
    fn handles(&self, addr: &Multiaddr) -> bool {
        match self {
            TransportVariant::Udp(t) => t.handles(addr),
        }
    }

    async fn listen(
        &self,
        addr: &Multiaddr,
        on_connection: ConnHandler,
    ) -> Result<Multiaddr, TransportError> {
        match self {
            TransportVariant::Udp(t) => t.listen(addr, on_connection).await,
        }
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Arc<Connection>, TransportError> {
        match self {
            TransportVariant::Udp(t) => t.dial(addr).await,
        }
    }

    fn unlisten(&self, addr: &Multiaddr) -> Result<(), TransportError> {
        match self {
            TransportVariant::Udp(t) => t.unlisten(addr),
        }
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        match self {
            TransportVariant::Udp(t) => t.listen_addrs(),
        }
    }

    async fn close(&self) {
        match self {
            TransportVariant::Udp(t) => t.close().await,
        }
    }
}

/// Picks a transport variant for an address at listen/dial time.
pub struct TransportRegistry {
    variants: Vec<TransportVariant>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            variants: Vec::new(),
        }
    }

    pub fn register(&mut self, variant: TransportVariant) {
        self.variants.push(variant);
    }

    fn find(&self, addr: &Multiaddr) -> Result<&TransportVariant, TransportError> {
        self.variants
            .iter()
            .find(|v| v.handles(addr))
            .ok_or(TransportError::Unsupported(*addr))
    }

    pub async fn listen(
        &self,
        addr: &Multiaddr,
        on_connection: ConnHandler,
    ) -> Result<Multiaddr, TransportError> {
        self.find(addr)?.listen(addr, on_connection).await
    }

    pub async fn dial(&self, addr: &Multiaddr) -> Result<Arc<Connection>, TransportError> {
        self.find(addr)?.dial(addr).await
    }

    pub fn unlisten(&self, addr: &Multiaddr) -> Result<(), TransportError> {
        self.find(addr)?.unlisten(addr)
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.variants
            .iter()
            .flat_map(|v| v.listen_addrs())
            .collect()
    }

    pub async fn close(&self) {
        for variant in &self.variants {
            variant.close().await;
        }
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Stream, StreamHandler};
    use std::net::Ipv4Addr;

    fn transport(id: &str) -> (Arc<UdpTransport>, PeerId) {
        let keypair = Keypair::from_external_id(id).unwrap();
        let peer = keypair.peer_id();
        let t = UdpTransport::new(Upgrader::new(&keypair), Duration::from_secs(2));
        (t, peer)
    }

    fn loopback(port: u16) -> Multiaddr {
        Multiaddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Proto::Udp, port)
    }

    fn collect_conns() -> (ConnHandler, Arc<Mutex<Vec<Arc<Connection>>>>) {
        let accepted: Arc<Mutex<Vec<Arc<Connection>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        let handler: ConnHandler = Arc::new(move |conn| sink.lock().unwrap().push(conn));
        (handler, accepted)
    }

    async fn wait_for(what: &str, check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    struct RecordingHandler {
        messages: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl StreamHandler for RecordingHandler {
        fn on_activated(&self, _stream: Arc<Stream>) {}
        fn on_message(&self, bytes: &[u8]) {
            self.messages.lock().unwrap().push(bytes.to_vec());
        }
        fn on_closed(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn listen_reports_bound_address() {
        let (t, _) = transport("listener");
        let (handler, _) = collect_conns();
        let local = t.listen(&loopback(0), handler).await.unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(t.listen_addrs(), vec![local]);
    }

    #[tokio::test]
    async fn dial_upgrades_both_sides() {
        let (server, server_id) = transport("server");
        let (client, client_id) = transport("client");
        let (handler, accepted) = collect_conns();
        let local = server.listen(&loopback(0), handler).await.unwrap();

        let conn = client.dial(&local.with_peer(server_id)).await.unwrap();
        assert_eq!(conn.remote_peer(), server_id);

        let accepted_for_wait = accepted.clone();
        wait_for("inbound connection", move || {
            !accepted_for_wait.lock().unwrap().is_empty()
        })
        .await;
        assert_eq!(accepted.lock().unwrap()[0].remote_peer(), client_id);
    }

    #[tokio::test]
    async fn dial_rejects_identity_mismatch() {
        let (server, _) = transport("honest-server");
        let (client, _) = transport("wary-client");
        let (_, wrong_id) = transport("someone-else");
        let (handler, _) = collect_conns();
        let local = server.listen(&loopback(0), handler).await.unwrap();

        let err = client.dial(&local.with_peer(wrong_id)).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerMismatch { .. }));
    }

    #[tokio::test]
    async fn data_flows_and_remote_close_notifies() {
        let (server, server_id) = transport("data-server");
        let (client, _) = transport("data-client");
        let (handler, accepted) = collect_conns();
        let local = server.listen(&loopback(0), handler).await.unwrap();

        let conn = client.dial(&local.with_peer(server_id)).await.unwrap();
        let accepted_for_wait = accepted.clone();
        wait_for("inbound connection", move || {
            !accepted_for_wait.lock().unwrap().is_empty()
        })
        .await;
        let inbound = accepted.lock().unwrap()[0].clone();
        let recording = RecordingHandler::new();
        inbound.stream().attach(recording.clone());

        conn.stream().write(b"unit one").unwrap();
        conn.stream().write(b"unit two").unwrap();
        let recording_for_wait = recording.clone();
        wait_for("two units", move || {
            recording_for_wait.messages.lock().unwrap().len() == 2
        })
        .await;
        assert_eq!(recording.messages.lock().unwrap()[0], b"unit one");

        let hook_fired = Arc::new(AtomicBool::new(false));
        let flag = hook_fired.clone();
        inbound.on_close(Box::new(move || flag.store(true, Ordering::SeqCst)));
        conn.close();
        let hook_for_wait = hook_fired.clone();
        wait_for("remote close", move || hook_for_wait.load(Ordering::SeqCst)).await;
        assert!(recording.closed.load(Ordering::SeqCst));
        wait_for("registry cleanup", || server.active_connections() == 0).await;
    }

    #[tokio::test]
    async fn closed_transport_rejects_new_work() {
        let (t, _) = transport("closing");
        let (handler, _) = collect_conns();
        t.listen(&loopback(0), handler.clone()).await.unwrap();
        t.close().await;
        t.close().await; // safe to repeat

        assert!(matches!(
            t.dial(&loopback(1)).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            t.listen(&loopback(0), handler).await,
            Err(TransportError::Closed)
        ));
        assert!(t.listen_addrs().is_empty());
    }

    #[tokio::test]
    async fn unlisten_removes_exactly_that_listener() {
        let (t, _) = transport("unlisten");
        let (handler, _) = collect_conns();
        let requested = loopback(0);
        t.listen(&requested, handler).await.unwrap();
        assert_eq!(t.listen_addrs().len(), 1);

        assert!(matches!(
            t.unlisten(&loopback(1)),
            Err(TransportError::NotFound(_))
        ));
        t.unlisten(&requested).unwrap();
        assert!(t.listen_addrs().is_empty());
    }

    #[tokio::test]
    async fn dial_times_out_without_a_listener() {
        let keypair = Keypair::from_external_id("impatient").unwrap();
        let t = UdpTransport::new(Upgrader::new(&keypair), Duration::from_millis(300));
        // a bound socket that never answers hellos
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Multiaddr::from_socket_addr(silent.local_addr().unwrap(), Proto::Udp);
        let err = t.dial(&target).await.unwrap_err();
        assert!(matches!(err, TransportError::DialTimeout));
    }

    #[tokio::test]
    async fn registry_dispatches_by_protocol_tag() {
        let (t, _) = transport("registry");
        let mut registry = TransportRegistry::new();
        registry.register(TransportVariant::Udp(t));
        let tcp_addr = Multiaddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Proto::Tcp, 4009);
        assert!(matches!(
            registry.dial(&tcp_addr).await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
