//! The chat node: owns the transports, tracks known and connected peers,
//! and runs the `/who` handshake that turns a one-way discovery into a
//! two-way chat link.
//!
//! Discovery flow: `peer_found` reserves the peer in the known set before
//! dialing, so concurrent discoveries of the same peer collapse into one
//! dial. After the dial upgrades, we introduce ourselves with `/who`; the
//! remote node answers by dialing back, which lands here as an inbound
//! connection. Each side chats over the connection it opened itself.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use palaver_core::{Envelope, IdentityError, Keypair, Multiaddr, PeerId, Proto, ACTION_TEXT, ACTION_WHO};
use tracing::{debug, info};

use crate::chat::{ChatHandler, OnOutput};
use crate::config::Config;
use crate::conn::Connection;
use crate::transport::{
    ConnHandler, TransportError, TransportRegistry, TransportVariant, UdpTransport, Upgrader,
};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A peer we hold an open chat session with.
struct Friend {
    name: String,
    chat: Arc<ChatHandler>,
}

pub struct ChatNode {
    weak: Weak<ChatNode>,
    peer_id: PeerId,
    host: IpAddr,
    port: u16,
    transports: TransportRegistry,
    /// Peers we have seen, including dials still in flight.
    known: Mutex<HashSet<PeerId>>,
    /// Peers we hold an active chat session with, over our own outbound
    /// connection.
    friends: Mutex<HashMap<PeerId, Friend>>,
    output: OnOutput,
}

impl ChatNode {
    /// Derive this node's identity from `external_id`, start listening and
    /// print the banner.
    pub async fn start(
        external_id: &str,
        config: &Config,
        output: OnOutput,
    ) -> Result<Arc<Self>, NodeError> {
        let keypair = Keypair::from_external_id(external_id)?;
        let peer_id = keypair.peer_id();
        let host = config
            .listen_host
            .unwrap_or_else(private_network_address);

        let transport = UdpTransport::new(Upgrader::new(&keypair), config.dial_timeout());
        let mut transports = TransportRegistry::new();
        transports.register(TransportVariant::Udp(transport));

        let node = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            peer_id,
            host,
            port: config.listen_port,
            transports,
            known: Mutex::new(HashSet::new()),
            friends: Mutex::new(HashMap::new()),
            output,
        });

        let weak = node.weak.clone();
        let on_connection: ConnHandler = Arc::new(move |conn| {
            if let Some(node) = weak.upgrade() {
                node.inbound_connection(conn);
            }
        });
        let requested = Multiaddr::new(host, Proto::Udp, config.listen_port);
        let bound = node.transports.listen(&requested, on_connection).await?;

        (node.output)(&format!(
            "This node is {peer_id}, listening on {host}"
        ));
        (node.output)(&format!("> {bound}"));
        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.transports.listen_addrs()
    }

    /// The address this node advertises in `/who` introductions.
    pub fn listen_endpoint(&self) -> Option<Multiaddr> {
        self.listen_addrs().into_iter().next()
    }

    /// Broadcast a chat line to every friend. A failing session is
    /// reported and skipped, the rest still get the message.
    pub fn send(&self, text: &str) {
        let sessions: Vec<(String, Arc<ChatHandler>)> = {
            let friends = self.friends.lock().unwrap();
            friends
                .values()
                .map(|f| (f.name.clone(), f.chat.clone()))
                .collect()
        };
        let envelope = Envelope::text(text);
        for (name, chat) in sessions {
            if let Err(e) = chat.send(&envelope) {
                (self.output)(&format!("Could not reach {name}: {e}"));
            }
        }
    }

    /// Register a peer by host, port and its printed peer ID.
    pub async fn add_peer(self: &Arc<Self>, host: IpAddr, port: u16, peer_id: PeerId) {
        self.peer_found(Multiaddr::new(host, Proto::Udp, port).with_peer(peer_id))
            .await;
    }

    /// Register a peer by host, port and the external identifier its node
    /// was started with; the peer ID is re-derived locally.
    pub async fn add_peer_external(
        self: &Arc<Self>,
        host: IpAddr,
        port: u16,
        external_id: &str,
    ) -> Result<(), NodeError> {
        let peer_id = Keypair::from_external_id(external_id)?.peer_id();
        self.add_peer(host, port, peer_id).await;
        Ok(())
    }

    /// Handle a discovery candidate carried in a `/who` introduction.
    async fn add_candidate(self: &Arc<Self>, peer: PeerId, host: IpAddr, port: u16) {
        self.peer_found(Multiaddr::new(host, Proto::Udp, port).with_peer(peer))
            .await;
    }

    /// Entry point for every discovered peer. Idempotent: the peer ID is
    /// reserved in the known set before any await, so a concurrent
    /// discovery of the same peer is a no-op.
    async fn peer_found(self: &Arc<Self>, addr: Multiaddr) {
        let Some(peer) = addr.peer() else {
            debug!("ignoring candidate without identity: {addr}");
            return;
        };
        if peer == self.peer_id {
            return;
        }
        if !self.known.lock().unwrap().insert(peer) {
            return;
        }
        let conn = match self.transports.dial(&addr).await {
            Ok(conn) => conn,
            Err(e) => {
                // free the slot so a later discovery can retry
                self.known.lock().unwrap().remove(&peer);
                (self.output)(&format!("Could not connect to {peer}: {e}"));
                return;
            }
        };
        let weak = self.weak.clone();
        conn.on_close(Box::new(move || {
            if let Some(node) = weak.upgrade() {
                node.peer_disconnected(peer);
            }
        }));
        (self.output)(&format!("Connected to new peer {peer}"));
        let chat = self.attach_chat(&conn);
        let who = Envelope::who(self.host.to_string(), self.advertised_port());
        if let Err(e) = chat.send(&who) {
            debug!("could not introduce ourselves to {peer}: {e}");
        }
        self.friends.lock().unwrap().insert(
            peer,
            Friend {
                name: peer.to_base58(),
                chat,
            },
        );
    }

    fn advertised_port(&self) -> u16 {
        self.listen_endpoint().map(|a| a.port()).unwrap_or(self.port)
    }

    fn peer_disconnected(&self, peer: PeerId) {
        self.known.lock().unwrap().remove(&peer);
        let removed = self.friends.lock().unwrap().remove(&peer);
        if let Some(friend) = removed {
            (self.output)(&format!("{} disconnected.", friend.name));
        }
    }

    fn inbound_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        (self.output)(&format!("Peer {} connected", conn.remote_peer()));
        self.attach_chat(&conn);
    }

    fn attach_chat(self: &Arc<Self>, conn: &Arc<Connection>) -> Arc<ChatHandler> {
        let weak = self.weak.clone();
        let on_envelope: crate::chat::OnEnvelope = Arc::new(move |peer, addr, envelope| {
            if let Some(node) = weak.upgrade() {
                node.message_received(peer, addr, envelope);
            }
        });
        let chat = ChatHandler::new(conn.remote_peer(), on_envelope, self.output.clone());
        conn.stream().attach(chat.clone());
        chat
    }

    /// Route one decoded envelope. `/who` carries the sender's advertised
    /// endpoint; its claimed host must match the address the unit actually
    /// came from, otherwise the introduction is dropped.
    fn message_received(self: &Arc<Self>, peer: PeerId, addr: SocketAddr, envelope: Envelope) {
        match envelope.action.as_str() {
            ACTION_WHO => {
                let (Some(ip), Some(port)) = (envelope.ip.as_deref(), envelope.port) else {
                    debug!("incomplete /who from {peer}");
                    return;
                };
                let claimed: Option<IpAddr> = ip.parse().ok();
                if claimed != Some(addr.ip()) {
                    (self.output)(&format!(
                        "Dropping /who from {peer}: claims {ip} but came from {}",
                        addr.ip()
                    ));
                    return;
                }
                let host = claimed.unwrap_or(addr.ip());
                let node = self.clone();
                tokio::spawn(async move {
                    node.add_candidate(peer, host, port).await;
                });
            }
            ACTION_TEXT => {
                let content = envelope.content.as_deref().unwrap_or_default();
                (self.output)(&format!("{peer} > {content}"));
            }
            other => debug!("ignoring unknown action {other:?} from {peer}"),
        }
    }

    /// Shut the node down: every listener and connection closes, remote
    /// peers see our close notifications and drop us from their state.
    pub async fn stop(&self) {
        info!("stopping node {}", self.peer_id);
        self.transports.close().await;
    }
}

/// Best-effort guess of this host's private network address: route a
/// connected UDP socket toward a non-local destination and read the local
/// address the OS picked. No packet is sent.
pub fn private_network_address() -> IpAddr {
    let fallback = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
    let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") else {
        return fallback;
    };
    if socket.connect("10.254.254.254:1").is_err() {
        return fallback;
    }
    match socket.local_addr() {
        Ok(addr) => addr.ip(),
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            listen_port: 0,
            listen_host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            dial_timeout_ms: 1_000,
        }
    }

    fn lines() -> (OnOutput, Arc<Mutex<Vec<String>>>) {
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let output: OnOutput = Arc::new(move |line: &str| sink.lock().unwrap().push(line.into()));
        (output, lines)
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

    async fn start(id: &str) -> (Arc<ChatNode>, Arc<Mutex<Vec<String>>>) {
        let (output, lines) = lines();
        let node = ChatNode::start(id, &test_config(), output).await.unwrap();
        (node, lines)
    }

    fn endpoint(node: &ChatNode) -> (IpAddr, u16) {
        let addr = node.listen_endpoint().unwrap();
        (addr.host(), addr.port())
    }

    fn is_friend(node: &ChatNode, peer: PeerId) -> bool {
        node.friends.lock().unwrap().contains_key(&peer)
    }

    #[tokio::test]
    async fn who_handshake_links_both_nodes() {
        let (a, _) = start("alice").await;
        let (b, _) = start("bob").await;
        let (host, port) = endpoint(&b);

        a.add_peer(host, port, b.peer_id()).await;

        let (a2, b2) = (a.clone(), b.clone());
        wait_for("mutual friendship", move || {
            is_friend(&a2, b2.peer_id()) && is_friend(&b2, a2.peer_id())
        })
        .await;
    }

    #[tokio::test]
    async fn text_reaches_the_other_side() {
        let (a, _) = start("sender").await;
        let (b, b_lines) = start("receiver").await;
        let (host, port) = endpoint(&b);

        a.add_peer(host, port, b.peer_id()).await;
        let (a2, b2) = (a.clone(), b.clone());
        wait_for("mutual friendship", move || {
            is_friend(&a2, b2.peer_id()) && is_friend(&b2, a2.peer_id())
        })
        .await;

        a.send("hello over there");
        let expected = format!("{} > hello over there", a.peer_id());
        let sink = b_lines.clone();
        wait_for("text delivery", move || {
            sink.lock().unwrap().iter().any(|l| l == &expected)
        })
        .await;
    }

    #[tokio::test]
    async fn duplicate_discovery_yields_one_session() {
        let (a, _) = start("eager").await;
        let (b, _) = start("popular").await;
        let (host, port) = endpoint(&b);
        let peer = b.peer_id();

        tokio::join!(a.add_peer(host, port, peer), a.add_peer(host, port, peer));
        let (a2, b2) = (a.clone(), b.clone());
        wait_for("mutual friendship", move || {
            is_friend(&a2, b2.peer_id()) && is_friend(&b2, a2.peer_id())
        })
        .await;

        assert_eq!(a.friends.lock().unwrap().len(), 1);
        assert_eq!(b.friends.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remote_shutdown_cleans_up_local_state() {
        let (a, a_lines) = start("stayer").await;
        let (b, _) = start("leaver").await;
        let (host, port) = endpoint(&b);

        a.add_peer(host, port, b.peer_id()).await;
        let (a2, b2) = (a.clone(), b.clone());
        wait_for("mutual friendship", move || {
            is_friend(&a2, b2.peer_id()) && is_friend(&b2, a2.peer_id())
        })
        .await;

        b.stop().await;
        let a2 = a.clone();
        let peer = b.peer_id();
        wait_for("friend removal", move || !is_friend(&a2, peer)).await;
        assert!(!a.known.lock().unwrap().contains(&peer));
        let sink = a_lines.clone();
        let expected = format!("{} disconnected.", peer.to_base58());
        wait_for("disconnect line", move || {
            sink.lock().unwrap().iter().any(|l| l == &expected)
        })
        .await;
    }

    #[tokio::test]
    async fn own_identity_is_never_dialed() {
        let (a, _) = start("narcissus").await;
        let (host, port) = endpoint(&a);

        a.add_peer(host, port, a.peer_id()).await;

        assert!(a.known.lock().unwrap().is_empty());
        assert!(a.friends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_dial_releases_the_reservation() {
        let (output, lines) = lines();
        let config = Config {
            dial_timeout_ms: 200,
            ..test_config()
        };
        let a = ChatNode::start("hopeful", &config, output).await.unwrap();
        let ghost = Keypair::from_external_id("ghost").unwrap().peer_id();
        // nothing listens here
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        a.add_peer(IpAddr::V4(Ipv4Addr::LOCALHOST), port, ghost).await;

        assert!(!a.known.lock().unwrap().contains(&ghost));
        assert!(lines
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("Could not connect to")));
    }

    #[tokio::test]
    async fn who_with_spoofed_source_is_dropped() {
        let (a, a_lines) = start("suspicious").await;
        let liar = Keypair::from_external_id("liar").unwrap().peer_id();
        let from: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        a.message_received(liar, from, Envelope::who("198.51.100.7", 4009));

        assert!(a_lines
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("Dropping /who")));
        assert!(a.known.lock().unwrap().is_empty());
    }
}
