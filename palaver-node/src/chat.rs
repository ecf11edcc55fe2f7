//! Chat protocol handler: one per connection, decoding envelope units off
//! the stream and routing them upward. The handler tracks its own stream
//! lifecycle so sends fail cleanly before activation and after close.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use palaver_core::{decode_envelope, encode_envelope, Envelope, EnvelopeError, PeerId};
use tracing::debug;

use crate::conn::{Stream, StreamError, StreamHandler};

/// Called for every well-formed envelope, with the identity and socket
/// address the unit arrived from.
pub type OnEnvelope = Arc<dyn Fn(PeerId, SocketAddr, Envelope) + Send + Sync>;

/// Sink for user-facing lines.
pub type OnOutput = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat session is not active yet")]
    NotReady,
    #[error("chat session is closed")]
    Closed,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

enum SessionState {
    Opening,
    Active(Arc<Stream>),
    Closed,
}

pub struct ChatHandler {
    remote: PeerId,
    state: Mutex<SessionState>,
    on_envelope: OnEnvelope,
    output: OnOutput,
}

impl ChatHandler {
    pub fn new(remote: PeerId, on_envelope: OnEnvelope, output: OnOutput) -> Arc<Self> {
        Arc::new(Self {
            remote,
            state: Mutex::new(SessionState::Opening),
            on_envelope,
            output,
        })
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    /// Encode `envelope` as one unit and write it to the session's stream.
    pub fn send(&self, envelope: &Envelope) -> Result<(), ChatError> {
        let stream = {
            let state = self.state.lock().unwrap();
            match &*state {
                SessionState::Opening => return Err(ChatError::NotReady),
                SessionState::Closed => return Err(ChatError::Closed),
                SessionState::Active(stream) => stream.clone(),
            }
        };
        let bytes = encode_envelope(envelope)?;
        stream.write(&bytes)?;
        Ok(())
    }
}

impl StreamHandler for ChatHandler {
    fn on_activated(&self, stream: Arc<Stream>) {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, SessionState::Opening) {
            *state = SessionState::Active(stream);
        }
    }

    fn on_message(&self, bytes: &[u8]) {
        let addr = {
            let state = self.state.lock().unwrap();
            match &*state {
                SessionState::Active(stream) => stream.remote_addr(),
                _ => {
                    debug!("discarding unit for inactive session with {}", self.remote);
                    return;
                }
            }
        };
        match decode_envelope(bytes) {
            Ok(envelope) => (self.on_envelope)(self.remote, addr, envelope),
            Err(e) => {
                // report and keep the session alive for later units
                (self.output)(&format!("Ignoring malformed message from {}: {e}", self.remote));
            }
        }
    }

    fn on_closed(&self) {
        *self.state.lock().unwrap() = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use palaver_core::{Keypair, ACTION_TEXT};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket;

    fn peer(id: &str) -> PeerId {
        Keypair::from_external_id(id).unwrap().peer_id()
    }

    fn lines() -> (OnOutput, Arc<Mutex<Vec<String>>>) {
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let output: OnOutput = Arc::new(move |line: &str| sink.lock().unwrap().push(line.into()));
        (output, lines)
    }

    fn envelopes() -> (OnEnvelope, Arc<Mutex<Vec<Envelope>>>) {
        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let on_envelope: OnEnvelope =
            Arc::new(move |_, _, envelope| sink.lock().unwrap().push(envelope));
        (on_envelope, seen)
    }

    async fn loopback_connection(remote: PeerId) -> Arc<Connection> {
        let socket = UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let remote_addr = socket.local_addr().unwrap();
        Connection::new(Arc::new(socket), remote_addr, remote)
    }

    #[tokio::test]
    async fn send_fails_until_the_stream_is_activated() {
        let (output, _) = lines();
        let (on_envelope, _) = envelopes();
        let handler = ChatHandler::new(peer("early"), on_envelope, output);

        let err = handler.send(&Envelope::text("too soon")).unwrap_err();
        assert!(matches!(err, ChatError::NotReady));

        let conn = loopback_connection(peer("early")).await;
        conn.stream().attach(handler.clone());
        handler.send(&Envelope::text("now it works")).unwrap();
    }

    #[tokio::test]
    async fn send_fails_after_close() {
        let (output, _) = lines();
        let (on_envelope, _) = envelopes();
        let handler = ChatHandler::new(peer("gone"), on_envelope, output);
        let conn = loopback_connection(peer("gone")).await;
        conn.stream().attach(handler.clone());
        conn.close();

        let err = handler.send(&Envelope::text("anyone there")).unwrap_err();
        assert!(matches!(err, ChatError::Closed));
    }

    #[tokio::test]
    async fn malformed_unit_is_reported_and_later_units_still_arrive() {
        let (output, lines) = lines();
        let (on_envelope, seen) = envelopes();
        let handler = ChatHandler::new(peer("noisy"), on_envelope, output);
        let conn = loopback_connection(peer("noisy")).await;
        conn.stream().attach(handler.clone());

        conn.stream().deliver(b"{not json");
        conn.stream()
            .deliver(&encode_envelope(&Envelope::text("still here")).unwrap());

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Ignoring malformed message"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].action, ACTION_TEXT);
        assert_eq!(seen[0].content.as_deref(), Some("still here"));
    }
}
