//! Virtual connections and streams over a datagram socket. A connection
//! is one socket pairing with a remote; it owns exactly one upgraded
//! duplex stream, and its close hooks fire exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use palaver_core::wire::{encode_frame, Frame};
use palaver_core::{FrameError, PeerId};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Attached once per stream. Receives activation, each complete inbound
/// unit, and closure. Invoked from worker tasks; implementations must be
/// thread-safe.
pub trait StreamHandler: Send + Sync {
    fn on_activated(&self, stream: Arc<Stream>);
    fn on_message(&self, bytes: &[u8]);
    fn on_closed(&self);
}

pub type CloseHook = Box<dyn FnOnce() + Send>;

pub(crate) enum WriteCmd {
    Frame(Vec<u8>),
    /// Final frame (if any), then the writer task terminates.
    Shutdown(Option<Vec<u8>>),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Duplex byte channel layered on a connection. Writes are FIFO through
/// the connection's writer task; inbound units arriving before a handler
/// attaches are buffered and replayed in order.
pub struct Stream {
    remote: SocketAddr,
    remote_peer: PeerId,
    out_tx: mpsc::UnboundedSender<WriteCmd>,
    closed: Arc<AtomicBool>,
    state: Mutex<StreamState>,
}

struct StreamState {
    handler: Option<Arc<dyn StreamHandler>>,
    pending: Vec<Vec<u8>>,
}

impl Stream {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Enqueue one message unit onto the write path. Non-blocking; fails
    /// once the connection is closed.
    pub fn write(&self, payload: &[u8]) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let frame = encode_frame(&Frame::Data(payload.to_vec()))?;
        self.out_tx
            .send(WriteCmd::Frame(frame))
            .map_err(|_| StreamError::Closed)
    }

    /// Attach the one handler for this stream. Activation fires first,
    /// then any buffered units, in arrival order.
    pub fn attach(self: &Arc<Self>, handler: Arc<dyn StreamHandler>) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.handler = Some(handler.clone());
            std::mem::take(&mut state.pending)
        };
        handler.on_activated(self.clone());
        for unit in pending {
            handler.on_message(&unit);
        }
    }

    pub(crate) fn deliver(&self, bytes: &[u8]) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            match &state.handler {
                Some(handler) => Some(handler.clone()),
                None => {
                    state.pending.push(bytes.to_vec());
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler.on_message(bytes);
        }
    }

    fn notify_closed(&self) {
        let handler = self.state.lock().unwrap().handler.clone();
        if let Some(handler) = handler {
            handler.on_closed();
        }
    }
}

/// One underlying socket pairing with a remote address, upgraded with the
/// remote's identity. Exclusively owned by the transport that created it
/// until closed.
pub struct Connection {
    remote: SocketAddr,
    remote_peer: PeerId,
    stream: Arc<Stream>,
    out_tx: mpsc::UnboundedSender<WriteCmd>,
    closed: Arc<AtomicBool>,
    hooks: Mutex<Vec<CloseHook>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        remote_peer: PeerId,
    ) -> Arc<Self> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WriteCmd>();
        let closed = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match cmd {
                    WriteCmd::Frame(frame) => {
                        if socket.send_to(&frame, remote).await.is_err() {
                            break;
                        }
                    }
                    WriteCmd::Shutdown(frame) => {
                        if let Some(frame) = frame {
                            let _ = socket.send_to(&frame, remote).await;
                        }
                        break;
                    }
                }
            }
        });
        let stream = Arc::new(Stream {
            remote,
            remote_peer,
            out_tx: out_tx.clone(),
            closed: closed.clone(),
            state: Mutex::new(StreamState {
                handler: None,
                pending: Vec::new(),
            }),
        });
        Arc::new(Self {
            remote,
            remote_peer,
            stream,
            out_tx,
            closed,
            hooks: Mutex::new(Vec::new()),
            recv_task: Mutex::new(None),
            writer_task: Mutex::new(Some(writer)),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn stream(&self) -> Arc<Stream> {
        self.stream.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a hook that fires exactly once when this connection
    /// closes, whether locally or by the remote. Fires immediately if the
    /// connection is already closed.
    pub fn on_close(&self, hook: CloseHook) {
        let mut hooks = self.hooks.lock().unwrap();
        if self.closed.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
        } else {
            hooks.push(hook);
        }
    }

    pub(crate) fn set_recv_task(&self, task: JoinHandle<()>) {
        *self.recv_task.lock().unwrap() = Some(task);
    }

    /// Close locally: notify the remote, fire close hooks, stop tasks.
    pub fn close(&self) {
        self.shutdown(true);
    }

    /// The remote closed or vanished; tear down without notifying it.
    pub(crate) fn close_remote(&self) {
        self.shutdown(false);
    }

    fn shutdown(&self, notify_remote: bool) {
        let hooks = {
            let mut hooks = self.hooks.lock().unwrap();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        let final_frame = if notify_remote {
            encode_frame(&Frame::Close).ok()
        } else {
            None
        };
        let _ = self.out_tx.send(WriteCmd::Shutdown(final_frame));
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
        self.stream.notify_closed();
        for hook in hooks {
            hook();
        }
    }

    /// Wait for the writer task to drain; prior writes (and the close
    /// frame, if any) are flushed or abandoned by then.
    pub(crate) async fn drained(&self) {
        let task = { self.writer_task.lock().unwrap().take() };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
