//! Palaver protocol core: identity derivation, network addresses, the chat
//! envelope and the datagram frame codec.
//! Sans-I/O: the node crate supplies sockets and scheduling.

pub mod envelope;
pub mod identity;
pub mod multiaddr;
pub mod wire;

pub use envelope::{decode_envelope, encode_envelope, Envelope, EnvelopeError, ACTION_TEXT, ACTION_WHO};
pub use identity::{IdentityError, Keypair, PeerId};
pub use multiaddr::{Multiaddr, MultiaddrError, Proto};
pub use wire::{decode_frame, encode_frame, Frame, FrameError, PROTOCOL_VERSION};
