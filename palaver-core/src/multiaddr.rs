//! Endpoint addresses in the canonical textual form
//! `/ip4/<host>/<transport>/<port>[/p2p/<peerid>]`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::identity::PeerId;

/// Transport protocol tag inside an address. Transports declare which
/// tags they handle; only UDP is implemented today.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    fn as_str(self) -> &'static str {
        match self {
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
        }
    }
}

/// Structured endpoint: address family, host, transport tag, port, and an
/// optional trailing peer ID. Immutable once built.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Multiaddr {
    host: IpAddr,
    proto: Proto,
    port: u16,
    peer: Option<PeerId>,
}

impl Multiaddr {
    pub fn new(host: IpAddr, proto: Proto, port: u16) -> Self {
        Self {
            host,
            proto,
            port,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn from_socket_addr(addr: SocketAddr, proto: Proto) -> Self {
        Self::new(addr.ip(), proto, addr.port())
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.host {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        write!(
            f,
            "/{family}/{}/{}/{}",
            self.host,
            self.proto.as_str(),
            self.port
        )?;
        if let Some(peer) = self.peer {
            write!(f, "/p2p/{peer}")?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        if parts.next() != Some("") {
            return Err(MultiaddrError::MissingLeadingSlash);
        }
        let family = parts.next().ok_or(MultiaddrError::MissingHost)?;
        let host_str = parts.next().ok_or(MultiaddrError::MissingHost)?;
        let host = match family {
            "ip4" => IpAddr::V4(
                host_str
                    .parse()
                    .map_err(|_| MultiaddrError::BadHost(host_str.to_string()))?,
            ),
            "ip6" => IpAddr::V6(
                host_str
                    .parse()
                    .map_err(|_| MultiaddrError::BadHost(host_str.to_string()))?,
            ),
            other => return Err(MultiaddrError::UnknownFamily(other.to_string())),
        };
        let proto = match parts.next().ok_or(MultiaddrError::MissingPort)? {
            "udp" => Proto::Udp,
            "tcp" => Proto::Tcp,
            other => return Err(MultiaddrError::UnknownProto(other.to_string())),
        };
        let port_str = parts.next().ok_or(MultiaddrError::MissingPort)?;
        let port = port_str
            .parse::<u16>()
            .map_err(|_| MultiaddrError::BadPort(port_str.to_string()))?;
        let peer = match parts.next() {
            None => None,
            Some("p2p") => {
                let id = parts.next().ok_or(MultiaddrError::MissingPeerId)?;
                Some(
                    id.parse::<PeerId>()
                        .map_err(|_| MultiaddrError::BadPeerId(id.to_string()))?,
                )
            }
            Some(other) => return Err(MultiaddrError::UnknownSegment(other.to_string())),
        };
        if parts.next().is_some() {
            return Err(MultiaddrError::TrailingSegments);
        }
        Ok(Multiaddr {
            host,
            proto,
            port,
            peer,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MultiaddrError {
    #[error("address must start with '/'")]
    MissingLeadingSlash,
    #[error("missing host component")]
    MissingHost,
    #[error("missing port component")]
    MissingPort,
    #[error("missing peer id after /p2p")]
    MissingPeerId,
    #[error("bad host: {0}")]
    BadHost(String),
    #[error("bad port: {0}")]
    BadPort(String),
    #[error("bad peer id: {0}")]
    BadPeerId(String),
    #[error("unknown address family: {0}")]
    UnknownFamily(String),
    #[error("unknown transport protocol: {0}")]
    UnknownProto(String),
    #[error("unknown address segment: {0}")]
    UnknownSegment(String),
    #[error("trailing address segments")]
    TrailingSegments,
}
