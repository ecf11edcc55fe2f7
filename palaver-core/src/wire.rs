//! Datagram framing: 4-byte magic + tag byte + payload, one frame per
//! datagram. Hello frames carry the connection-upgrade identity exchange.

/// Current handshake protocol version. Mismatched hellos are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload carried by a single data frame.
pub const MAX_PAYLOAD_LEN: usize = 60 * 1024;

const MAGIC: &[u8; 4] = b"PLVR";
const TAG_HELLO: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_CLOSE: u8 = 3;

const HELLO_BODY_LEN: usize = 1 + 32; // version + public key

/// One transport-level datagram. `Hello` upgrades a raw socket pairing
/// into a connection; `Data` carries exactly one protocol message;
/// `Close` tears the virtual connection down.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Hello { version: u8, public_key: [u8; 32] },
    Data(Vec<u8>),
    Close,
}

/// Encode a frame into a single datagram payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(MAGIC.len() + 1 + HELLO_BODY_LEN);
    out.extend_from_slice(MAGIC);
    match frame {
        Frame::Hello {
            version,
            public_key,
        } => {
            out.push(TAG_HELLO);
            out.push(*version);
            out.extend_from_slice(public_key);
        }
        Frame::Data(payload) => {
            if payload.len() > MAX_PAYLOAD_LEN {
                return Err(FrameError::TooLarge);
            }
            out.push(TAG_DATA);
            out.extend_from_slice(payload);
        }
        Frame::Close => out.push(TAG_CLOSE),
    }
    Ok(out)
}

/// Decode one datagram. Datagrams without the magic are stray traffic and
/// rejected without further inspection.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < MAGIC.len() + 1 {
        return Err(FrameError::TooShort);
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(FrameError::BadMagic);
    }
    let tag = bytes[MAGIC.len()];
    let body = &bytes[MAGIC.len() + 1..];
    match tag {
        TAG_HELLO => {
            if body.len() != HELLO_BODY_LEN {
                return Err(FrameError::BadHello);
            }
            let mut public_key = [0u8; 32];
            public_key.copy_from_slice(&body[1..]);
            Ok(Frame::Hello {
                version: body[0],
                public_key,
            })
        }
        TAG_DATA => {
            if body.len() > MAX_PAYLOAD_LEN {
                return Err(FrameError::TooLarge);
            }
            Ok(Frame::Data(body.to_vec()))
        }
        TAG_CLOSE => Ok(Frame::Close),
        other => Err(FrameError::UnknownTag(other)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("datagram too short")]
    TooShort,
    #[error("payload too large")]
    TooLarge,
    #[error("bad frame magic")]
    BadMagic,
    #[error("bad hello body")]
    BadHello,
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn hello_roundtrip() {
        let kp = Keypair::from_external_id("wire-test").unwrap();
        let frame = Frame::Hello {
            version: PROTOCOL_VERSION,
            public_key: kp.public_key_bytes(),
        };
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn data_roundtrip() {
        let frame = Frame::Data(b"{\"action\":\"text_msg\"}".to_vec());
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn close_roundtrip() {
        let bytes = encode_frame(&Frame::Close).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), Frame::Close);
    }

    #[test]
    fn stray_datagrams_rejected() {
        assert!(matches!(decode_frame(b"PLV"), Err(FrameError::TooShort)));
        assert!(matches!(
            decode_frame(b"XXXX\x02hello"),
            Err(FrameError::BadMagic)
        ));
        assert!(matches!(
            decode_frame(b"PLVR\x09"),
            Err(FrameError::UnknownTag(9))
        ));
        assert!(matches!(
            decode_frame(b"PLVR\x01short"),
            Err(FrameError::BadHello)
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::Data(vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(encode_frame(&frame), Err(FrameError::TooLarge)));
    }
}
