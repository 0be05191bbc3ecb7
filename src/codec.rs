//! Wire codec for the bilateral peer transport.
//!
//! Frames are length-prefixed binary:
//!
//! ```text
//! | u32 length (network order) | u8 type | body |
//! ```
//!
//! where `length` counts the type byte plus the body. Strings are encoded as
//! `u16 length + bytes` (`utf8-lp`), opaque payloads as `u32 length + bytes`
//! (`bytes-lp`); all integers are network order. `Fulfill` and `Reject`
//! carry the condition of the `Prepare` they answer so that multiple
//! in-flight packets on one peer session can be correlated.
//!
//! Unknown type codes and malformed bodies are protocol violations and close
//! the session.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{Address, AddressError};
use crate::condition::{Condition, Fulfillment};
use crate::timestamp::UnixMillis;

/// Upper bound on the opaque payload carried by a packet.
pub const MAX_PAYLOAD_LEN: usize = 65536;
/// Upper bound on a reject message.
pub const MAX_MESSAGE_LEN: usize = 256;
/// Upper bound on a whole frame (type byte + body). Worst case is a Prepare
/// with a maximal destination and payload, with headroom.
pub const MAX_FRAME_LEN: usize = 80 * 1024;

const TYPE_HELLO: u8 = 0x01;
const TYPE_HELLO_ACK: u8 = 0x02;
const TYPE_PREPARE: u8 = 0x10;
const TYPE_FULFILL: u8 = 0x11;
const TYPE_REJECT: u8 = 0x12;
const TYPE_HEARTBEAT: u8 = 0x20;

/// A conditional transfer: deliver `payload` toward `destination`, promising
/// `amount` if a matching fulfillment comes back before `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparePacket {
    pub amount: u64,
    pub expires_at: UnixMillis,
    pub condition: Condition,
    pub destination: Address,
    pub payload: Vec<u8>,
}

/// Successful terminal response carrying the condition preimage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillPacket {
    pub fulfillment: Fulfillment,
    pub payload: Vec<u8>,
}

/// Failed terminal response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectPacket {
    pub code: ErrorCode,
    pub message: String,
    pub payload: Vec<u8>,
}

/// The closed set of frames on a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello {
        node_id: String,
        auth_token: String,
        heartbeat_secs: u16,
    },
    HelloAck {
        node_id: String,
        heartbeat_secs: u16,
    },
    Prepare(PreparePacket),
    Fulfill {
        condition: Condition,
        packet: FulfillPacket,
    },
    Reject {
        condition: Condition,
        packet: RejectPacket,
    },
    Heartbeat,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame length {0} outside accepted bounds")]
    FrameLength(usize),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("frame body truncated")]
    Truncated,
    #[error("frame body has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("payload exceeds {MAX_PAYLOAD_LEN} bytes ({0})")]
    PayloadTooLarge(usize),
    #[error("reject message exceeds {MAX_MESSAGE_LEN} bytes ({0})")]
    MessageTooLarge(usize),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid destination address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("invalid error code: {0}")]
    InvalidErrorCode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes32(&mut self) -> Result<[u8; 32], CodecError> {
        Ok(self.take(32)?.try_into().unwrap())
    }

    fn utf8_lp(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn bytes_lp(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(len));
        }
        Ok(self.take(len)?.to_vec())
    }

    fn finish(self) -> Result<(), CodecError> {
        let rest = self.buf.len() - self.pos;
        if rest != 0 {
            return Err(CodecError::TrailingBytes(rest));
        }
        Ok(())
    }
}

fn put_utf8_lp(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_bytes_lp(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_be_bytes());
    out.extend_from_slice(b);
}

impl Frame {
    /// Serialize including the leading `u32` length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        let frame_type = match self {
            Frame::Hello {
                node_id,
                auth_token,
                heartbeat_secs,
            } => {
                put_utf8_lp(&mut body, node_id);
                put_utf8_lp(&mut body, auth_token);
                body.extend_from_slice(&heartbeat_secs.to_be_bytes());
                TYPE_HELLO
            }
            Frame::HelloAck {
                node_id,
                heartbeat_secs,
            } => {
                put_utf8_lp(&mut body, node_id);
                body.extend_from_slice(&heartbeat_secs.to_be_bytes());
                TYPE_HELLO_ACK
            }
            Frame::Prepare(p) => {
                body.extend_from_slice(&p.amount.to_be_bytes());
                body.extend_from_slice(&p.expires_at.as_millis().to_be_bytes());
                body.extend_from_slice(p.condition.as_bytes());
                put_utf8_lp(&mut body, p.destination.as_str());
                put_bytes_lp(&mut body, &p.payload);
                TYPE_PREPARE
            }
            Frame::Fulfill { condition, packet } => {
                body.extend_from_slice(condition.as_bytes());
                body.extend_from_slice(packet.fulfillment.as_bytes());
                put_bytes_lp(&mut body, &packet.payload);
                TYPE_FULFILL
            }
            Frame::Reject { condition, packet } => {
                body.extend_from_slice(condition.as_bytes());
                body.extend_from_slice(packet.code.as_bytes());
                put_utf8_lp(&mut body, &packet.message);
                put_bytes_lp(&mut body, &packet.payload);
                TYPE_REJECT
            }
            Frame::Heartbeat => TYPE_HEARTBEAT,
        };
        let mut out = Vec::with_capacity(body.len() + 5);
        out.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
        out.push(frame_type);
        out.extend_from_slice(&body);
        out
    }

    /// Parse a frame from its content (type byte + body, after the length
    /// prefix has been consumed).
    pub fn decode(content: &[u8]) -> Result<Frame, CodecError> {
        let mut r = Reader::new(content);
        let frame_type = r.u8()?;
        let frame = match frame_type {
            TYPE_HELLO => Frame::Hello {
                node_id: r.utf8_lp()?,
                auth_token: r.utf8_lp()?,
                heartbeat_secs: r.u16()?,
            },
            TYPE_HELLO_ACK => Frame::HelloAck {
                node_id: r.utf8_lp()?,
                heartbeat_secs: r.u16()?,
            },
            TYPE_PREPARE => {
                let amount = r.u64()?;
                let expires_at = UnixMillis(r.i64()?);
                let condition = Condition(r.bytes32()?);
                let destination: Address = r.utf8_lp()?.parse()?;
                let payload = r.bytes_lp()?;
                Frame::Prepare(PreparePacket {
                    amount,
                    expires_at,
                    condition,
                    destination,
                    payload,
                })
            }
            TYPE_FULFILL => Frame::Fulfill {
                condition: Condition(r.bytes32()?),
                packet: FulfillPacket {
                    fulfillment: Fulfillment(r.bytes32()?),
                    payload: r.bytes_lp()?,
                },
            },
            TYPE_REJECT => {
                let condition = Condition(r.bytes32()?);
                let code = ErrorCode::from_bytes(r.take(3)?.try_into().unwrap())?;
                let message = r.utf8_lp()?;
                if message.len() > MAX_MESSAGE_LEN {
                    return Err(CodecError::MessageTooLarge(message.len()));
                }
                Frame::Reject {
                    condition,
                    packet: RejectPacket {
                        code,
                        message,
                        payload: r.bytes_lp()?,
                    },
                }
            }
            TYPE_HEARTBEAT => Frame::Heartbeat,
            other => return Err(CodecError::UnknownFrameType(other)),
        };
        r.finish()?;
        Ok(frame)
    }
}

/// Read one length-prefixed frame from a stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, CodecError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(CodecError::FrameLength(len));
    }
    let mut content = vec![0u8; len];
    r.read_exact(&mut content).await?;
    Frame::decode(&content)
}

/// Write one frame to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), CodecError> {
    w.write_all(&frame.encode()).await?;
    Ok(())
}

// ============================================================================
// Error code registry
// ============================================================================

/// Coarse class of an error code, from its first character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// `F`: final, retrying the same packet cannot succeed.
    Final,
    /// `R`: relative to the packet's expiry.
    Expiry,
    /// `T`: transient, retry may succeed.
    Transient,
}

/// Three-character ASCII code carried by `Reject` packets.
///
/// Codes originated by this node come from the associated constants below;
/// codes relayed from downstream pass through unchanged, so arbitrary ASCII
/// triples decode as long as they are printable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode([u8; 3]);

impl ErrorCode {
    /// Generic final reject.
    pub const GENERIC: ErrorCode = ErrorCode(*b"F00");
    /// No routing table entry matched the destination.
    pub const NO_ROUTE: ErrorCode = ErrorCode(*b"F02");
    /// The channel toward the next hop cannot carry the amount.
    pub const INSUFFICIENT_CAPACITY: ErrorCode = ErrorCode(*b"F04");
    /// Presented fulfillment does not hash to the condition.
    pub const CONDITION_MISMATCH: ErrorCode = ErrorCode(*b"F05");
    /// The local handler rejected with a code outside the registry.
    pub const HANDLER_REJECTED: ErrorCode = ErrorCode(*b"F99");
    /// The packet was already expired when received.
    pub const EXPIRED: ErrorCode = ErrorCode(*b"R00");
    /// No downstream response before the packet's expiry.
    pub const DOWNSTREAM_TIMEOUT: ErrorCode = ErrorCode(*b"R01");
    /// Internal error while processing the packet.
    pub const INTERNAL: ErrorCode = ErrorCode(*b"T00");
    /// The downstream session closed before a response arrived.
    pub const PEER_DISCONNECTED: ErrorCode = ErrorCode(*b"T01");
    /// The node is shutting down and not accepting packets.
    pub const SHUTTING_DOWN: ErrorCode = ErrorCode(*b"T02");
    /// The local handler signalled resource exhaustion.
    pub const HANDLER_EXHAUSTED: ErrorCode = ErrorCode(*b"T03");

    pub fn from_bytes(bytes: [u8; 3]) -> Result<Self, CodecError> {
        if !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(CodecError::InvalidErrorCode(format!("{bytes:?}")));
        }
        Ok(ErrorCode(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Constructed from ASCII only.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    pub fn class(&self) -> ErrorClass {
        match self.0[0] {
            b'R' => ErrorClass::Expiry,
            b'T' => ErrorClass::Transient,
            _ => ErrorClass::Final,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient) || *self == ErrorCode::DOWNSTREAM_TIMEOUT
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes: [u8; 3] = s
            .as_bytes()
            .try_into()
            .map_err(|_| serde::de::Error::custom("error code must be 3 ASCII characters"))?;
        ErrorCode::from_bytes(bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let wire = frame.encode();
        let len = u32::from_be_bytes(wire[..4].try_into().unwrap()) as usize;
        assert_eq!(len, wire.len() - 4);
        let back = Frame::decode(&wire[4..]).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_roundtrip_hello() {
        roundtrip(Frame::Hello {
            node_id: "node-a".into(),
            auth_token: "s3cret".into(),
            heartbeat_secs: 10,
        });
        roundtrip(Frame::HelloAck {
            node_id: "node-b".into(),
            heartbeat_secs: 15,
        });
    }

    #[test]
    fn test_roundtrip_prepare() {
        roundtrip(Frame::Prepare(PreparePacket {
            amount: 100,
            expires_at: UnixMillis(1_700_000_000_000),
            condition: Condition::from_payload(b"hello"),
            destination: "g.dest.sub".parse().unwrap(),
            payload: b"hello".to_vec(),
        }));
    }

    #[test]
    fn test_roundtrip_fulfill_reject_heartbeat() {
        let condition = Condition::from_payload(b"hello");
        roundtrip(Frame::Fulfill {
            condition,
            packet: FulfillPacket {
                fulfillment: Fulfillment::from_payload(b"hello"),
                payload: vec![],
            },
        });
        roundtrip(Frame::Reject {
            condition,
            packet: RejectPacket {
                code: ErrorCode::NO_ROUTE,
                message: "no route".into(),
                payload: vec![1, 2, 3],
            },
        });
        roundtrip(Frame::Heartbeat);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Frame::decode(&[0x7f]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownFrameType(0x7f)));
    }

    #[test]
    fn test_truncated_rejected() {
        let wire = Frame::Heartbeat.encode();
        assert!(matches!(
            Frame::decode(&wire[4..wire.len() - 1]),
            Err(CodecError::Truncated) | Err(CodecError::TrailingBytes(_))
        ));
        let prepare = Frame::Prepare(PreparePacket {
            amount: 1,
            expires_at: UnixMillis(0),
            condition: Condition([0; 32]),
            destination: "g.x".parse().unwrap(),
            payload: vec![9; 16],
        })
        .encode();
        assert!(Frame::decode(&prepare[4..prepare.len() - 3]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut wire = Frame::Heartbeat.encode();
        wire.push(0xaa);
        assert!(matches!(
            Frame::decode(&wire[4..]),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_payload_cap_enforced() {
        // An honestly-encoded oversized payload is refused on decode.
        let mut body = Vec::new();
        body.push(super::TYPE_FULFILL);
        body.extend_from_slice(&[0u8; 64]);
        body.extend_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_be_bytes());
        body.extend_from_slice(&vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            Frame::decode(&body),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_malformed_destination_rejected() {
        let mut body = Vec::new();
        body.push(super::TYPE_PREPARE);
        body.extend_from_slice(&1u64.to_be_bytes());
        body.extend_from_slice(&0i64.to_be_bytes());
        body.extend_from_slice(&[0u8; 32]);
        put_utf8_lp(&mut body, "Bad.Address");
        put_bytes_lp(&mut body, b"");
        assert!(matches!(
            Frame::decode(&body),
            Err(CodecError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_error_code_classes() {
        assert_eq!(ErrorCode::NO_ROUTE.class(), ErrorClass::Final);
        assert_eq!(ErrorCode::EXPIRED.class(), ErrorClass::Expiry);
        assert_eq!(ErrorCode::SHUTTING_DOWN.class(), ErrorClass::Transient);
        assert!(ErrorCode::DOWNSTREAM_TIMEOUT.is_retryable());
        assert!(!ErrorCode::CONDITION_MISMATCH.is_retryable());
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let frame = Frame::Prepare(PreparePacket {
            amount: 42,
            expires_at: UnixMillis(9_999),
            condition: Condition::from_payload(b"p"),
            destination: "g.a.b".parse().unwrap(),
            payload: b"p".to_vec(),
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(back, frame);
    }
}
