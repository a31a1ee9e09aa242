//! RFC 6455 frame codec.
//!
//! # Responsibilities
//! - Encode server frames (never masked)
//! - Pull-decode client frames from any async reader
//! - Reject oversized frames before touching the payload
//!
//! # Wire Layout
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key (0 or 4 bytes)     |       Payload data ...   |
//! +------------------------------------+--------------------------+
//! ```
//!
//! # Design Decisions
//! - Stateless: fragments are surfaced one frame at a time, never reassembled
//! - Length is checked against the limit before any allocation
//! - Typed errors instead of panics on untrusted input

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Wire value of this opcode.
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Control frames are close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Short label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Continuation => "continuation",
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Close => "close",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolViolation;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolViolation::UnknownOpcode(other)),
        }
    }
}

/// A single decoded frame. `payload` is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload: Bytes,
}

/// Ways a peer can break the framing rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("64-bit payload length has its most significant bit set")]
    MalformedLength,

    #[error("control frame carries {0} bytes, limit is 125")]
    ControlFrameTooLong(u64),

    #[error("control frame is fragmented")]
    FragmentedControlFrame,

    #[error("stream ended inside a frame")]
    Truncated,

    #[error("text frame is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolViolation {
    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolViolation::ReservedBits => "reserved_bits",
            ProtocolViolation::UnknownOpcode(_) => "unknown_opcode",
            ProtocolViolation::MalformedLength => "malformed_length",
            ProtocolViolation::ControlFrameTooLong(_) => "control_too_long",
            ProtocolViolation::FragmentedControlFrame => "fragmented_control",
            ProtocolViolation::Truncated => "truncated",
            ProtocolViolation::InvalidUtf8 => "invalid_utf8",
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared payload length exceeds the endpoint limit.
    #[error("frame declares {len} bytes, limit is {max}")]
    TooLarge { len: u64, max: usize },

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a server frame. The mask bit is never set.
pub fn encode(opcode: Opcode, fin: bool, payload: &[u8]) -> Bytes {
    let len = payload.len();
    let mut buf = BytesMut::with_capacity(len + 10);

    let first = (if fin { FIN_BIT } else { 0 }) | opcode.as_u8();
    buf.put_u8(first);

    if len < LEN_16 as usize {
        buf.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(LEN_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(LEN_64);
        buf.put_u64(len as u64);
    }

    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a close frame carrying `code` and an optional reason.
///
/// The reason is cut so the payload stays within the control frame limit.
pub fn encode_close(code: u16, reason: &str) -> Bytes {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = BytesMut::with_capacity(2 + end);
    payload.put_u16(code);
    payload.put_slice(&reason.as_bytes()[..end]);
    encode(Opcode::Close, true, &payload)
}

/// Extract the status code from a close frame payload, if present.
pub fn close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Read exactly one frame from `reader`.
///
/// End of stream before the first header byte is reported as an I/O error
/// (the peer went away); end of stream anywhere later is a truncated frame.
pub async fn decode<R>(reader: &mut R, max_payload: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await?;
    let second = reader.read_u8().await.map_err(truncated)?;

    if first & RSV_BITS != 0 {
        return Err(ProtocolViolation::ReservedBits.into());
    }

    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::try_from(first & OPCODE_MASK)?;
    let masked = second & MASK_BIT != 0;

    let len = match second & LEN_MASK {
        LEN_16 => u64::from(reader.read_u16().await.map_err(truncated)?),
        LEN_64 => {
            let len = reader.read_u64().await.map_err(truncated)?;
            if len & (1 << 63) != 0 {
                return Err(ProtocolViolation::MalformedLength.into());
            }
            len
        }
        short => u64::from(short),
    };

    if opcode.is_control() {
        if !fin {
            return Err(ProtocolViolation::FragmentedControlFrame.into());
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ProtocolViolation::ControlFrameTooLong(len).into());
        }
    }

    if len > max_payload as u64 {
        return Err(FrameError::TooLarge { len, max: max_payload });
    }

    let mut key = [0u8; 4];
    if masked {
        reader.read_exact(&mut key).await.map_err(truncated)?;
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(truncated)?;

    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        payload: Bytes::from(payload),
    })
}

fn truncated(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolViolation::Truncated.into()
    } else {
        FrameError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a client-style masked frame.
    fn masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let plain = encode(opcode, true, payload);
        let header_len = plain.len() - payload.len();
        let mut out = plain[..header_len].to_vec();
        out[1] |= MASK_BIT;
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    #[tokio::test]
    async fn round_trip_covers_every_length_branch() {
        for opcode in [Opcode::Text, Opcode::Binary] {
            for size in [0usize, 125, 126, 65535, 65536] {
                let payload = vec![b'x'; size];
                let wire = encode(opcode, true, &payload);
                let frame = decode(&mut &wire[..], 1 << 20).await.unwrap();
                assert_eq!(frame.opcode, opcode);
                assert!(frame.fin);
                assert_eq!(frame.payload.len(), size, "size {size}");
                assert_eq!(&frame.payload[..], &payload[..]);
            }
        }
    }

    #[test]
    fn length_header_boundaries() {
        assert_eq!(encode(Opcode::Text, true, &[0; 125])[1], 125);

        let mid = encode(Opcode::Text, true, &[0; 126]);
        assert_eq!(mid[1], 126);
        assert_eq!(&mid[2..4], &[0x00, 0x7E]);

        let max16 = encode(Opcode::Text, true, &[0; 65535]);
        assert_eq!(max16[1], 126);
        assert_eq!(&max16[2..4], &[0xFF, 0xFF]);

        let big = encode(Opcode::Binary, true, &[0; 65536]);
        assert_eq!(big[1], 127);
        assert_eq!(&big[2..10], &[0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn server_frames_are_never_masked() {
        for size in [0usize, 1, 125, 126, 70_000] {
            let wire = encode(Opcode::Binary, true, &vec![7u8; size]);
            assert_eq!(wire[1] & MASK_BIT, 0);
        }
        assert_eq!(encode_close(CLOSE_NORMAL, "bye")[1] & MASK_BIT, 0);
    }

    #[test]
    fn fin_bit_and_opcode_in_first_byte() {
        assert_eq!(encode(Opcode::Text, true, b"")[0], 0x81);
        assert_eq!(encode(Opcode::Binary, false, b"")[0], 0x02);
        assert_eq!(encode(Opcode::Pong, true, b"")[0], 0x8A);
    }

    #[tokio::test]
    async fn unmasks_client_payload() {
        let key = [0x01, 0x02, 0x03, 0x04];
        let wire = masked_frame(Opcode::Text, b"Hello, hub", key);
        // Masked bytes on the wire differ from the plaintext.
        assert_ne!(&wire[6..], b"Hello, hub");

        let frame = decode(&mut &wire[..], 1024).await.unwrap();
        assert!(frame.masked);
        assert_eq!(&frame.payload[..], b"Hello, hub");
    }

    #[tokio::test]
    async fn oversize_rejected_before_payload_is_read() {
        // Header declares 2^40 bytes but no payload follows. A decoder that
        // tried to read it would report truncation instead.
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(1u64 << 40).to_be_bytes());

        let err = decode(&mut &wire[..], 1024).await.unwrap_err();
        match err {
            FrameError::TooLarge { len, max } => {
                assert_eq!(len, 1 << 40);
                assert_eq!(max, 1024);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn limit_is_inclusive() {
        let wire = encode(Opcode::Binary, true, &[1u8; 64]);
        assert!(decode(&mut &wire[..], 64).await.is_ok());
        assert!(matches!(
            decode(&mut &wire[..], 63).await,
            Err(FrameError::TooLarge { len: 64, max: 63 })
        ));
    }

    #[tokio::test]
    async fn malformed_64_bit_length() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&u64::MAX.to_be_bytes());
        let err = decode(&mut &wire[..], usize::MAX).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(ProtocolViolation::MalformedLength)));
    }

    #[tokio::test]
    async fn truncated_payload_is_a_protocol_violation() {
        let mut wire = encode(Opcode::Text, true, b"abcdef").to_vec();
        wire.truncate(wire.len() - 2);
        let err = decode(&mut &wire[..], 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(ProtocolViolation::Truncated)));

        let err = decode(&mut &[0x81u8, 126, 0x01][..], 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(ProtocolViolation::Truncated)));
    }

    #[tokio::test]
    async fn empty_stream_is_io_error() {
        let err = decode(&mut &[][..], 1024).await.unwrap_err();
        match err {
            FrameError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_rule_violations() {
        let reserved = [0xC1u8, 0x00];
        assert!(matches!(
            decode(&mut &reserved[..], 1024).await,
            Err(FrameError::Protocol(ProtocolViolation::ReservedBits))
        ));

        let unknown = [0x83u8, 0x00];
        assert!(matches!(
            decode(&mut &unknown[..], 1024).await,
            Err(FrameError::Protocol(ProtocolViolation::UnknownOpcode(0x3)))
        ));

        let fragmented_ping = [0x09u8, 0x00];
        assert!(matches!(
            decode(&mut &fragmented_ping[..], 1024).await,
            Err(FrameError::Protocol(ProtocolViolation::FragmentedControlFrame))
        ));

        let long_ping = encode(Opcode::Ping, true, &[0u8; 126]);
        assert!(matches!(
            decode(&mut &long_ping[..], 1024).await,
            Err(FrameError::Protocol(ProtocolViolation::ControlFrameTooLong(126)))
        ));
    }

    #[tokio::test]
    async fn fragments_pass_the_header_check() {
        let mut wire = encode(Opcode::Text, false, b"hel").to_vec();
        wire.extend_from_slice(&encode(Opcode::Continuation, true, b"lo"));
        let mut reader = &wire[..];

        let first = decode(&mut reader, 1024).await.unwrap();
        assert!(!first.fin);
        assert_eq!(first.opcode, Opcode::Text);

        let second = decode(&mut reader, 1024).await.unwrap();
        assert!(second.fin);
        assert_eq!(second.opcode, Opcode::Continuation);
        assert_eq!(&second.payload[..], b"lo");
    }

    #[test]
    fn close_frame_layout() {
        let wire = encode_close(CLOSE_NORMAL, "");
        assert_eq!(&wire[..], &[0x88, 0x02, 0x03, 0xE8]);
        assert_eq!(close_code(&wire[2..]), Some(1000));
        assert_eq!(close_code(&[]), None);

        let long = "é".repeat(100);
        let wire = encode_close(1001, &long);
        assert!(wire.len() - 2 <= MAX_CONTROL_PAYLOAD);
    }
}
