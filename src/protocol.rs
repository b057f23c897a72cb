//! Binary wire protocol for the relay envelope.
//!
//! Wire format (unsigned LEB128 varints, 7 bits per byte, high bit set
//! while more bytes follow):
//! ```text
//! ┌──────────────────┬──────────────────────────────────────┐
//! │ varint msg_type  │ payload                              │
//! ├──────────────────┼──────────────────────────────────────┤
//! │ 0 = sync         │ varint sync_type ++ varbytes body    │
//! │ 1 = awareness    │ varbytes block                       │
//! └──────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Sync bodies are opaque CRDT encodings (state vector for step1, update
//! for step2 and update). The envelope is self-delimiting, so a stream
//! transport can concatenate envelopes; the WebSocket adapter delivers
//! exactly one envelope per binary frame.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 4

/// Envelope tag for document sync traffic.
pub const MSG_SYNC: u64 = 0;
/// Envelope tag for ephemeral presence traffic.
pub const MSG_AWARENESS: u64 = 1;

/// Sync sub-type: state-vector request.
pub const SYNC_STEP1: u64 = 0;
/// Sync sub-type: update response to a step1.
pub const SYNC_STEP2: u64 = 1;
/// Sync sub-type: standalone update.
pub const SYNC_UPDATE: u64 = 2;

/// Longest legal varint for a u64: ceil(64 / 7) bytes.
const MAX_VARINT_BYTES: usize = 10;

// ─── Varint primitives ──────────────────────────────────────────────

/// Append `value` as an unsigned LEB128 varint.
pub fn write_var_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint starting at `*pos`, advancing `*pos`.
pub fn read_var_u64(input: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..MAX_VARINT_BYTES {
        let byte = *input.get(*pos).ok_or(ProtocolError::UnexpectedEof)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(ProtocolError::VarIntTooLarge);
        }
    }
    Err(ProtocolError::VarIntTooLarge)
}

/// Append a varint length prefix followed by `bytes`.
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Read a varint-length-prefixed byte block, advancing `*pos`.
pub fn read_var_bytes<'a>(input: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = read_var_u64(input, pos)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::VarIntTooLarge)?;
    let end = pos.checked_add(len).ok_or(ProtocolError::UnexpectedEof)?;
    let slice = input.get(*pos..end).ok_or(ProtocolError::UnexpectedEof)?;
    *pos = end;
    Ok(slice)
}

/// Read a single raw byte, advancing `*pos`.
pub fn read_u8(input: &[u8], pos: &mut usize) -> Result<u8, ProtocolError> {
    let byte = *input.get(*pos).ok_or(ProtocolError::UnexpectedEof)?;
    *pos += 1;
    Ok(byte)
}

// ─── Envelope ───────────────────────────────────────────────────────

/// The sync sub-protocol carried inside a `MSG_SYNC` envelope.
///
/// Bodies are opaque v1 CRDT encodings; the room hands them to the
/// document collaborator without inspecting them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State-vector request: "send me what I am missing".
    Step1(Vec<u8>),
    /// Update carrying the diff computed for a step1.
    Step2(Vec<u8>),
    /// Standalone incremental update.
    Update(Vec<u8>),
}

/// One decoded wire envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
}

impl Message {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload_len());
        match self {
            Message::Sync(sync) => {
                write_var_u64(&mut out, MSG_SYNC);
                let (sub, body) = match sync {
                    SyncMessage::Step1(body) => (SYNC_STEP1, body),
                    SyncMessage::Step2(body) => (SYNC_STEP2, body),
                    SyncMessage::Update(body) => (SYNC_UPDATE, body),
                };
                write_var_u64(&mut out, sub);
                write_var_bytes(&mut out, body);
            }
            Message::Awareness(block) => {
                write_var_u64(&mut out, MSG_AWARENESS);
                write_var_bytes(&mut out, block);
            }
        }
        out
    }

    /// Decode exactly one envelope; trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let msg = Self::decode_from(bytes, &mut pos)?;
        if pos != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - pos));
        }
        Ok(msg)
    }

    /// Decode one envelope starting at `*pos`, advancing `*pos` past it.
    ///
    /// Stream transports call this in a loop over a concatenated buffer.
    pub fn decode_from(input: &[u8], pos: &mut usize) -> Result<Self, ProtocolError> {
        match read_var_u64(input, pos)? {
            MSG_SYNC => {
                let sub = read_var_u64(input, pos)?;
                let body = read_var_bytes(input, pos)?.to_vec();
                let sync = match sub {
                    SYNC_STEP1 => SyncMessage::Step1(body),
                    SYNC_STEP2 => SyncMessage::Step2(body),
                    SYNC_UPDATE => SyncMessage::Update(body),
                    other => return Err(ProtocolError::InvalidSyncType(other)),
                };
                Ok(Message::Sync(sync))
            }
            MSG_AWARENESS => {
                let block = read_var_bytes(input, pos)?.to_vec();
                Ok(Message::Awareness(block))
            }
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Sync(SyncMessage::Step1(b))
            | Message::Sync(SyncMessage::Step2(b))
            | Message::Sync(SyncMessage::Update(b)) => b.len(),
            Message::Awareness(b) => b.len(),
        }
    }
}

/// Wire decode errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended mid-varint or mid-payload.
    UnexpectedEof,
    /// Varint continued past the 10-byte u64 limit.
    VarIntTooLarge,
    /// Unknown envelope tag.
    InvalidMessageType(u64),
    /// Unknown sync sub-type.
    InvalidSyncType(u64),
    /// Presence flag byte was neither tombstone nor present.
    InvalidFlag(u8),
    /// Bytes left over after a complete envelope.
    TrailingBytes(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "Unexpected end of input"),
            Self::VarIntTooLarge => write!(f, "Varint exceeds u64 range"),
            Self::InvalidMessageType(t) => write!(f, "Invalid message type: {t}"),
            Self::InvalidSyncType(t) => write!(f, "Invalid sync sub-type: {t}"),
            Self::InvalidFlag(b) => write!(f, "Invalid presence flag: {b}"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after envelope"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip_boundaries() {
        let values = [0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX];
        for value in values {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_var_u64(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_width() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 127);
        assert_eq!(buf.len(), 1);

        buf.clear();
        write_var_u64(&mut buf, 128);
        assert_eq!(buf.len(), 2);

        buf.clear();
        write_var_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_varint_truncated() {
        // Continuation bit set but no next byte
        let buf = [0x80u8];
        let mut pos = 0;
        assert_eq!(read_var_u64(&buf, &mut pos), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_varint_overlong() {
        let buf = [0xFFu8; 11];
        let mut pos = 0;
        assert_eq!(read_var_u64(&buf, &mut pos), Err(ProtocolError::VarIntTooLarge));
    }

    #[test]
    fn test_var_bytes_roundtrip() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, &[1, 2, 3, 4, 5]);
        let mut pos = 0;
        assert_eq!(read_var_bytes(&buf, &mut pos).unwrap(), &[1, 2, 3, 4, 5]);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_var_bytes_length_past_end() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 100); // claims 100 bytes
        buf.extend_from_slice(&[0; 3]); // provides 3
        let mut pos = 0;
        assert_eq!(read_var_bytes(&buf, &mut pos), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_sync_step1_roundtrip() {
        let msg = Message::Sync(SyncMessage::Step1(vec![10, 20, 30]));
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_sync_step2_roundtrip() {
        let msg = Message::Sync(SyncMessage::Step2(vec![7; 64]));
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_sync_update_roundtrip() {
        let msg = Message::Sync(SyncMessage::Update(vec![0xAB; 200]));
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let msg = Message::Awareness(vec![1, 0, 1, 0]);
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_empty_bodies_roundtrip() {
        for msg in [
            Message::Sync(SyncMessage::Step1(Vec::new())),
            Message::Sync(SyncMessage::Update(Vec::new())),
            Message::Awareness(Vec::new()),
        ] {
            let encoded = msg.encode();
            assert_eq!(Message::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_empty_input() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_decode_unknown_message_type() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 9);
        assert_eq!(Message::decode(&buf), Err(ProtocolError::InvalidMessageType(9)));
    }

    #[test]
    fn test_decode_unknown_sync_type() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, MSG_SYNC);
        write_var_u64(&mut buf, 5);
        write_var_bytes(&mut buf, &[]);
        assert_eq!(Message::decode(&buf), Err(ProtocolError::InvalidSyncType(5)));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut encoded = Message::Awareness(vec![9, 9]).encode();
        encoded.push(0x00);
        assert_eq!(Message::decode(&encoded), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn test_decode_from_concatenated_stream() {
        let first = Message::Sync(SyncMessage::Update(vec![1, 2, 3]));
        let second = Message::Awareness(vec![4, 5]);
        let mut stream = first.encode();
        stream.extend_from_slice(&second.encode());

        let mut pos = 0;
        assert_eq!(Message::decode_from(&stream, &mut pos).unwrap(), first);
        assert_eq!(Message::decode_from(&stream, &mut pos).unwrap(), second);
        assert_eq!(pos, stream.len());
    }

    #[test]
    fn test_envelope_overhead_small() {
        // 3-byte state vector: tag + sub-type + length + body = 6 bytes
        let msg = Message::Sync(SyncMessage::Step1(vec![0, 1, 2]));
        assert_eq!(msg.encode().len(), 6);
    }
}
