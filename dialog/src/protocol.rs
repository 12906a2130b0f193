//! Binary wire protocol for the realtime dialogue service.
//!
//! Frame layout:
//! - Header (4 bytes):
//!   - (4bits) version + (4bits) header_size (in 4-byte words)
//!   - (4bits) message_type + (4bits) message_flags
//!   - (4bits) serialization + (4bits) compression
//!   - (8bits) reserved
//!
//! - Body, flag-directed, all integers big-endian:
//!   - [optional] seq (4 bytes) when any sequence flag bit is set
//!   - [optional] event (4 bytes) when the event flag is set
//!   - [optional] error_code (4 bytes), Error frames only
//!   - session_id (4 bytes length + data), non-error frames
//!   - payload (4 bytes length + data)

use std::io::Read;

use bytes::{BufMut, BytesMut};
use flate2::read::GzDecoder;
use thiserror::Error;

// ================== Protocol Constants ==================

/// Protocol version carried in the header high nibble.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Message type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    /// Client full request (JSON event payload).
    #[default]
    ClientFull = 0b0001,
    /// Client audio-only request (raw PCM payload).
    ClientAudio = 0b0010,
    /// Server full response (JSON event payload).
    ServerFull = 0b1001,
    /// Server audio-only response (raw PCM payload).
    ServerAudio = 0b1011,
    /// Server error response.
    Error = 0b1111,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        match v {
            0b0001 => Ok(MessageType::ClientFull),
            0b0010 => Ok(MessageType::ClientAudio),
            0b1001 => Ok(MessageType::ServerFull),
            0b1011 => Ok(MessageType::ServerAudio),
            0b1111 => Ok(MessageType::Error),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

/// Message flag bits. Written as a plain integer on encode (the encoder
/// only ever sets `EVENT_PRESENT`), read as a bitmask on decode.
pub mod flags {
    /// Sequence number present (positive, non-terminal packet).
    pub const SEQ_PRESENT: u8 = 0b0001;
    /// Terminal packet with a negative sequence number.
    pub const SEQ_NEG_TERM: u8 = 0b0010;
    /// Terminal packet, both sequence bits.
    pub const TERMINATOR: u8 = 0b0011;
    /// Event id present.
    pub const EVENT_PRESENT: u8 = 0b0100;
}

/// Serialization type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serialization {
    #[default]
    None = 0b0000,
    Json = 0b0001,
    Thrift = 0b0011,
    Custom = 0b1111,
}

impl Serialization {
    fn from_nibble(v: u8) -> Self {
        match v {
            0b0000 => Serialization::None,
            0b0001 => Serialization::Json,
            0b0011 => Serialization::Thrift,
            _ => Serialization::Custom,
        }
    }
}

/// Compression type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None = 0b0000,
    Gzip = 0b0011,
    Custom = 0b1111,
}

impl Compression {
    fn from_nibble(v: u8) -> Self {
        match v {
            0b0000 => Compression::None,
            0b0011 => Compression::Gzip,
            _ => Compression::Custom,
        }
    }
}

/// Dialog event tags.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Client to server
    StartConnect = 1,
    FinishConnection = 2,
    StartSession = 100,
    FinishSession = 102,
    TaskRequest = 200,
    SayHello = 300,
    ChatTTSText = 500,

    // Server to client
    ConnectionStarted = 50,
    ConnectionFailed = 51,
    ConnectionFinished = 52,
    SessionStarted = 150,
    SessionFinished = 152,
    SessionFailed = 153,
    TTSSentenceStart = 350,
    TTSSentenceEnd = 351,
    TTSResponse = 352,
    TTSEnded = 359,
    ASRInfo = 450,
    ASRResponse = 451,
    ASREnded = 459,
    ChatResponse = 550,
    ChatEnded = 559,
}

impl Event {
    /// Maps a wire tag back to the closed event set.
    pub fn from_u32(v: u32) -> Option<Event> {
        Some(match v {
            1 => Event::StartConnect,
            2 => Event::FinishConnection,
            100 => Event::StartSession,
            102 => Event::FinishSession,
            200 => Event::TaskRequest,
            300 => Event::SayHello,
            500 => Event::ChatTTSText,
            50 => Event::ConnectionStarted,
            51 => Event::ConnectionFailed,
            52 => Event::ConnectionFinished,
            150 => Event::SessionStarted,
            152 => Event::SessionFinished,
            153 => Event::SessionFailed,
            350 => Event::TTSSentenceStart,
            351 => Event::TTSSentenceEnd,
            352 => Event::TTSResponse,
            359 => Event::TTSEnded,
            450 => Event::ASRInfo,
            451 => Event::ASRResponse,
            459 => Event::ASREnded,
            550 => Event::ChatResponse,
            559 => Event::ChatEnded,
            _ => return None,
        })
    }
}

// ================== Decode Errors ==================

/// Error produced while decoding a wire frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A field or length prefix ran past the end of the buffer.
    #[error("frame truncated")]
    Truncated,

    /// The header carries a message type the client does not accept.
    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u8),

    /// A JSON payload is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    BadPayload,

    /// A gzip payload failed to inflate.
    #[error("corrupt compressed payload")]
    BadCompression,
}

// ================== Frame ==================

/// One decoded message from the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Message type.
    pub msg_type: MessageType,
    /// Raw flag nibble.
    pub flags: u8,
    /// Serialization type.
    pub serialization: Serialization,
    /// Compression type (payload is already inflated).
    pub compression: Compression,
    /// Sequence number, when any sequence flag bit is set.
    pub seq: Option<i32>,
    /// Raw event tag, when the event flag is set.
    pub event: Option<u32>,
    /// Error code, on error frames.
    pub error_code: Option<u32>,
    /// Session ID.
    pub session_id: String,
    /// Payload bytes (JSON text or raw PCM).
    pub payload: Vec<u8>,
}

impl Frame {
    /// The event tag mapped into the closed event set.
    pub fn event_type(&self) -> Option<Event> {
        self.event.and_then(Event::from_u32)
    }

    /// Returns true for audio-only frames.
    pub fn is_audio(&self) -> bool {
        self.msg_type == MessageType::ServerAudio
    }

    /// Returns true for error frames.
    pub fn is_error(&self) -> bool {
        self.msg_type == MessageType::Error
    }

    /// The payload as text, when it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

// ================== Codec ==================

/// Pure encoder/decoder for wire frames. No I/O; the only allocations are
/// the returned buffers.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    version: u8,
    header_size: u8,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header_size: 1, // 4 bytes
        }
    }

    /// Encodes a client frame.
    ///
    /// The encoder always sets the event flag and never emits `seq` or
    /// `error_code` (server-only fields). Exactly one length prefix
    /// precedes the payload. Compression is never applied.
    pub fn encode(
        &self,
        event: Event,
        session_id: Option<&str>,
        payload: &[u8],
        msg_type: MessageType,
        serialization: Serialization,
    ) -> Vec<u8> {
        let sid_len = session_id.map_or(0, |s| 4 + s.len());
        let mut buf = BytesMut::with_capacity(12 + sid_len + payload.len());

        buf.put_u8(self.version << 4 | self.header_size);
        buf.put_u8((msg_type as u8) << 4 | flags::EVENT_PRESENT);
        buf.put_u8((serialization as u8) << 4 | Compression::None as u8);
        buf.put_u8(0x00); // reserved

        buf.put_u32(event as u32);
        if let Some(sid) = session_id {
            buf.put_u32(sid.len() as u32);
            buf.put_slice(sid.as_bytes());
        }
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        buf.to_vec()
    }

    /// Decodes one server frame.
    pub fn decode(&self, data: &[u8]) -> Result<Frame, DecodeError> {
        let mut r = Reader::new(data);

        let b0 = r.get_u8()?;
        let b1 = r.get_u8()?;
        let b2 = r.get_u8()?;
        let _reserved = r.get_u8()?;

        let header_size = (b0 & 0x0f) as usize;
        let msg_type = MessageType::try_from(b1 >> 4)?;
        let frame_flags = b1 & 0x0f;

        let mut frame = Frame {
            msg_type,
            flags: frame_flags,
            serialization: Serialization::from_nibble(b2 >> 4),
            compression: Compression::from_nibble(b2 & 0x0f),
            ..Default::default()
        };

        // Extension header words are skipped, not interpreted.
        if header_size > 1 {
            r.take((header_size - 1) * 4)?;
        }

        match msg_type {
            MessageType::ServerFull | MessageType::ServerAudio => {
                if frame_flags & flags::TERMINATOR != 0 {
                    frame.seq = Some(r.get_i32()?);
                }
                if frame_flags & flags::EVENT_PRESENT != 0 {
                    frame.event = Some(r.get_u32()?);
                }
                let sid = r.take_len_prefixed()?;
                frame.session_id = String::from_utf8_lossy(sid).into_owned();
                frame.payload = r.take_len_prefixed()?.to_vec();
            }
            MessageType::Error => {
                frame.error_code = Some(r.get_u32()?);
                frame.payload = r.take_len_prefixed()?.to_vec();
            }
            other => return Err(DecodeError::UnknownMessageType(other as u8)),
        }

        if frame.compression == Compression::Gzip && !frame.payload.is_empty() {
            frame.payload = gzip_decompress(&frame.payload)?;
        }
        if frame.serialization == Serialization::Json
            && std::str::from_utf8(&frame.payload).is_err()
        {
            return Err(DecodeError::BadPayload);
        }

        Ok(frame)
    }
}

/// Bounds-checked big-endian reader over a frame buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn get_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.get_u32()? as i32)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_len_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }
}

/// Gzip decompress data.
fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|_| DecodeError::BadCompression)?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_start_connect_literal() {
        let codec = FrameCodec::new();
        let data = codec.encode(
            Event::StartConnect,
            None,
            b"{}",
            MessageType::ClientFull,
            Serialization::Json,
        );
        let expect: Vec<u8> = vec![
            0x11, 0x14, 0x10, 0x00, // header: v1/size1, full-client/event, json/none
            0, 0, 0, 1, // event = StartConnect
            0, 0, 0, 2, // payload length
            b'{', b'}',
        ];
        assert_eq!(data, expect);
    }

    #[test]
    fn test_round_trip_server_full() {
        let codec = FrameCodec::new();
        let payload = br#"{"result":"ok"}"#;
        let data = codec.encode(
            Event::SessionStarted,
            Some("abc123"),
            payload,
            MessageType::ServerFull,
            Serialization::Json,
        );
        let frame = codec.decode(&data).unwrap();

        assert_eq!(frame.msg_type, MessageType::ServerFull);
        assert_eq!(frame.flags, flags::EVENT_PRESENT);
        assert_eq!(frame.event_type(), Some(Event::SessionStarted));
        assert_eq!(frame.session_id, "abc123");
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.seq, None);
        assert_eq!(frame.error_code, None);
    }

    #[test]
    fn test_round_trip_server_audio() {
        let codec = FrameCodec::new();
        let pcm: Vec<u8> = (0..64).collect();
        let data = codec.encode(
            Event::TTSResponse,
            Some("sess"),
            &pcm,
            MessageType::ServerAudio,
            Serialization::None,
        );
        let frame = codec.decode(&data).unwrap();

        assert!(frame.is_audio());
        assert_eq!(frame.event_type(), Some(Event::TTSResponse));
        assert_eq!(frame.payload, pcm);
    }

    #[test]
    fn test_decode_seq_flag_bitmask() {
        // flags = SEQ_PRESENT | EVENT_PRESENT: seq precedes the event.
        let mut data = vec![0x11, 0x95, 0x10, 0x00];
        data.extend_from_slice(&42i32.to_be_bytes()); // seq
        data.extend_from_slice(&150u32.to_be_bytes()); // event
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(b"sess");
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(b"{}");

        let frame = FrameCodec::new().decode(&data).unwrap();
        assert_eq!(frame.seq, Some(42));
        assert_eq!(frame.event_type(), Some(Event::SessionStarted));
        assert_eq!(frame.session_id, "sess");
    }

    #[test]
    fn test_decode_negative_terminal_seq() {
        let mut data = vec![0x11, 0xB2, 0x00, 0x00]; // server audio, neg-seq flag
        data.extend_from_slice(&(-1i32).to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes()); // empty session id
        data.extend_from_slice(&0u32.to_be_bytes()); // empty payload

        let frame = FrameCodec::new().decode(&data).unwrap();
        assert_eq!(frame.seq, Some(-1));
        assert_eq!(frame.event, None);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_decode_error_frame() {
        let mut data = vec![0x11, 0xF0, 0x10, 0x00];
        data.extend_from_slice(&45000000u32.to_be_bytes());
        let body = br#"{"error":"quota"}"#;
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(body);

        let frame = FrameCodec::new().decode(&data).unwrap();
        assert!(frame.is_error());
        assert_eq!(frame.error_code, Some(45000000));
        assert_eq!(frame.payload, body);
    }

    #[test]
    fn test_decode_unknown_message_type() {
        // Client message types are not accepted back from the wire.
        let data = vec![0x11, 0x24, 0x00, 0x00];
        assert_eq!(
            FrameCodec::new().decode(&data),
            Err(DecodeError::UnknownMessageType(0x2))
        );
        let data = vec![0x11, 0xC4, 0x00, 0x00];
        assert_eq!(
            FrameCodec::new().decode(&data),
            Err(DecodeError::UnknownMessageType(0xC))
        );
    }

    #[test]
    fn test_decode_truncated() {
        // Short header.
        assert_eq!(
            FrameCodec::new().decode(&[0x11, 0x94]),
            Err(DecodeError::Truncated)
        );

        // Payload length prefix larger than the remaining buffer.
        let mut data = vec![0x11, 0x94, 0x10, 0x00];
        data.extend_from_slice(&150u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&100u32.to_be_bytes()); // claims 100 bytes
        data.extend_from_slice(b"short");
        assert_eq!(
            FrameCodec::new().decode(&data),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn test_decode_bad_utf8_json_payload() {
        let mut data = vec![0x11, 0x94, 0x10, 0x00];
        data.extend_from_slice(&150u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(
            FrameCodec::new().decode(&data),
            Err(DecodeError::BadPayload)
        );
    }

    #[test]
    fn test_decode_binary_payload_not_validated() {
        // Audio payloads are raw bytes; invalid UTF-8 is fine.
        let codec = FrameCodec::new();
        let data = codec.encode(
            Event::TTSResponse,
            Some("s"),
            &[0xff, 0xfe, 0x00],
            MessageType::ServerAudio,
            Serialization::None,
        );
        assert!(codec.decode(&data).is_ok());
    }

    #[test]
    fn test_decode_gzip_payload() {
        use flate2::Compression as GzLevel;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let body = br#"{"text":"compressed"}"#;
        let mut enc = GzEncoder::new(Vec::new(), GzLevel::default());
        enc.write_all(body).unwrap();
        let packed = enc.finish().unwrap();

        let mut data = vec![0x11, 0x94, 0x13, 0x00]; // json + gzip
        data.extend_from_slice(&451u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&(packed.len() as u32).to_be_bytes());
        data.extend_from_slice(&packed);

        let frame = FrameCodec::new().decode(&data).unwrap();
        assert_eq!(frame.payload, body);
    }

    #[test]
    fn test_extension_header_skipped() {
        // header_size = 2: one extra 4-byte word before the body.
        let mut data = vec![0x12, 0x94, 0x10, 0x00];
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        data.extend_from_slice(&150u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(b"{}");

        let frame = FrameCodec::new().decode(&data).unwrap();
        assert_eq!(frame.event_type(), Some(Event::SessionStarted));
    }
}
