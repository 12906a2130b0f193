//! Dialog session identity and client frame construction.

use chrono::Utc;
use serde_json::json;

use crate::protocol::{Event, FrameCodec, MessageType, Serialization};

/// One dialog session: identity plus the prompt and greeting it opens with.
///
/// Created once per connect cycle. The id is derived from the MAC address
/// of the first Ethernet interface with separators stripped, so the remote
/// service sees a stable identity per device; when that is unavailable a
/// timestamp string stands in.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    prompt: String,
    hello: String,
}

impl Session {
    pub fn new(prompt: String, hello: String) -> Self {
        Self {
            id: derive_session_id(),
            prompt,
            hello,
        }
    }

    /// Builds a session with an explicit id.
    pub fn with_id(id: impl Into<String>, prompt: String, hello: String) -> Self {
        Self {
            id: id.into(),
            prompt,
            hello,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hello(&self) -> &str {
        &self.hello
    }

    // ---- Client frame builders ----

    pub fn start_connect(&self, codec: &FrameCodec) -> Vec<u8> {
        codec.encode(
            Event::StartConnect,
            None,
            b"{}",
            MessageType::ClientFull,
            Serialization::Json,
        )
    }

    pub fn finish_connection(&self, codec: &FrameCodec) -> Vec<u8> {
        codec.encode(
            Event::FinishConnection,
            None,
            b"{}",
            MessageType::ClientFull,
            Serialization::Json,
        )
    }

    /// Opens the session, carrying the dialog-service prompt verbatim.
    pub fn start_session(&self, codec: &FrameCodec) -> Vec<u8> {
        codec.encode(
            Event::StartSession,
            Some(&self.id),
            self.prompt.as_bytes(),
            MessageType::ClientFull,
            Serialization::Json,
        )
    }

    pub fn finish_session(&self, codec: &FrameCodec) -> Vec<u8> {
        codec.encode(
            Event::FinishSession,
            Some(&self.id),
            b"{}",
            MessageType::ClientFull,
            Serialization::Json,
        )
    }

    /// Asks the agent to speak the configured greeting.
    pub fn say_hello(&self, codec: &FrameCodec) -> Vec<u8> {
        self.say_text(codec, &self.hello)
    }

    /// Asks the agent to speak arbitrary content.
    pub fn say_text(&self, codec: &FrameCodec, content: &str) -> Vec<u8> {
        let payload = json!({ "content": content }).to_string();
        codec.encode(
            Event::SayHello,
            Some(&self.id),
            payload.as_bytes(),
            MessageType::ClientFull,
            Serialization::Json,
        )
    }

    /// One microphone block as raw PCM.
    pub fn task_request(&self, codec: &FrameCodec, audio: &[u8]) -> Vec<u8> {
        codec.encode(
            Event::TaskRequest,
            Some(&self.id),
            audio,
            MessageType::ClientAudio,
            Serialization::None,
        )
    }

    /// Injects text for the server to synthesize; sent as a start/end pair.
    pub fn chat_tts_text(&self, codec: &FrameCodec, text: &str, start: bool, end: bool) -> Vec<u8> {
        let payload = json!({ "start": start, "content": text, "end": end }).to_string();
        codec.encode(
            Event::ChatTTSText,
            Some(&self.id),
            payload.as_bytes(),
            MessageType::ClientFull,
            Serialization::Json,
        )
    }
}

fn derive_session_id() -> String {
    match std::fs::read_to_string("/sys/class/net/eth0/address") {
        Ok(mac) => {
            let id: String = mac.trim().chars().filter(|c| *c != ':').collect();
            if id.is_empty() { fallback_id() } else { id }
        }
        Err(_) => fallback_id(),
    }
}

fn fallback_id() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::with_id("deadbeef0001", r#"{"dialog":{}}"#.to_string(), "你好".to_string())
    }

    #[test]
    fn test_start_session_carries_prompt() {
        let codec = FrameCodec::new();
        let s = session();
        let data = s.start_session(&codec);

        // Walk the encoded frame by hand: header, event, session id, payload.
        assert_eq!(&data[..4], &[0x11, 0x14, 0x10, 0x00]);
        assert_eq!(&data[4..8], &100u32.to_be_bytes());
        assert_eq!(&data[8..12], &12u32.to_be_bytes());
        assert_eq!(&data[12..24], b"deadbeef0001");
        assert_eq!(&data[24..28], &(s.prompt.len() as u32).to_be_bytes());
        assert_eq!(&data[28..], s.prompt.as_bytes());
    }

    #[test]
    fn test_task_request_is_audio_with_single_length_prefix() {
        let codec = FrameCodec::new();
        let s = session();
        let pcm = [1u8, 2, 3, 4, 5, 6];
        let data = s.task_request(&codec, &pcm);

        // Audio-only client type, no serialization.
        assert_eq!(data[1], 0x24);
        assert_eq!(data[2], 0x00);
        let sid_end = 12 + s.id().len();
        // Exactly one u32 length prefix before the payload bytes.
        assert_eq!(&data[sid_end..sid_end + 4], &6u32.to_be_bytes());
        assert_eq!(&data[sid_end + 4..], &pcm);
        assert_eq!(data.len(), sid_end + 4 + pcm.len());
    }

    #[test]
    fn test_chat_tts_text_payload_shape() {
        let codec = FrameCodec::new();
        let s = session();
        let data = s.chat_tts_text(&codec, "已打开", true, false);
        let payload_start = 12 + s.id().len() + 4;
        let v: serde_json::Value = serde_json::from_slice(&data[payload_start..]).unwrap();
        assert_eq!(v["content"], "已打开");
        assert_eq!(v["start"], true);
        assert_eq!(v["end"], false);
    }

    #[test]
    fn test_say_hello_content() {
        let codec = FrameCodec::new();
        let s = session();
        let data = s.say_hello(&codec);
        let payload_start = 12 + s.id().len() + 4;
        let v: serde_json::Value = serde_json::from_slice(&data[payload_start..]).unwrap();
        assert_eq!(v["content"], "你好");
    }

    #[test]
    fn test_fallback_id_shape() {
        let id = fallback_id();
        // YYYY-MM-DD HH:MM:SS
        assert_eq!(id.len(), 19);
        assert_eq!(&id[4..5], "-");
        assert_eq!(&id[10..11], " ");
    }
}
