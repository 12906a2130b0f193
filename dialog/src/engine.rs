//! Dialog engine: owns the WebSocket, drives the dialog state machine, and
//! wires audio capture/playback to the remote dialogue service.
//!
//! Threading model: the engine's `run` loop is the only place dialog state
//! changes. The realtime audio callbacks touch nothing but the playback
//! byte queue, three shared atomics, and a non-blocking channel send; the
//! channel is drained by the same select loop that reads the socket, so
//! capture frames preserve callback order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voxlink_audio::{AudioQueue, CaptureSink, PcmConverter, PlaybackSource, SampleFormat};

use crate::bus::CommandBus;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::intent::{IntentMatcher, ReplyKind};
use crate::protocol::{Event, Frame, FrameCodec};
use crate::session::Session;

/// Default dialogue endpoint.
pub const DEFAULT_DIALOG_URL: &str = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";

/// Consecutive empty playback ticks before the speaker is considered
/// silent and the microphone may transmit again.
pub const PLAY_IDLE_THRESHOLD: u32 = 50;

/// Remote TTS stream format: 24 kHz float32 mono.
pub const TTS_SAMPLE_RATE: u32 = 24_000;

const RPC_TIMEOUT: Duration = Duration::from_millis(500);
const RPC_RETRIES: u32 = 1;

type WsFullStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsFullStream, WsMessage>;
type WsSource = SplitStream<WsFullStream>;

/// Connection options for the dialogue endpoint.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub url: String,
    /// `X-Api-App-ID` header value.
    pub app_id: String,
    /// `X-Api-Access-Key` header value.
    pub access_key: String,
    /// `X-Api-Resource-Id` header value.
    pub resource_id: String,
    /// `X-Api-App-Key` header value.
    pub app_key: String,
    /// `X-Api-Connect-Id` header value.
    pub connect_id: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    /// Playback device rate the incoming TTS stream is resampled to.
    pub playback_rate: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_DIALOG_URL.to_string(),
            app_id: String::new(),
            access_key: String::new(),
            resource_id: "volc.speech.dialog".to_string(),
            app_key: String::new(),
            connect_id: "voxlink".to_string(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            playback_rate: 8000,
        }
    }
}

/// Dialog lifecycle state. Only the WebSocket task transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Disconnected,
    Connecting,
    Connected,
    SessionOpening,
    SessionOpen,
    SessionClosing,
    Closed,
    Failed,
}

/// Flags shared with the realtime audio callbacks.
#[derive(Debug, Default)]
struct SharedFlags {
    is_ready: AtomicBool,
    local_override: AtomicBool,
    play_idle: AtomicU32,
}

#[derive(Debug)]
enum Flow {
    Continue,
    Reconnect,
}

/// The dialog engine.
pub struct DialogEngine {
    opts: EngineOptions,
    codec: FrameCodec,
    session: Session,
    intents: IntentMatcher,
    bus: Arc<dyn CommandBus>,
    queue: Arc<AudioQueue>,
    converter: PcmConverter,
    shared: Arc<SharedFlags>,
    state: DialogState,
    last_asr_text: String,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    cancel: CancellationToken,
}

impl DialogEngine {
    pub fn new(
        opts: EngineOptions,
        session: Session,
        intents: IntentMatcher,
        bus: Arc<dyn CommandBus>,
    ) -> Result<Self> {
        let converter = PcmConverter::new(
            SampleFormat::F32,
            TTS_SAMPLE_RATE,
            1,
            SampleFormat::F32,
            opts.playback_rate,
            1,
        )?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            opts,
            codec: FrameCodec::new(),
            session,
            intents,
            bus,
            queue: Arc::new(AudioQueue::new()),
            converter,
            shared: Arc::new(SharedFlags::default()),
            state: DialogState::Disconnected,
            last_asr_text: String::new(),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// Builds the engine straight from a loaded configuration file.
    pub fn from_config(
        opts: EngineOptions,
        config: &AppConfig,
        bus: Arc<dyn CommandBus>,
    ) -> Result<Self> {
        let intents = IntentMatcher::load(&config.actions)?;
        let session = Session::new(config.prompt_json(), config.system.hello.clone());
        Self::new(opts, session, intents, bus)
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready.load(Ordering::Relaxed)
    }

    pub fn local_override(&self) -> bool {
        self.shared.local_override.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Token that stops `run` and tears the session down when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Listener for the capture device: encodes one TaskRequest per
    /// callback and ships it through the non-blocking outbound channel,
    /// gated on session readiness and speaker silence.
    pub fn capture_sink(&self) -> Arc<dyn CaptureSink> {
        Arc::new(CaptureBridge {
            shared: Arc::clone(&self.shared),
            codec: self.codec.clone(),
            session: self.session.clone(),
            outbound: self.outbound_tx.clone(),
        })
    }

    /// Listener for the playback device: drains the byte queue and keeps
    /// the play-idle estimate current.
    pub fn playback_source(&self) -> Arc<dyn PlaybackSource> {
        Arc::new(PlaybackBridge {
            shared: Arc::clone(&self.shared),
            queue: Arc::clone(&self.queue),
        })
    }

    /// Runs the connection until cancelled. Reconnects with a full
    /// handshake replay after transport loss when enabled.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.state = DialogState::Connecting;
            let finished = match self.run_connection().await {
                Ok(finished) => finished,
                Err(e) => {
                    error!("connection error: {e}");
                    self.state = DialogState::Failed;
                    false
                }
            };
            self.shared.is_ready.store(false, Ordering::Relaxed);
            self.shared.local_override.store(false, Ordering::Relaxed);
            if finished || self.cancel.is_cancelled() || !self.opts.auto_reconnect {
                break;
            }
            self.state = DialogState::Disconnected;
            info!(
                delay_ms = self.opts.reconnect_delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::time::sleep(self.opts.reconnect_delay).await;
        }
        self.state = DialogState::Closed;
        Ok(())
    }

    /// One connection lifetime. Returns true when the engine is done for
    /// good (cancelled), false when a reconnect should follow.
    async fn run_connection(&mut self) -> Result<bool> {
        let request = self.build_request()?;
        let (ws, _response) = connect_async(request).await?;
        info!(url = %self.opts.url, "websocket connected");
        let (mut sink, mut source) = ws.split();

        sink.send(WsMessage::Binary(
            self.session.start_connect(&self.codec).into(),
        ))
        .await?;

        let mut rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| Error::Other("engine is already running".into()))?;
        // Capture frames queued before the last disconnect belong to a dead
        // session; they must not leak into the new handshake.
        while rx.try_recv().is_ok() {}
        let result = self.pump(&mut sink, &mut source, &mut rx).await;
        self.outbound_rx = Some(rx);
        result
    }

    async fn pump(
        &mut self,
        sink: &mut WsSink,
        source: &mut WsSource,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<bool> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown(sink).await;
                    return Ok(true);
                }
                Some(frame) = rx.recv() => {
                    sink.send(WsMessage::Binary(frame.into())).await?;
                }
                msg = source.next() => match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        match self.handle_binary(&data).await {
                            Ok((Flow::Continue, out)) => {
                                for frame in out {
                                    sink.send(WsMessage::Binary(frame.into())).await?;
                                }
                            }
                            Ok((Flow::Reconnect, _)) => return Ok(false),
                            Err(Error::Decode(e)) => {
                                // Malformed frames are dropped; the
                                // connection stays up.
                                error!("discarding malformed frame: {e}");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("connection closed by server");
                        return Ok(false);
                    }
                    Some(Ok(_)) => {} // pings answered by the transport; text unused
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    /// Orderly teardown on shutdown: finish the session, then the
    /// connection, then close the socket.
    async fn teardown(&mut self, sink: &mut WsSink) {
        if self.state == DialogState::SessionOpen {
            self.state = DialogState::SessionClosing;
            let _ = sink
                .send(WsMessage::Binary(
                    self.session.finish_session(&self.codec).into(),
                ))
                .await;
            let _ = sink
                .send(WsMessage::Binary(
                    self.session.finish_connection(&self.codec).into(),
                ))
                .await;
        }
        self.shared.is_ready.store(false, Ordering::Relaxed);
        let _ = sink.close().await;
    }

    /// Decodes one server frame and applies it to the state machine.
    /// Returns the client frames to send in response.
    async fn handle_binary(&mut self, data: &[u8]) -> Result<(Flow, Vec<Vec<u8>>)> {
        let frame = self.codec.decode(data)?;
        let mut out = Vec::new();

        if frame.is_error() {
            error!(
                code = frame.error_code.unwrap_or(0),
                payload = %String::from_utf8_lossy(&frame.payload),
                "server error frame"
            );
            return Ok((Flow::Continue, out));
        }

        match frame.event_type() {
            Some(Event::ConnectionStarted) => {
                info!("connection started");
                self.state = DialogState::Connected;
                out.push(self.session.start_session(&self.codec));
            }
            Some(Event::ConnectionFailed) => {
                error!(
                    payload = %String::from_utf8_lossy(&frame.payload),
                    "connection refused by server"
                );
                self.state = DialogState::Failed;
                return Ok((Flow::Reconnect, out));
            }
            Some(Event::ConnectionFinished) => {
                info!("connection finished");
            }
            Some(Event::SessionStarted) => {
                info!(session = %frame.session_id, "session started");
                self.state = DialogState::SessionOpen;
                self.shared.is_ready.store(true, Ordering::Relaxed);
                out.push(self.session.say_hello(&self.codec));
            }
            Some(Event::SessionFinished) => {
                info!("session finished");
                self.shared.is_ready.store(false, Ordering::Relaxed);
                self.state = DialogState::Closed;
            }
            Some(Event::SessionFailed) => {
                warn!(
                    payload = %String::from_utf8_lossy(&frame.payload),
                    "session failed; reopening"
                );
                self.shared.is_ready.store(false, Ordering::Relaxed);
                self.state = DialogState::SessionOpening;
                out.push(self.session.start_session(&self.codec));
            }
            Some(Event::ASRResponse) => {
                if let Some(text) = frame.payload_str() {
                    self.last_asr_text = text.to_string();
                }
            }
            Some(Event::ASREnded) => {
                self.dispatch_intent(&mut out).await;
            }
            Some(Event::TTSSentenceStart) => {
                self.on_tts_sentence_start(&frame);
            }
            Some(Event::TTSEnded) => {
                // Safety reset: the matching sentence-start may never come.
                if self.shared.local_override.load(Ordering::Relaxed) {
                    debug!("tts ended; lifting local override");
                    self.shared.local_override.store(false, Ordering::Relaxed);
                }
            }
            _ => {}
        }

        if frame.is_audio() {
            self.on_server_audio(&frame);
        }

        Ok((Flow::Continue, out))
    }

    /// On the final ASR result: match the utterance against the local
    /// intents, invoke the bound command, and speak the outcome.
    async fn dispatch_intent(&mut self, out: &mut Vec<Vec<u8>>) {
        #[derive(Deserialize, Default)]
        struct AsrExtra {
            #[serde(default)]
            origin_text: String,
        }
        #[derive(Deserialize)]
        struct AsrPayload {
            #[serde(default)]
            extra: AsrExtra,
        }

        let parsed: AsrPayload = match serde_json::from_str(&self.last_asr_text) {
            Ok(p) => p,
            Err(e) => {
                warn!(raw = %self.last_asr_text, "unparseable ASR result: {e}");
                return;
            }
        };
        let text = parsed.extra.origin_text;
        if text.is_empty() {
            return;
        }
        info!(%text, "utterance recognized");

        let Some(intent) = self.intents.match_text(&text) else {
            return;
        };
        info!(intent = %intent.name, function = %intent.function, "local intent matched");

        let reply = match self
            .bus
            .call(&intent.function, &intent.params, RPC_TIMEOUT, RPC_RETRIES)
            .await
        {
            Ok(ret) if !ret.is_empty() => ret,
            Ok(_) => intent.random_reply(ReplyKind::Positive),
            Err(e) => {
                warn!(intent = %intent.name, "command dispatch failed: {e}");
                intent.random_reply(ReplyKind::Negative)
            }
        };

        out.push(self.session.chat_tts_text(&self.codec, &reply, true, false));
        out.push(self.session.chat_tts_text(&self.codec, "", false, true));
        self.shared.local_override.store(true, Ordering::Relaxed);
    }

    /// The server confirms it is synthesizing our injected text by tagging
    /// the sentence start; that re-enables the remote audio path.
    fn on_tts_sentence_start(&self, frame: &Frame) {
        if !self.shared.local_override.load(Ordering::Relaxed) {
            return;
        }
        #[derive(Deserialize, Default)]
        struct SentenceInfo {
            #[serde(default)]
            tts_type: String,
        }
        let Some(text) = frame.payload_str() else {
            return;
        };
        if let Ok(info) = serde_json::from_str::<SentenceInfo>(text) {
            if info.tts_type == "chat_tts_text" {
                debug!("server speaking injected reply; lifting local override");
                self.shared.local_override.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Resamples server TTS audio to the playback rate and enqueues it,
    /// unless a locally-injected reply has precedence.
    fn on_server_audio(&mut self, frame: &Frame) {
        if self.shared.local_override.load(Ordering::Relaxed) {
            return;
        }
        if frame.payload.is_empty() {
            return;
        }
        let converted = self.converter.convert(&frame.payload);
        if !converted.is_empty() {
            self.queue.push(&converted);
        }
    }

    fn build_request(&self) -> Result<http::Request<()>> {
        let uri: http::Uri = self
            .opts
            .url
            .parse()
            .map_err(|e| Error::Config(format!("invalid url {:?}: {e}", self.opts.url)))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::Config("url missing host".into()))?
            .to_string();

        http::Request::builder()
            .uri(&self.opts.url)
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .header("X-Api-App-ID", &self.opts.app_id)
            .header("X-Api-Access-Key", &self.opts.access_key)
            .header("X-Api-Resource-Id", &self.opts.resource_id)
            .header("X-Api-App-Key", &self.opts.app_key)
            .header("X-Api-Connect-Id", &self.opts.connect_id)
            .body(())
            .map_err(|e| Error::Config(format!("build request: {e}")))
    }
}

/// Capture-device listener owned by the engine.
struct CaptureBridge {
    shared: Arc<SharedFlags>,
    codec: FrameCodec,
    session: Session,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl CaptureSink for CaptureBridge {
    fn capture(&self, input: &[i16]) {
        if !self.shared.is_ready.load(Ordering::Relaxed) {
            return;
        }
        if self.shared.play_idle.load(Ordering::Relaxed) < PLAY_IDLE_THRESHOLD {
            // The speaker was active recently; keep the mic gated so the
            // agent does not hear itself.
            return;
        }
        let mut pcm = Vec::with_capacity(input.len() * 2);
        for s in input {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        let frame = self.session.task_request(&self.codec, &pcm);
        // Receiver gone means the engine stopped; nothing to do here.
        let _ = self.outbound.send(frame);
    }
}

/// Playback-device listener owned by the engine.
struct PlaybackBridge {
    shared: Arc<SharedFlags>,
    queue: Arc<AudioQueue>,
}

impl PlaybackSource for PlaybackBridge {
    fn fill(&self, output: &mut [f32]) {
        let bytes = self.queue.pop_front(output.len() * 4);
        if bytes.is_empty() {
            self.shared.play_idle.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.shared.play_idle.store(0, Ordering::Relaxed);
        for (dst, src) in output.iter_mut().zip(bytes.chunks_exact(4)) {
            *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        }
    }
}
