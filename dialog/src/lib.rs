//! Voice-dialog client core.
//!
//! Bridges local audio I/O and a remote full-duplex speech-dialog service
//! over a secure WebSocket:
//!
//! - `protocol`: binary frame codec (bit-packed header, flag-directed body)
//! - `session`: session identity and client frame construction
//! - `engine`: connection/session state machine, echo gate, local override
//! - `intent`: regex matcher routing recognized utterances to local commands
//! - `bus`: the request/reply channel local commands are dispatched over
//! - `config`: the JSON configuration file (prompt, greeting, intents)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voxlink_dialog::{AppConfig, DialogEngine, EngineOptions};
//!
//! # async fn run(bus: Arc<dyn voxlink_dialog::CommandBus>) -> voxlink_dialog::Result<()> {
//! let config = AppConfig::load("localai.json")?;
//! let opts = EngineOptions {
//!     app_id: "app".into(),
//!     access_key: "key".into(),
//!     ..Default::default()
//! };
//! let mut engine = DialogEngine::from_config(opts, &config, bus)?;
//!
//! // Register engine.capture_sink() / engine.playback_source() with the
//! // audio devices, then drive the connection:
//! engine.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod engine;
pub mod intent;
pub mod protocol;
pub mod session;

mod error;

pub use bus::{BusError, CommandBus};
pub use config::{AppConfig, CmdConfig, IntentConfig, SystemConfig};
pub use engine::{
    DEFAULT_DIALOG_URL, DialogEngine, DialogState, EngineOptions, PLAY_IDLE_THRESHOLD,
    TTS_SAMPLE_RATE,
};
pub use error::{Error, Result};
pub use intent::{Intent, IntentMatcher, ReplyKind};
pub use protocol::{
    Compression, DecodeError, Event, Frame, FrameCodec, MessageType, Serialization,
};
pub use session::Session;
