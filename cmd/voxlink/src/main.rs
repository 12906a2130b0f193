//! voxlink — realtime voice dialogue client with local intent dispatch.
//!
//! Captures microphone audio, streams it to the remote dialogue service,
//! plays synthesized speech back, and routes recognized utterances to
//! local command handlers over MQTT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use voxlink_audio::{CaptureConfig, CaptureDevice, PlaybackConfig, PlaybackDevice};
use voxlink_cmdbus::MqttBus;
use voxlink_dialog::{AppConfig, DEFAULT_DIALOG_URL, DialogEngine, EngineOptions};

const LOG_DIR: &str = "/tmp/xdlogs";

#[derive(Parser)]
#[command(name = "voxlink")]
#[command(about = "Realtime voice dialogue client", version)]
struct Cli {
    /// Dialog/intent configuration file
    #[arg(short, long, default_value = "localai.json")]
    config: String,

    /// Dialogue service endpoint
    #[arg(long, default_value = DEFAULT_DIALOG_URL)]
    url: String,

    /// X-Api-App-ID header value
    #[arg(long, env = "VOXLINK_APP_ID")]
    app_id: String,

    /// X-Api-Access-Key header value
    #[arg(long, env = "VOXLINK_ACCESS_KEY")]
    access_key: String,

    /// X-Api-Resource-Id header value
    #[arg(long, default_value = "volc.speech.dialog")]
    resource_id: String,

    /// X-Api-App-Key header value
    #[arg(long, env = "VOXLINK_APP_KEY")]
    app_key: String,

    /// X-Api-Connect-Id header value
    #[arg(long, default_value = "voxlink")]
    connect_id: String,

    /// MQTT broker host for the local command bus
    #[arg(long, default_value = "127.0.0.1", env = "VOXLINK_MQTT_HOST")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Playback sample rate in Hz
    #[arg(long, default_value_t = 8000)]
    playback_rate: u32,

    /// Capture sample rate in Hz
    #[arg(long, default_value_t = 16000)]
    capture_rate: u32,

    /// Capture channel count as exposed by the device
    #[arg(long, default_value_t = 1)]
    capture_channels: u16,

    /// Channel to extract when the capture stream is multi-channel
    #[arg(long)]
    capture_channel_index: Option<u16>,

    /// Frames per audio callback buffer
    #[arg(long, default_value_t = 320)]
    frames_per_buffer: u32,

    /// Reconnect delay in milliseconds
    #[arg(long, default_value_t = 1000)]
    reconnect_delay_ms: u64,

    /// Disable automatic reconnect
    #[arg(long)]
    no_reconnect: bool,
}

/// Console plus rotating file output under /tmp/xdlogs, two files kept.
/// Log level is controlled by RUST_LOG (default: info).
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .compact(),
    );

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("voxlink")
        .filename_suffix("log")
        .max_log_files(2)
        .build(LOG_DIR);

    match file_appender {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .compact(),
                )
                .init();
            // Keep the writer alive for the process lifetime.
            std::mem::forget(guard);
        }
        Err(e) => {
            registry.init();
            tracing::warn!("file logging disabled: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config =
        AppConfig::load(&cli.config).with_context(|| format!("loading {}", cli.config))?;

    let bus = Arc::new(
        MqttBus::connect(&cli.mqtt_host, cli.mqtt_port, &cli.connect_id)
            .await
            .context("connecting command bus")?,
    );

    let opts = EngineOptions {
        url: cli.url,
        app_id: cli.app_id,
        access_key: cli.access_key,
        resource_id: cli.resource_id,
        app_key: cli.app_key,
        connect_id: cli.connect_id,
        auto_reconnect: !cli.no_reconnect,
        reconnect_delay: Duration::from_millis(cli.reconnect_delay_ms),
        playback_rate: cli.playback_rate,
    };
    let mut engine = DialogEngine::from_config(opts, &config, bus)?;
    info!(session = %engine.session_id(), "engine ready");

    let mut playback = PlaybackDevice::new(PlaybackConfig {
        sample_rate: cli.playback_rate,
        channels: 1,
        frames_per_buffer: cli.frames_per_buffer,
    });
    playback.add_listener(engine.playback_source());
    playback.open().context("opening playback device")?;

    let mut capture = CaptureDevice::new(CaptureConfig {
        sample_rate: cli.capture_rate,
        channels: cli.capture_channels,
        frames_per_buffer: cli.frames_per_buffer,
        channel_index: cli.capture_channel_index,
    });
    capture.add_listener(engine.capture_sink());
    capture.open().context("opening capture device")?;

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    let result = engine.run().await;

    capture.close();
    playback.close();
    info!("stopped");

    result.map_err(Into::into)
}
