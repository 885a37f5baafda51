//! Main entrypoint for the voice agent CLI.
//!
//! `talk` holds a supervised conversation using WAV files or, with the
//! `native-audio` feature, the default microphone and speaker. `check`
//! verifies the API key and that the conversation socket opens.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use convai::{AudioCapture, AudioSink, ConversationSession, WsConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use voice_agent::{
    check::{check_api_key, check_websocket},
    config::Config,
    devices::{WavDirSink, WavFileCapture},
    supervisor::{SupervisorSettings, run_conversation},
};

#[derive(Parser, Debug)]
#[command(version, about = "Talk to a conversational voice agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hold a conversation with the configured agent.
    Talk(TalkArgs),
    /// Verify the API key and WebSocket connectivity.
    Check,
}

#[derive(Args, Debug)]
struct TalkArgs {
    /// WAV file streamed as the microphone.
    #[arg(long, conflicts_with = "mic", required_unless_present = "mic")]
    input: Option<PathBuf>,
    /// Capture from the default input device.
    #[arg(long)]
    mic: bool,
    /// Directory that receives each agent clip as a WAV file.
    #[arg(long, conflicts_with = "speaker", required_unless_present = "speaker")]
    output_dir: Option<PathBuf>,
    /// Play agent audio on the default output device.
    #[arg(long)]
    speaker: bool,
}

/// Resolves once `Ctrl+C` is received.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal. Ending conversation..."),
        Err(e) => {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(feature = "native-audio")]
fn microphone() -> anyhow::Result<Arc<dyn AudioCapture>> {
    Ok(Arc::new(voice_agent::devices::MicCapture))
}

#[cfg(not(feature = "native-audio"))]
fn microphone() -> anyhow::Result<Arc<dyn AudioCapture>> {
    anyhow::bail!("--mic requires building with the `native-audio` feature")
}

#[cfg(feature = "native-audio")]
fn speaker() -> anyhow::Result<Arc<dyn AudioSink>> {
    let sink = voice_agent::devices::SpeakerSink::open().context("Failed to open speaker")?;
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "native-audio"))]
fn speaker() -> anyhow::Result<Arc<dyn AudioSink>> {
    anyhow::bail!("--speaker requires building with the `native-audio` feature")
}

async fn talk(config: &Config, args: TalkArgs) -> anyhow::Result<()> {
    let capture: Arc<dyn AudioCapture> = match args.input {
        Some(path) if !args.mic => Arc::new(WavFileCapture::new(path)),
        _ => microphone()?,
    };
    let sink: Arc<dyn AudioSink> = match args.output_dir {
        Some(dir) if !args.speaker => Arc::new(
            WavDirSink::new(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?,
        ),
        _ => speaker()?,
    };

    let session = ConversationSession::with_websocket(config.session_config(), capture, sink);
    let settings = SupervisorSettings::from(config);
    info!(
        agent_id = config.agent_id.as_deref().unwrap_or(""),
        max_conversation = ?settings.max_conversation,
        "Starting conversation"
    );

    let outcome = run_conversation(&session, &settings, shutdown_signal())
        .await
        .context("Conversation failed")?;
    let state = session.state();
    info!(?outcome, conversation_id = ?state.conversation_id, "Conversation finished");
    Ok(())
}

async fn check(config: &Config) -> anyhow::Result<()> {
    let api_key = config.require_api_key()?;
    let client = reqwest::Client::new();
    let user = check_api_key(&client, &config.api_url, api_key).await?;
    info!(
        user = user.first_name.as_deref().unwrap_or("Unknown"),
        tier = user
            .subscription
            .as_ref()
            .and_then(|s| s.tier.as_deref())
            .unwrap_or("unknown"),
        "API key valid"
    );

    check_websocket(&WsConnector, &config.session_config()).await?;
    info!("All checks passed");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded.");

    // --- 3. Run Command ---
    match cli.command {
        Command::Talk(args) => talk(&config, args).await,
        Command::Check => check(&config).await,
    }
}
