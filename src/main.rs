use realtime_voice_bridge::{BridgeConfig, TranscriptionContext, VoiceBridgeBuilder};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

async fn announce_transcript(ctx: TranscriptionContext, _state: Arc<()>) {
    info!("[Main] Heard: {}", ctx.transcript);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("[Main] Logger initialized.");

    let config = BridgeConfig::from_env()?;
    let (supervisor, handle) = VoiceBridgeBuilder::<()>::new(config)
        .on_transcription(announce_transcript)
        .build()?;

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[Main] Ctrl+C. Shutting down...");
            stopper.stop();
        }
    });

    info!("[Main] Voice assistant running. Ctrl+C to exit.");
    supervisor.run().await?;
    info!("[Main] Stopped in state {:?}.", handle.state());
    Ok(())
}
