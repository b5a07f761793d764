//! Audio Relay Application
//!
//! Streams the PulseAudio monitor to WebSocket clients and plays client
//! microphones back into the input sink.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_relay::{
    audio::{playback::playback_spec, MicInjector, PulseAudio},
    config::{AppConfig, StreamMode},
    server::RelayServer,
    Relay,
};

#[derive(Parser, Debug)]
#[command(name = "audio-relay", version, about = "Duplex WebSocket audio relay")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Override the stream mode (passthrough, transcoded, dual)
    #[arg(short, long)]
    mode: Option<String>,

    /// Skip PulseAudio sink/source provisioning
    #[arg(long)]
    no_provision: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load_or_default(args.config.as_deref()).context("Failed to load config")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(mode) = &args.mode {
        config.stream.mode = parse_mode(mode)?;
    }
    if args.no_provision {
        config.pulse.provision = false;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Starting audio relay: mode {:?}, encoder {:?}, monitor {}",
        config.stream.mode,
        config.stream.encoder,
        config.audio.monitor_source
    );

    if config.pulse.provision {
        let pulse = PulseAudio::new(&config);
        pulse
            .wait_until_ready(config.pulse.ready_retries)
            .await
            .context("PulseAudio is not available")?;
        pulse.provision(&config.pulse).await;
    }

    let mut relay = Relay::new(config.clone());
    if config.mic.enabled {
        match MicInjector::start(playback_spec(&config), config.mic.queue_depth) {
            Ok(mic) => relay = relay.with_mic(mic),
            Err(e) => tracing::warn!("Mic input disabled: {}", e),
        }
    }
    let relay = Arc::new(relay);

    // Bind before anything streams so a taken port fails fast
    let server = RelayServer::new(relay.clone());
    let listener = server.bind().await.context("Failed to start WebSocket server")?;
    let server_handle = {
        let relay = relay.clone();
        tokio::spawn(server.serve(listener, async move { relay.shutdown_signal().await }))
    };

    let mut pipeline_handle = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run_pipeline().await })
    };

    tracing::info!("Relay running - press Ctrl+C to stop");

    let pipeline_done = tokio::select! {
        _ = shutdown_requested() => {
            tracing::info!("Shutdown requested");
            false
        }
        result = &mut pipeline_handle => {
            match result {
                Ok(Ok(())) => tracing::info!("Stream pipeline finished"),
                Ok(Err(e)) => tracing::error!("Stream pipeline failed: {}", e),
                Err(e) => tracing::error!("Stream pipeline task panicked: {}", e),
            }
            true
        }
    };

    relay.shutdown().await;

    if !pipeline_done {
        if tokio::time::timeout(Duration::from_secs(5), &mut pipeline_handle).await.is_err() {
            tracing::warn!("Stream pipeline did not stop in time");
            pipeline_handle.abort();
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!("Server error: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server did not stop in time"),
    }

    tracing::info!("Goodbye");
    Ok(())
}

fn parse_mode(mode: &str) -> Result<StreamMode> {
    match mode {
        "passthrough" => Ok(StreamMode::Passthrough),
        "transcoded" => Ok(StreamMode::Transcoded),
        "dual" => Ok(StreamMode::Dual),
        other => anyhow::bail!("Unknown stream mode: {}", other),
    }
}

/// Ctrl+C, or SIGTERM on Unix
async fn shutdown_requested() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
