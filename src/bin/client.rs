//! Remote Audio Client
//!
//! Connects to the PC server, plays its audio and sends hotkeys typed on stdin.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remote_audio_client::{
    audio::{audio_channels, list_output_devices, AudioSink, CpalSink, PlaybackMultiplexer},
    codec::AudioDecoder,
    config::ClientConfig,
    messages::MessageQueue,
    network::{ConnectionState, LossCounter, Session},
    protocol::{Compression, Modifiers},
};

const HELP: &str = "Commands:
  key <code> [mods]   send a hotkey (mods: ctrl+shift+alt+meta or bits)
  format <level>      request none, 64, 128, 192, 256 or 320 kbps
  mute | unmute       silence local output
  play | stop         start or stop local playback
  connect             reconnect to the server
  quit";

enum Flow {
    Continue,
    Quit,
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

    tracing::info!("Starting remote audio client");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(ClientConfig::default_path)
        .context("no config path given and no config directory available")?;
    let config = ClientConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // List available output devices
    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let (senders, receivers) = audio_channels(config.audio.queue_capacity);
    let loss = LossCounter::default();
    let messages = Arc::new(MessageQueue::default());
    let session = Session::new(
        config.session_config(),
        senders,
        loss.clone(),
        messages.clone(),
    );

    // Decode and playback get their own worker pool
    let playback_runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("playback")
        .worker_threads(2)
        .enable_all()
        .build()
        .context("building playback runtime")?;

    let decoder = AudioDecoder::new(
        config.audio.sample_rate,
        config.audio.channels,
        config.audio.packet_duration_us,
    )?;
    let sink = CpalSink::open(
        config.audio.output_device.as_deref(),
        config.audio.sample_rate,
        config.audio.channels,
    )?;
    let mut playback = PlaybackMultiplexer::new(
        playback_runtime.handle().clone(),
        receivers,
        decoder,
        sink,
        loss,
    )
    .with_concealment(config.audio.concealment);

    let printer = tokio::spawn({
        let messages = messages.clone();
        async move {
            loop {
                let message = messages.next().await;
                println!("[{}] {}", message.id(), message);
            }
        }
    });

    let server_ip = config.server_ip()?;
    let mut state_rx = session.subscribe();
    connect(&session, &config, server_ip).await;

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                on_state_change(state, &session, &mut playback).await;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                match handle_command(line.trim(), &session, &mut playback, &config, server_ip).await {
                    Flow::Continue => {}
                    Flow::Quit => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    session.disconnect().await;
    if let Err(e) = playback.release().await {
        tracing::warn!("Failed to release playback: {}", e);
    }
    printer.abort();
    drop(playback);
    playback_runtime.shutdown_background();

    Ok(())
}

async fn connect(session: &Session, config: &ClientConfig, server_ip: std::net::IpAddr) {
    if let Err(e) = session
        .connect(
            server_ip,
            config.server.port,
            config.server.local_port,
            config.audio.compression,
        )
        .await
    {
        tracing::error!("Failed to connect: {}", e);
    }
}

/// Follow the session: play while connected, stop otherwise
async fn on_state_change<S: AudioSink>(
    state: ConnectionState,
    session: &Session,
    playback: &mut PlaybackMultiplexer<S>,
) {
    tracing::info!(?state, "Connection state changed");
    match state {
        ConnectionState::Connected => {
            session.set_audio_forwarding(true);
            if let Err(e) = playback.start().await {
                tracing::error!("Failed to start playback: {}", e);
            }
        }
        ConnectionState::Disconnected => {
            session.set_audio_forwarding(false);
            if let Err(e) = playback.stop().await {
                tracing::error!("Failed to stop playback: {}", e);
            }
        }
        ConnectionState::Connecting => {}
    }
}

async fn handle_command<S: AudioSink>(
    line: &str,
    session: &Session,
    playback: &mut PlaybackMultiplexer<S>,
    config: &ClientConfig,
    server_ip: std::net::IpAddr,
) -> Flow {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Flow::Continue;
    };

    let result: Result<()> = match command {
        "key" => send_key(session, words.next(), words.next()).await,
        "format" => send_format(session, words.next()).await,
        "mute" => {
            playback.set_muted(true);
            Ok(())
        }
        "unmute" => {
            playback.set_muted(false);
            Ok(())
        }
        "play" => play(session, playback).await,
        "stop" => stop(session, playback).await,
        "connect" => {
            connect(session, config, server_ip).await;
            Ok(())
        }
        "quit" | "exit" => return Flow::Quit,
        "help" => {
            println!("{}", HELP);
            Ok(())
        }
        other => Err(anyhow::anyhow!("unknown command: {}", other)),
    };

    if let Err(e) = result {
        println!("error: {:#}", e);
    }
    Flow::Continue
}

async fn play<S: AudioSink>(
    session: &Session,
    playback: &mut PlaybackMultiplexer<S>,
) -> Result<()> {
    playback.start().await?;
    if session.state() == ConnectionState::Connected {
        session.set_audio_forwarding(true);
    }
    Ok(())
}

/// Nothing drains the audio queues while stopped, so forwarding goes first
async fn stop<S: AudioSink>(
    session: &Session,
    playback: &mut PlaybackMultiplexer<S>,
) -> Result<()> {
    session.set_audio_forwarding(false);
    playback.stop().await?;
    Ok(())
}

async fn send_key(session: &Session, key: Option<&str>, mods: Option<&str>) -> Result<()> {
    let key: u16 = key
        .context("usage: key <code> [mods]")?
        .parse()
        .context("key code must be 0..=65535")?;
    let mods: Modifiers = mods
        .unwrap_or("0")
        .parse()
        .map_err(anyhow::Error::msg)?;
    session.send_hotkey(key, mods).await?;
    Ok(())
}

async fn send_format(session: &Session, level: Option<&str>) -> Result<()> {
    let compression: Compression = level
        .context("usage: format <level>")?
        .parse()
        .map_err(anyhow::Error::msg)?;
    session.send_set_format(compression).await?;
    Ok(())
}
