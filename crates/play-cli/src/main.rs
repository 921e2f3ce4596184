//! Command-line player on top of `audio-engine`.
//!
//! Opens each input in turn. The next track is queued as soon as the engine reports the end of
//! the current stream, so tracks in the same format play back to back without reopening the
//! device. Ctrl-C stops playback and shuts the engine down cleanly.

mod cli;

use std::collections::VecDeque;

use anyhow::{Context, Result};
use audio_engine::{AudioEngine, EngineConfig, EngineState, Event, Notification};
use clap::Parser;
use crossbeam_channel::select;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,audio_engine=info")),
        )
        .init();

    if args.list_devices {
        let names = audio_engine::output::output_device_names()?;
        for (i, name) in names.iter().enumerate() {
            println!("#{i}: {name}");
        }
        return Ok(());
    }

    let config = build_config(&args)?;
    let engine = AudioEngine::init(config).context("start audio engine")?;
    let notifications = engine.notifications();

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    if let Some(volume) = args.volume {
        engine.post(Event::Volume(volume));
    }

    let mut queue: VecDeque<String> = args.inputs.iter().cloned().collect();
    let Some(first) = queue.pop_front() else {
        return Ok(());
    };
    tracing::info!(input = %first, "playing");
    engine.post(Event::Open(first));
    if let Some(pos) = args.seek {
        engine.post(Event::Seek(pos));
    }

    // The end-of-stream and ready notifications come from different stages, in either order.
    let mut last_ended = false;
    let mut idle = false;
    loop {
        select! {
            recv(stop_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            recv(notifications) -> msg => {
                let Ok(notification) = msg else {
                    break;
                };
                match notification {
                    Notification::Eos => match queue.pop_front() {
                        Some(next) => {
                            tracing::info!(input = %next, "playing");
                            engine.post(Event::Open(next));
                        }
                        None if idle => break,
                        None => last_ended = true,
                    },
                    Notification::Error(message) => {
                        tracing::error!("{message}");
                        match queue.pop_front() {
                            Some(next) => {
                                tracing::info!(input = %next, "playing");
                                engine.post(Event::Open(next));
                            }
                            None => break,
                        }
                    }
                    Notification::State(EngineState::Ready) if last_ended => break,
                    Notification::State(state) => {
                        idle = state == EngineState::Ready;
                        tracing::debug!(?state, "engine state");
                    }
                    Notification::Meta(meta) => tracing::info!(
                        title = meta.title.as_deref().unwrap_or("-"),
                        artist = meta.artist.as_deref().unwrap_or("-"),
                        album = meta.album.as_deref().unwrap_or("-"),
                        "now playing"
                    ),
                    Notification::Time { position, length } => {
                        tracing::debug!(position, length, "position");
                    }
                    Notification::Volume(volume) => tracing::debug!(?volume, "volume"),
                    Notification::Bos => tracing::debug!("stream started"),
                }
            }
        }
    }

    if !engine.exit() {
        anyhow::bail!("engine thread panicked");
    }
    Ok(())
}

fn build_config(args: &cli::Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(output) = args.output {
        config.output.device = output.into();
    }
    if let Some(name) = &args.device {
        config.output.name = Some(name.clone());
    }
    if let Some(seconds) = args.buffer_seconds {
        config.output.buffer_seconds = seconds;
    }
    if let Some(mode) = args.replay_gain {
        config.replay_gain = mode.into();
    }
    if let Some(ms) = args.crossfade_ms {
        config.crossfade_ms = ms;
    }
    Ok(config)
}
