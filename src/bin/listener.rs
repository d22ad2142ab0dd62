//! Listener Application
//!
//! Subscribes to a producer through the relay and plays its stream on the
//! default (or configured) output device.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_relay::{
    audio::{device::list_devices, AudioSink, CpalSink, NullSink, StreamEvent},
    codec::SharedEnhancerConfig,
    config::AppConfig,
    network::{ClientEvent, ListenerClient},
    protocol::CommandType,
    stream::ListenStream,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting audio listener");

    let config = AppConfig::load_or_default()?;
    let target = std::env::args()
        .nth(1)
        .or_else(|| config.client.target_device_id.clone())
        .ok_or_else(|| anyhow!("No producer to listen to: pass a device id or set client.target_device_id"))?;

    println!("\n=== Available Output Devices ===");
    for device in list_devices().iter().filter(|d| d.is_output) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let sink: Box<dyn AudioSink> = match CpalSink::open(config.playback.output_device.as_deref()) {
        Ok(sink) => {
            tracing::info!(
                "Playing on {} ({} Hz, {} ch)",
                sink.device_name(),
                sink.sample_rate(),
                sink.channels()
            );
            Box::new(sink)
        }
        Err(e) => {
            tracing::warn!("No output device ({}), discarding audio", e);
            Box::new(NullSink::paced())
        }
    };

    let mut stream = ListenStream::new(
        target.as_str(),
        &config.playback,
        SharedEnhancerConfig::new(config.enhancer.clone()),
        config.quality,
    );
    let events = stream.events();
    stream.start(sink, None)?;

    let (metrics_task, mut metrics) = stream.spawn_metrics_ticker(config.playback.metrics_tick());
    let mut client = ListenerClient::new(config.client.clone(), target.as_str(), stream.ingest())?.spawn();

    let mut status = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            event = client.next_event() => match event {
                Some(ClientEvent::Registered { .. }) => {
                    client
                        .send_command(&target, CommandType::StartStream, serde_json::json!({}))
                        .await?;
                }
                Some(event) => tracing::debug!("{:?}", event),
                None => break,
            },
            Ok(()) = metrics.changed() => {
                let m = metrics.borrow().clone();
                tracing::info!(
                    "ws={:?} audio={:?} quality={} queue={}/{} underruns={} {:.0} B/s ping={:?}",
                    m.ws_status,
                    m.audio_status,
                    m.quality.map(|q| q.to_string()).unwrap_or_else(|| "-".into()),
                    m.queue_depth,
                    m.queue_capacity,
                    m.underrun_count,
                    m.bytes_per_second,
                    m.ping_ms,
                );
            }
            _ = status.tick() => {
                for event in events.try_iter() {
                    match event {
                        StreamEvent::Error { message } => tracing::error!("Playback failed: {}", message),
                        StreamEvent::Underrun { count } => tracing::debug!("Underrun #{}", count),
                        other => tracing::info!("Stream: {:?}", other),
                    }
                }
            }
        }
    }

    client.shutdown().await?;
    metrics_task.abort();
    stream.stop()?;
    Ok(())
}
