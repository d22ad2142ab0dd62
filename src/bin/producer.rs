//! Producer Application
//!
//! Registers this device with the relay and streams microphone audio while
//! listeners ask for it. Pass `--tone` to stream a test tone instead.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_relay::{
    audio::{device::list_devices, FrameSource, MicrophoneSource, ToneSource},
    config::AppConfig,
    network::{identity, ClientEvent, ProducerClient},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting audio producer");

    let config = AppConfig::load_or_default()?;
    let device_id = identity::resolve(config.client.device_id.as_deref())?;
    tracing::info!("Device id: {}", device_id);

    let source: Box<dyn FrameSource> = if std::env::args().any(|a| a == "--tone") {
        Box::new(ToneSource::new(440.0, 0.3))
    } else {
        println!("\n=== Available Input Devices ===");
        for device in list_devices().iter().filter(|d| d.is_input) {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}", device.name, default_marker);
        }
        println!();
        Box::new(MicrophoneSource::new(config.client.input_device.clone()))
    };

    let mut client = ProducerClient::new(config.client.clone(), device_id, source)?.spawn();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            event = client.next_event() => match event {
                Some(ClientEvent::ListenersChanged { listeners }) => {
                    tracing::info!("{} listener(s)", listeners);
                }
                Some(ClientEvent::RecordingChanged(recording)) => {
                    tracing::info!("Recording {}", if recording { "on" } else { "off" });
                }
                Some(event) => tracing::debug!("{:?}", event),
                None => break,
            },
        }
    }

    client.shutdown().await?;
    Ok(())
}
