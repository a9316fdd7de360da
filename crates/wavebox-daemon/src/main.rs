use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wavebox_core::config::Config;

use wavebox_daemon::display::{DevicePanel, DisplayDriver, LogPanel};
use wavebox_daemon::engine::{EngineCore, EngineEvent};
use wavebox_daemon::http::EngineClient;
use wavebox_daemon::input::EncoderCounter;
use wavebox_daemon::{codec, decoder, http, input, net};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup file logging
    let data_dir = wavebox_core::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,wavebox_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("wavebox starting {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Event channel feeding the engine loop
    let (event_tx, event_rx) = mpsc::channel::<EngineEvent>(256);

    // Spawn and connect the decoder, then bridge its events into the engine
    let (decoder_tx, mut decoder_rx) = mpsc::channel::<decoder::DecoderEvent>(64);
    let mut decoder_driver = decoder::DecoderDriver::new(
        config.decoder.binary.clone(),
        config.decoder.socket.clone(),
    );
    let decoder_handle = decoder_driver.spawn_and_connect(decoder_tx).await?;
    decoder_handle.observe_all_properties().await;

    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = decoder_rx.recv().await {
                if event_tx.send(EngineEvent::Decoder(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Hardware codec and status display
    let codec = codec::from_config(&config.hardware);
    let display_driver: Box<dyn DisplayDriver> = if config.display.device.is_empty() {
        Box::new(LogPanel::new(config.display.width, config.display.rows))
    } else {
        Box::new(DevicePanel::new(
            config.display.width,
            config.display.rows,
            config.display.device.clone(),
            config.display.backlight_path.clone(),
        ))
    };

    // Rotary encoder
    let encoder = Arc::new(EncoderCounter::new());
    if !config.hardware.encoder_device.is_empty() {
        input::spawn_reader(
            config.hardware.encoder_device.clone(),
            encoder.clone(),
            event_tx.clone(),
        );
    }

    // Link watcher
    net::spawn_link_watcher(config.network.interface.clone(), event_tx.clone());

    // Build the engine (queries decoder capabilities, restores persisted state)
    let core = EngineCore::new(
        config.clone(),
        decoder_handle,
        codec,
        display_driver,
        encoder,
        event_tx.clone(),
    )
    .await?;

    // Start HTTP control surface if enabled
    let _http_handle = if config.http.enabled {
        Some(http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            EngineClient::new(event_tx.clone()),
        ))
    } else {
        None
    };

    info!("Daemon initialised, running engine loop");
    core.run(event_rx).await?;

    decoder_driver.kill().await;
    Ok(())
}
