//! Voxline headless host.
//!
//! Runs one voice call against the loopback connector on the local audio
//! devices: whatever the microphone hears is played back through the
//! scheduler at the model's 24 kHz rate. Ctrl-C hangs up.
//!
//! ```text
//! voxline            run a call with the saved settings
//! voxline devices    print the audio devices as JSON
//! voxline settings   print the effective settings as JSON
//! ```

mod settings;

use anyhow::Context;
use settings::{default_settings_path, load_settings, save_settings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voxline_core::audio::device::{list_devices, recommended_input};
use voxline_core::{CallSession, CpalBackend, LoopbackConnector};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxline=info")),
        )
        .init();

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);

    match std::env::args().nth(1).as_deref() {
        Some("devices") => {
            println!("{}", serde_json::to_string_pretty(&list_devices())?);
            return Ok(());
        }
        Some("settings") => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        Some(other) => anyhow::bail!("unknown command: {other}"),
        None => {}
    }

    info!(path = %settings_path.display(), "Voxline starting");

    if settings.preferred_input_device.is_none() {
        let devices = list_devices();
        if let Some(device) = recommended_input(&devices) {
            info!(device = %device.name, "using recommended input device");
            settings.preferred_input_device = Some(device.name.clone());
            if let Err(e) = save_settings(&settings_path, &settings) {
                warn!("failed to persist settings: {e}");
            }
        }
    }

    let backend = CpalBackend::new()
        .with_input_device(settings.preferred_input_device.clone())
        .with_output_device(settings.preferred_output_device.clone());
    let mut call = CallSession::new(backend, LoopbackConnector::new(), settings.to_call_config());

    spawn_status_logger(&call);

    let cancel = call.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("hang-up requested");
            cancel.cancel();
        }
    });

    call.open()?;
    call.select_voice(settings.voice())?;
    call.start().await.context("call setup failed")?;

    let snapshot = call.run().await;
    info!(
        frames_sent = snapshot.frames_sent,
        chunks_scheduled = snapshot.chunks_scheduled,
        interruptions = snapshot.interruptions,
        "call ended"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Forward status and speaking changes to the log, the way a UI would render
/// them.
fn spawn_status_logger(call: &CallSession<CpalBackend, LoopbackConnector>) {
    let mut status = call.subscribe_status();
    let mut speaking = call.subscribe_speaking();

    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => info!(
                    status = ?event.status,
                    detail = event.detail.as_deref().unwrap_or(""),
                    "call status"
                ),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "status listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match speaking.recv().await {
                Ok(event) => info!(seq = event.seq, speaking = event.speaking, "model speaking"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "speaking listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
