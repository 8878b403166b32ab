//! Console monitor: analyzes the default input and logs beats and peaks
//! until Enter is pressed.
//!
//! Usage: `vj-audio-monitor [config.json]`

use std::sync::Arc;
use tokio::sync::mpsc;
use vj_audio_engine::{
    CpalBackend, CreateAnalyzerOptions, EngineConfig, EngineError, EngineEvent, EventKind,
    EventPayload, Manager, Result,
};

fn load_config() -> Result<EngineConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| EngineError::InvalidConfig(format!("{}: {}", path, e)))?;
            EngineConfig::from_json(&json)
        }
        None => Ok(EngineConfig::default()),
    }
}

async fn monitor() -> Result<()> {
    let config = load_config()?;
    let mut manager = Manager::new(config, Arc::new(CpalBackend::new()));
    manager.init()?;

    for device in manager.input_devices() {
        log::info!(
            "Input: {}{}",
            device.label,
            if device.is_default { " (default)" } else { "" }
        );
    }

    let id = manager
        .create_analyzer(CreateAnalyzerOptions {
            label: Some("monitor".to_string()),
            ..Default::default()
        })
        .await?;
    log::info!("Analyzing with {}", id);

    manager.subscribe(
        EventKind::Beat,
        Box::new(|event: &EngineEvent| {
            if let EventPayload::Beat {
                intensity,
                bpm,
                bpm_confidence,
            } = event.payload
            {
                log::info!(
                    "Beat intensity={:.2} bpm={:.1} confidence={:.2}",
                    intensity,
                    bpm,
                    bpm_confidence
                );
            }
        }),
    );
    manager.subscribe(
        EventKind::Peak,
        Box::new(|event: &EngineEvent| {
            if let EventPayload::Peak { level, frequency } = event.payload {
                log::debug!("Peak {:.2} at {:.0} Hz", level, frequency);
            }
        }),
    );
    manager.subscribe(
        EventKind::Error,
        Box::new(|event: &EngineEvent| {
            if let EventPayload::Error { code, message } = &event.payload {
                log::warn!("{:?}: {}", code, message);
            }
        }),
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = shutdown_tx.blocking_send(());
    });

    log::info!("Press Enter to stop");
    manager.run(shutdown_rx).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = monitor().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
