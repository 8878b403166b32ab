//! Linux audio application enumeration
//!
//! Uses `pactl list sink-inputs`, which works with both PulseAudio and
//! PipeWire (through pipewire-pulse). Each sink-input is one application's
//! stream to an output device. Pure ALSA systems have no per-app concept and
//! yield an empty list.

use crate::audio::devices::CaptureTarget;
use std::collections::HashSet;
use std::process::Command;

/// List audio applications currently producing audio.
pub fn list_audio_applications() -> Result<Vec<CaptureTarget>, String> {
    let output = match Command::new("pactl").args(["list", "sink-inputs"]).output() {
        Ok(output) => output,
        Err(_) => {
            log::info!("pactl not installed, per-app capture targets disabled");
            return Ok(Vec::new());
        }
    };

    if !output.status.success() {
        log::info!("pactl not available, per-app capture targets disabled");
        return Ok(Vec::new());
    }

    Ok(parse_sink_inputs(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `pactl list sink-inputs` output, one target per distinct pid.
fn parse_sink_inputs(stdout: &str) -> Vec<CaptureTarget> {
    #[derive(Default)]
    struct Entry {
        name: Option<String>,
        pid: Option<String>,
        binary: Option<String>,
    }

    fn property(line: &str, key: &str) -> Option<String> {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(" = "))
            .map(|value| value.trim_matches('"').to_string())
    }

    let mut targets = Vec::new();
    let mut seen_pids = HashSet::new();
    let mut flush = |entry: &Entry, targets: &mut Vec<CaptureTarget>| {
        if let (Some(name), Some(pid)) = (&entry.name, &entry.pid) {
            if seen_pids.insert(pid.clone()) {
                let binary = entry.binary.as_deref().unwrap_or("unknown");
                targets.push(CaptureTarget {
                    id: format!("app:{}:{}", pid, binary),
                    name: name.clone(),
                });
            }
        }
    };

    let mut current = Entry::default();
    for line in stdout.lines().map(str::trim) {
        if line.starts_with("Sink Input #") {
            flush(&current, &mut targets);
            current = Entry::default();
        } else if let Some(v) = property(line, "application.name") {
            current.name = Some(v);
        } else if let Some(v) = property(line, "application.process.id") {
            current.pid = Some(v);
        } else if let Some(v) = property(line, "application.process.binary") {
            current.binary = Some(v);
        }
    }
    flush(&current, &mut targets);

    targets
}
