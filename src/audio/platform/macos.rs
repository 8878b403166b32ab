//! macOS audio application enumeration
//!
//! macOS has no native per-application capture without a virtual audio
//! driver (BlackHole, Loopback). Applications holding CoreAudio handles are
//! listed so they can be chosen as targets; capture itself uses loopback.

use crate::audio::devices::CaptureTarget;
use std::collections::HashSet;
use std::process::Command;

/// List processes that currently hold CoreAudio handles.
pub fn list_audio_applications() -> Result<Vec<CaptureTarget>, String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg("lsof -c '' 2>/dev/null | grep -i 'coreaudio\\|audioqueue\\|auhal' | awk '{print $1, $2}' | sort -u")
        .output()
        .map_err(|e| e.to_string())?;

    Ok(parse_lsof(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `<process> <pid>` lines, skipping system daemons and duplicates.
fn parse_lsof(stdout: &str) -> Vec<CaptureTarget> {
    let mut seen = HashSet::new();
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?, parts.next()?))
        })
        .filter(|(process, _)| *process != "coreaudiod" && *process != "kernel_task")
        .filter(|(process, _)| seen.insert(process.to_string()))
        .map(|(process, pid)| CaptureTarget {
            id: format!("app:{}:{}", pid, process),
            name: display_name(process),
        })
        .collect()
}

fn display_name(process: &str) -> String {
    let name = process.trim_end_matches(".app");
    let mut chars = name.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_processes_and_skips_daemons() {
        let targets = parse_lsof("coreaudiod 100\nspotify 200\nspotify 201\nmusic.app 300\n");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "app:200:spotify");
        assert_eq!(targets[0].name, "Spotify");
        assert_eq!(targets[1].name, "Music");
    }
}
