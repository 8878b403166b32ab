//! Platform-specific capture target enumeration
//!
//! Each platform module provides `list_audio_applications()`, enumerating
//! applications currently producing audio so they can be offered as
//! application capture targets. Capture itself goes through cpal.

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
mod linux;

use super::devices::CaptureTarget;

/// Applications that can currently be captured, sorted by name.
pub fn list_capture_targets() -> Vec<CaptureTarget> {
    #[cfg(target_os = "linux")]
    let result = linux::list_audio_applications();

    #[cfg(target_os = "macos")]
    let result = macos::list_audio_applications();

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    let result: Result<Vec<CaptureTarget>, String> = Ok(Vec::new());

    match result {
        Ok(mut targets) => {
            targets.sort_by_key(|t| t.name.to_lowercase());
            targets
        }
        Err(e) => {
            log::warn!("Failed to enumerate audio applications: {}", e);
            Vec::new()
        }
    }
}
