//! Device enumeration and change tracking

use super::capture::CaptureBackend;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Capture or playback device snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier (`input:<name>` / `output:<name>` for cpal)
    pub id: String,

    /// Display name
    pub label: String,

    pub kind: DeviceKind,

    pub is_default: bool,
}

/// Direction of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Capture,
    Playback,
}

/// A window or application that can be captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureTarget {
    /// `app:<pid>:<binary>`
    pub id: String,

    /// Display name
    pub name: String,
}

/// Outcome of a re-enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRefresh {
    Unchanged,
    Changed(Vec<Device>),
}

/// Tracks the current device list.
///
/// The snapshot is replaced wholesale on every successful enumeration and
/// left untouched when enumeration fails.
pub struct DeviceManager {
    backend: Arc<dyn CaptureBackend>,
    devices: Vec<Device>,
    permission_granted: bool,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            devices: Vec::new(),
            permission_granted: false,
        }
    }

    /// Request capture permission (once), then enumerate.
    pub fn initialize(&mut self) -> Result<DeviceRefresh> {
        if !self.permission_granted {
            self.backend.request_permission()?;
            self.permission_granted = true;
            log::info!("Capture permission granted");
        }
        self.refresh_devices()
    }

    pub fn permission_granted(&self) -> bool {
        self.permission_granted
    }

    /// Re-enumerate and report whether the set of device ids changed.
    pub fn refresh_devices(&mut self) -> Result<DeviceRefresh> {
        let fresh = self.backend.enumerate_devices()?;

        let before: BTreeSet<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        let after: BTreeSet<&str> = fresh.iter().map(|d| d.id.as_str()).collect();
        let changed = before != after;

        self.devices = fresh;
        if changed {
            log::info!("Device list changed ({} devices)", self.devices.len());
            Ok(DeviceRefresh::Changed(self.devices.clone()))
        } else {
            Ok(DeviceRefresh::Unchanged)
        }
    }

    /// Poll the platform's hardware-change hint.
    pub fn hardware_changed(&self) -> bool {
        self.backend.hardware_changed()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn input_devices(&self) -> Vec<Device> {
        self.of_kind(DeviceKind::Capture)
    }

    pub fn output_devices(&self) -> Vec<Device> {
        self.of_kind(DeviceKind::Playback)
    }

    pub fn default_input_device(&self) -> Option<Device> {
        self.devices
            .iter()
            .find(|d| d.kind == DeviceKind::Capture && d.is_default)
            .cloned()
    }

    fn of_kind(&self, kind: DeviceKind) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::testing::MemoryBackend;

    fn manager(backend: &MemoryBackend) -> DeviceManager {
        DeviceManager::new(Arc::new(backend.clone()))
    }

    #[test]
    fn initialize_enumerates_after_permission() {
        let backend = MemoryBackend::new();
        let mut devices = manager(&backend);

        let refresh = devices.initialize().unwrap();
        assert!(matches!(refresh, DeviceRefresh::Changed(ref list) if list.len() == 3));
        assert!(devices.permission_granted());
        assert_eq!(devices.input_devices().len(), 2);
        assert_eq!(devices.output_devices().len(), 1);
        assert_eq!(devices.default_input_device().unwrap().id, "input:Built-in Mic");
    }

    #[test]
    fn permission_denied_is_reported() {
        let backend = MemoryBackend::new();
        backend.deny_permission();
        let mut devices = manager(&backend);

        let err = devices.initialize().unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied(_)));
        assert!(devices.devices().is_empty());
    }

    #[test]
    fn refresh_reports_change_only_when_id_set_differs() {
        let backend = MemoryBackend::new();
        let mut devices = manager(&backend);
        devices.initialize().unwrap();

        assert_eq!(devices.refresh_devices().unwrap(), DeviceRefresh::Unchanged);

        backend.add_device(Device {
            id: "input:USB Interface".into(),
            label: "USB Interface".into(),
            kind: DeviceKind::Capture,
            is_default: false,
        });
        assert!(matches!(
            devices.refresh_devices().unwrap(),
            DeviceRefresh::Changed(_)
        ));
        assert_eq!(devices.input_devices().len(), 3);
    }

    #[test]
    fn failed_enumeration_keeps_last_snapshot() {
        let backend = MemoryBackend::new();
        let mut devices = manager(&backend);
        devices.initialize().unwrap();
        let snapshot = devices.devices().to_vec();

        backend.fail_enumeration(true);
        assert!(matches!(
            devices.refresh_devices(),
            Err(EngineError::EnumerationFailed(_))
        ));
        assert_eq!(devices.devices(), snapshot.as_slice());
    }
}
