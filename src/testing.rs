//! In-memory capture backend for tests
//!
//! Streams open immediately and audio is pushed by hand through the real
//! conditioning graph of every open stream.

use crate::audio::capture::{
    CaptureBackend, CaptureStream, PendingStream, StreamRequest, TrackInfo, TrackKind,
};
use crate::audio::devices::{CaptureTarget, Device, DeviceKind};
use crate::audio::graph::SharedGraph;
use crate::config::CaptureType;
use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

const AUDIO_TRACK: usize = 0;
const VIDEO_TRACK: usize = 1;

/// What happened to one opened stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamLog {
    pub stopped_tracks: Vec<usize>,
    pub suspended: bool,
    pub stopped: bool,
}

struct OpenedStream {
    request: StreamRequest,
    graph: SharedGraph,
    log: Arc<Mutex<StreamLog>>,
}

struct State {
    devices: Vec<Device>,
    targets: Vec<CaptureTarget>,
    deny_permission: bool,
    fail_enumeration: bool,
    enumerations: usize,
    hardware_changed: bool,
    sample_rate: u32,
    audio_track: bool,
    video_track: bool,
    open_error: Option<EngineError>,
    opened: Vec<OpenedStream>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let device = |id: &str, kind, is_default| Device {
            id: id.to_string(),
            label: id.split_once(':').map(|(_, name)| name).unwrap_or(id).to_string(),
            kind,
            is_default,
        };
        Self {
            state: Arc::new(Mutex::new(State {
                devices: vec![
                    device("input:Built-in Mic", DeviceKind::Capture, true),
                    device("input:Line In", DeviceKind::Capture, false),
                    device("output:Speakers", DeviceKind::Playback, true),
                ],
                targets: Vec::new(),
                deny_permission: false,
                fail_enumeration: false,
                enumerations: 0,
                hardware_changed: false,
                sample_rate: 48000,
                audio_track: true,
                video_track: false,
                open_error: None,
                opened: Vec::new(),
            })),
        }
    }

    pub fn deny_permission(&self) {
        self.state.lock().deny_permission = true;
    }

    pub fn add_device(&self, device: Device) {
        self.state.lock().devices.push(device);
    }

    pub fn remove_device(&self, id: &str) {
        self.state.lock().devices.retain(|d| d.id != id);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state.lock().fail_enumeration = fail;
    }

    pub fn signal_hardware_change(&self) {
        self.state.lock().hardware_changed = true;
    }

    /// Application targets that can be opened.
    pub fn set_targets(&self, targets: Vec<CaptureTarget>) {
        self.state.lock().targets = targets;
    }

    /// Choose which tracks new streams carry.
    pub fn set_tracks(&self, audio: bool, video: bool) {
        let mut state = self.state.lock();
        state.audio_track = audio;
        state.video_track = video;
    }

    /// Make the next opens resolve to `error`.
    pub fn fail_open(&self, error: Option<EngineError>) {
        self.state.lock().open_error = error;
    }

    /// Push mono samples into every running stream.
    pub fn push(&self, samples: &[f32]) {
        let state = self.state.lock();
        for opened in &state.opened {
            let log = opened.log.lock();
            if !log.stopped && !log.suspended {
                opened.graph.push_samples(samples);
            }
        }
    }

    pub fn enumeration_count(&self) -> usize {
        self.state.lock().enumerations
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opened.len()
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .opened
            .iter()
            .filter(|o| !o.log.lock().stopped)
            .count()
    }

    pub fn stream_log(&self, index: usize) -> Option<StreamLog> {
        self.state
            .lock()
            .opened
            .get(index)
            .map(|o| o.log.lock().clone())
    }

    pub fn last_request(&self) -> Option<StreamRequest> {
        self.state.lock().opened.last().map(|o| o.request.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for MemoryBackend {
    fn request_permission(&self) -> Result<()> {
        if self.state.lock().deny_permission {
            Err(EngineError::PermissionDenied("denied by user".to_string()))
        } else {
            Ok(())
        }
    }

    fn enumerate_devices(&self) -> Result<Vec<Device>> {
        let mut state = self.state.lock();
        state.enumerations += 1;
        if state.fail_enumeration {
            Err(EngineError::EnumerationFailed("backend unavailable".to_string()))
        } else {
            Ok(state.devices.clone())
        }
    }

    fn capture_targets(&self) -> Vec<CaptureTarget> {
        self.state.lock().targets.clone()
    }

    fn hardware_changed(&self) -> bool {
        std::mem::take(&mut self.state.lock().hardware_changed)
    }

    fn open_stream(&self, request: StreamRequest, graph: SharedGraph) -> Result<PendingStream> {
        let mut state = self.state.lock();
        if request.capture_type == CaptureType::Application {
            let known = request
                .target_id
                .as_deref()
                .is_some_and(|id| state.targets.iter().any(|t| t.id == id));
            if !known {
                return Err(EngineError::DeviceUnavailable(format!(
                    "capture target {:?} is not available",
                    request.target_id
                )));
            }
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let _ = ready_tx.send(match &state.open_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.sample_rate),
        });

        let mut tracks = Vec::new();
        if state.audio_track {
            tracks.push(TrackInfo {
                id: AUDIO_TRACK,
                kind: TrackKind::Audio,
            });
        }
        if state.video_track {
            tracks.push(TrackInfo {
                id: VIDEO_TRACK,
                kind: TrackKind::Video,
            });
        }

        let log = Arc::new(Mutex::new(StreamLog::default()));
        state.opened.push(OpenedStream {
            request,
            graph,
            log: log.clone(),
        });

        Ok(PendingStream {
            stream: Box::new(MemoryStream { tracks, log }),
            ready: ready_rx,
        })
    }
}

struct MemoryStream {
    tracks: Vec<TrackInfo>,
    log: Arc<Mutex<StreamLog>>,
}

impl CaptureStream for MemoryStream {
    fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks.clone()
    }

    fn stop_track(&mut self, track_id: usize) {
        self.tracks.retain(|t| t.id != track_id);
        self.log.lock().stopped_tracks.push(track_id);
    }

    fn suspend(&mut self) -> Result<()> {
        self.log.lock().suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.log.lock().suspended = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.tracks.clear();
        self.log.lock().stopped = true;
    }
}
