//! Capture-stream acquisition
//!
//! `CaptureBackend` is the platform contract a source opens its stream
//! through. `CpalBackend` implements it with a dedicated thread per stream
//! that owns the `cpal::Stream` and is steered over a command channel.

use super::devices::{CaptureTarget, Device, DeviceKind};
use super::graph::SharedGraph;
use crate::config::{CaptureType, DEFAULT_DEVICE_ID};
use crate::error::{EngineError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

/// What a source asks the platform for
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub device_id: String,
    pub capture_type: CaptureType,
    pub target_id: Option<String>,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Kind of media track a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: usize,
    pub kind: TrackKind,
}

/// An open capture stream whose tracks can be stopped individually
pub trait CaptureStream: Send {
    fn tracks(&self) -> Vec<TrackInfo>;
    fn stop_track(&mut self, track_id: usize);
    fn suspend(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    /// Stop every track and release the stream. Idempotent.
    fn stop(&mut self);
}

/// A stream handle plus the signal that it finished opening.
///
/// `ready` resolves to the sample rate the stream runs at, or the reason it
/// could not be opened.
pub struct PendingStream {
    pub stream: Box<dyn CaptureStream>,
    pub ready: oneshot::Receiver<Result<u32>>,
}

/// Platform capture primitive
pub trait CaptureBackend: Send + Sync {
    /// Ask for capture permission once.
    fn request_permission(&self) -> Result<()>;

    fn enumerate_devices(&self) -> Result<Vec<Device>>;

    /// Window/application capture targets currently available
    fn capture_targets(&self) -> Vec<CaptureTarget>;

    /// True when the platform reported a hardware change since the last call
    fn hardware_changed(&self) -> bool {
        false
    }

    /// Begin opening a stream that pushes mono samples into `graph`.
    fn open_stream(&self, request: StreamRequest, graph: SharedGraph) -> Result<PendingStream>;
}

/// Circular audio buffer
pub struct AudioBuffer {
    samples: Vec<f32>,
    write_pos: usize,
    capacity: usize,
    /// Samples pushed since creation
    written: u64,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: vec![0.0; capacity],
            write_pos: 0,
            capacity,
            written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push_samples(&mut self, data: &[f32]) {
        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
        self.written += data.len() as u64;
    }

    pub fn total_written(&self) -> u64 {
        self.written
    }

    /// Copy the latest `out.len()` samples, oldest first. Requests longer than
    /// the capacity are left-padded with silence.
    pub fn copy_latest(&self, out: &mut [f32]) {
        let count = out.len().min(self.capacity);
        let pad = out.len() - count;
        out[..pad].fill(0.0);

        let start = (self.write_pos + self.capacity - count) % self.capacity;
        for (i, slot) in out[pad..].iter_mut().enumerate() {
            *slot = self.samples[(start + i) % self.capacity];
        }
    }

    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.write_pos = 0;
    }
}

/// Commands sent to a capture thread
enum CaptureCommand {
    Suspend,
    Resume,
    Stop,
}

/// cpal-backed capture
#[derive(Default)]
pub struct CpalBackend {
    /// Set from stream error callbacks when a device disappears
    hardware_hint: Arc<AtomicBool>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Log a stream error and raise the hardware hint if the device went away.
fn note_stream_error(err: &cpal::StreamError, hint: &AtomicBool) {
    log::error!("Audio stream error: {}", err);
    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
        hint.store(true, Ordering::Relaxed);
    }
}

impl CaptureBackend for CpalBackend {
    fn request_permission(&self) -> Result<()> {
        let host = cpal::default_host();
        match host.default_input_device() {
            // Nothing to grant; loopback capture may still work
            None => {
                log::info!("No default input device, skipping permission probe");
                Ok(())
            }
            Some(device) => device
                .default_input_config()
                .map(|_| ())
                .map_err(|e| EngineError::PermissionDenied(e.to_string())),
        }
    }

    fn enumerate_devices(&self) -> Result<Vec<Device>> {
        list_devices(&cpal::default_host())
    }

    fn capture_targets(&self) -> Vec<CaptureTarget> {
        super::platform::list_capture_targets()
    }

    fn hardware_changed(&self) -> bool {
        self.hardware_hint.swap(false, Ordering::Relaxed)
    }

    fn open_stream(&self, request: StreamRequest, graph: SharedGraph) -> Result<PendingStream> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let hint = self.hardware_hint.clone();

        let thread_handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture_thread(request, graph, hint, command_rx, ready_tx))
            .map_err(|e| EngineError::StreamFailed(e.to_string()))?;

        Ok(PendingStream {
            stream: Box::new(CpalStream {
                command_tx,
                thread_handle: Some(thread_handle),
                audio_track_live: true,
            }),
            ready: ready_rx,
        })
    }
}

/// Handle to a stream running on its capture thread
struct CpalStream {
    command_tx: mpsc::Sender<CaptureCommand>,
    thread_handle: Option<JoinHandle<()>>,
    audio_track_live: bool,
}

impl CpalStream {
    fn send(&self, command: CaptureCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::StreamFailed("capture thread has exited".to_string()))
    }
}

impl CaptureStream for CpalStream {
    fn tracks(&self) -> Vec<TrackInfo> {
        if self.audio_track_live {
            vec![TrackInfo {
                id: 0,
                kind: TrackKind::Audio,
            }]
        } else {
            Vec::new()
        }
    }

    fn stop_track(&mut self, track_id: usize) {
        // A cpal stream carries exactly one audio track
        if track_id == 0 {
            self.stop();
        }
    }

    fn suspend(&mut self) -> Result<()> {
        self.send(CaptureCommand::Suspend)
    }

    fn resume(&mut self) -> Result<()> {
        self.send(CaptureCommand::Resume)
    }

    fn stop(&mut self) {
        self.audio_track_live = false;
        let _ = self.command_tx.send(CaptureCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn list_devices(host: &cpal::Host) -> Result<Vec<Device>> {
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let inputs = host
        .input_devices()
        .map_err(|e| EngineError::EnumerationFailed(e.to_string()))?;
    for device in inputs {
        if let Ok(name) = device.name() {
            devices.push(Device {
                id: format!("input:{}", name),
                is_default: default_input.as_deref() == Some(name.as_str()),
                label: name,
                kind: DeviceKind::Capture,
            });
        }
    }

    let outputs = host
        .output_devices()
        .map_err(|e| EngineError::EnumerationFailed(e.to_string()))?;
    for device in outputs {
        if let Ok(name) = device.name() {
            devices.push(Device {
                id: format!("output:{}", name),
                is_default: default_output.as_deref() == Some(name.as_str()),
                label: name,
                kind: DeviceKind::Playback,
            });
        }
    }

    Ok(devices)
}

fn find_named(
    devices: impl Iterator<Item = cpal::Device>,
    name: &str,
) -> Option<cpal::Device> {
    devices
        .into_iter()
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

/// Resolve the cpal device for a request. Returns the device and whether it is
/// captured as a loopback of an output device.
fn resolve_device(host: &cpal::Host, request: &StreamRequest) -> Result<(cpal::Device, bool)> {
    let unavailable = |what: &str| EngineError::DeviceUnavailable(what.to_string());
    let is_default = request.device_id == DEFAULT_DEVICE_ID || request.device_id.is_empty();

    match request.capture_type {
        CaptureType::Microphone => {
            let device = if is_default {
                host.default_input_device()
            } else {
                let name = request.device_id.trim_start_matches("input:");
                host.input_devices()
                    .ok()
                    .and_then(|devices| find_named(devices, name))
            };
            device
                .map(|d| (d, false))
                .ok_or_else(|| unavailable(&request.device_id))
        }
        CaptureType::Desktop => {
            log::info!("Using output device loopback for desktop capture");
            let device = if is_default {
                host.default_output_device()
            } else {
                let name = request.device_id.trim_start_matches("output:");
                host.output_devices()
                    .ok()
                    .and_then(|devices| find_named(devices, name))
            };
            device
                .map(|d| (d, true))
                .ok_or_else(|| unavailable(&request.device_id))
        }
        CaptureType::Application => {
            let target = request
                .target_id
                .as_deref()
                .ok_or_else(|| unavailable("application capture requires a target id"))?;
            let known = super::platform::list_capture_targets()
                .iter()
                .any(|t| t.id == target);
            if !known {
                return Err(unavailable(target));
            }
            log::warn!(
                "Per-application capture not available through cpal, using system loopback for {}",
                target
            );
            host.default_output_device()
                .map(|d| (d, true))
                .ok_or_else(|| unavailable("no output device for loopback"))
        }
    }
}

fn pick_config(
    device: &cpal::Device,
    request: &StreamRequest,
    loopback: bool,
) -> Result<cpal::SupportedStreamConfig> {
    let config_err = |e: String| EngineError::StreamFailed(format!("config: {}", e));

    // For loopback we take what the output device is producing
    if loopback {
        return device
            .default_output_config()
            .map_err(|e| config_err(e.to_string()));
    }

    let wanted = cpal::SampleRate(request.sample_rate);
    if let Ok(ranges) = device.supported_input_configs() {
        let matching = ranges
            .filter(|r| r.min_sample_rate() <= wanted && r.max_sample_rate() >= wanted)
            .min_by_key(|r| r.channels().abs_diff(request.channel_count));
        if let Some(range) = matching {
            return Ok(range.with_sample_rate(wanted));
        }
    }

    log::info!(
        "Requested {} Hz not supported, using device default config",
        request.sample_rate
    );
    device
        .default_input_config()
        .map_err(|e| config_err(e.to_string()))
}

/// Thread body: open, report readiness, then serve commands until stopped.
fn run_capture_thread(
    request: StreamRequest,
    graph: SharedGraph,
    hint: Arc<AtomicBool>,
    command_rx: mpsc::Receiver<CaptureCommand>,
    ready_tx: oneshot::Sender<Result<u32>>,
) {
    let host = cpal::default_host();

    let opened = resolve_device(&host, &request).and_then(|(device, loopback)| {
        open_streams(&host, &device, &request, &graph, &hint, loopback)
    });

    let (stream, monitor, sample_rate) = match opened {
        Ok(streams) => streams,
        Err(e) => {
            log::error!("Capture stream failed to open: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if ready_tx.send(Ok(sample_rate)).is_err() {
        log::info!("Capture request abandoned before it opened");
        return;
    }

    log::info!("Audio capture started ({} Hz)", sample_rate);

    // Block until told otherwise; samples arrive on cpal's callback thread
    loop {
        match command_rx.recv() {
            Ok(CaptureCommand::Suspend) => {
                if let Err(e) = stream.pause() {
                    log::warn!("Failed to suspend capture: {}", e);
                }
                if let Some(ref m) = monitor {
                    let _ = m.pause();
                }
            }
            Ok(CaptureCommand::Resume) => {
                if let Err(e) = stream.play() {
                    log::warn!("Failed to resume capture: {}", e);
                }
                if let Some(ref m) = monitor {
                    let _ = m.play();
                }
            }
            Ok(CaptureCommand::Stop) | Err(_) => break,
        }
    }

    drop(monitor);
    drop(stream);
    log::info!("Audio capture stopped");
}

fn open_streams(
    host: &cpal::Host,
    device: &cpal::Device,
    request: &StreamRequest,
    graph: &SharedGraph,
    hint: &Arc<AtomicBool>,
    loopback: bool,
) -> Result<(cpal::Stream, Option<cpal::Stream>, u32)> {
    if request.echo_cancellation || request.noise_suppression || request.auto_gain_control {
        log::debug!("Voice processing flags are not applied by the cpal backend");
    }

    let config = pick_config(device, request, loopback)?;
    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    log::info!("Audio capture: {} Hz, {} channels", sample_rate, channels);

    // The graph must run at the stream's rate before the first callback
    graph.with_mut(|g| g.set_sample_rate(sample_rate));

    let stream_config: StreamConfig = config.clone().into();
    let input = (graph.clone(), hint.clone());
    let stream = match config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(device, &stream_config, input, channels),
        SampleFormat::I16 => build_stream::<i16>(device, &stream_config, input, channels),
        SampleFormat::U16 => build_stream::<u16>(device, &stream_config, input, channels),
        other => {
            return Err(EngineError::StreamFailed(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| EngineError::StreamFailed(e.to_string()))?;

    stream
        .play()
        .map_err(|e| EngineError::StreamFailed(e.to_string()))?;

    // Monitoring a loopback back into the same output would feed back
    let monitor = if loopback {
        None
    } else {
        build_monitor_stream(host, graph.clone(), sample_rate)
    };

    Ok((stream, monitor, sample_rate))
}

/// Build input stream for given sample type
fn build_stream<T: cpal::Sample + cpal::SizedSample>(
    device: &cpal::Device,
    config: &StreamConfig,
    (graph, hint): (SharedGraph, Arc<AtomicBool>),
    channels: usize,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    let channels = channels.max(1);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    let sum: f32 = frame
                        .iter()
                        .map(|s| <f32 as cpal::Sample>::from_sample(*s))
                        .sum();
                    sum / channels as f32
                })
                .collect();
            graph.push_samples(&mono);
        },
        move |err| note_stream_error(&err, &hint),
        None,
    )
}

/// Output stream on the default device that plays the graph's monitor queue.
fn build_monitor_stream(
    host: &cpal::Host,
    graph: SharedGraph,
    capture_rate: u32,
) -> Option<cpal::Stream> {
    let device = host.default_output_device()?;
    let config = device.default_output_config().ok()?;

    if config.sample_format() != SampleFormat::F32 || config.sample_rate().0 != capture_rate {
        log::warn!(
            "Monitor output unavailable ({:?} at {} Hz, capture at {} Hz)",
            config.sample_format(),
            config.sample_rate().0,
            capture_rate
        );
        return None;
    }

    let channels = (config.channels() as usize).max(1);
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device
        .build_output_stream(
            &config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len() / channels, 0.0);
                graph.fill_monitor(&mut scratch);
                for (frame, &sample) in data.chunks_mut(channels).zip(scratch.iter()) {
                    frame.fill(sample);
                }
            },
            |err| {
                log::error!("Monitor stream error: {}", err);
            },
            None,
        )
        .map_err(|e| log::warn!("Failed to build monitor stream: {}", e))
        .ok()?;

    match stream.play() {
        Ok(()) => Some(stream),
        Err(e) => {
            log::warn!("Failed to start monitor stream: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latest(buffer: &AudioBuffer, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        buffer.copy_latest(&mut out);
        out
    }

    #[test]
    fn copy_latest_returns_recent_samples_in_order() {
        let mut buffer = AudioBuffer::new(8);
        buffer.push_samples(&[1.0, 2.0, 3.0, 4.0]);

        assert_eq!(latest(&buffer, 3), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn circular_buffer_wraps_and_preserves_time_order() {
        let mut buffer = AudioBuffer::new(5);
        buffer.push_samples(&[1.0, 2.0, 3.0]);
        buffer.push_samples(&[4.0, 5.0, 6.0]);

        assert_eq!(latest(&buffer, 5), vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn oversized_request_is_padded_with_silence() {
        let mut buffer = AudioBuffer::new(4);
        buffer.push_samples(&[1.0, 2.0, 3.0, 4.0]);

        assert_eq!(latest(&buffer, 6), vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn clear_resets_to_silence() {
        let mut buffer = AudioBuffer::new(4);
        buffer.push_samples(&[1.0, 2.0]);
        buffer.clear();
        assert_eq!(latest(&buffer, 4), vec![0.0; 4]);
        assert_eq!(buffer.capacity(), 4);
    }

    #[test]
    fn lost_device_raises_the_hardware_hint_once() {
        let backend = CpalBackend::new();
        assert!(!backend.hardware_changed());

        let other = cpal::StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "xrun".to_string(),
            },
        };
        note_stream_error(&other, &backend.hardware_hint);
        assert!(!backend.hardware_changed());

        note_stream_error(&cpal::StreamError::DeviceNotAvailable, &backend.hardware_hint);
        assert!(backend.hardware_changed());
        assert!(!backend.hardware_changed());
    }
}
