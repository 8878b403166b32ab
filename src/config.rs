//! Engine, analyzer and normalization configuration
//!
//! Every struct here is fully populated: defaults are applied once when the
//! value is built, so downstream code never re-resolves optional fields.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Smallest FFT size accepted by the spectral primitive
pub const MIN_FFT_SIZE: usize = 32;

/// Largest FFT size accepted by the spectral primitive
pub const MAX_FFT_SIZE: usize = 32768;

/// Device id that resolves to the platform default device
pub const DEFAULT_DEVICE_ID: &str = "default";

/// Check that `fft_size` is a power of two in `[MIN_FFT_SIZE, MAX_FFT_SIZE]`.
pub fn validate_fft_size(fft_size: usize) -> Result<()> {
    if fft_size.is_power_of_two() && (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
        Ok(())
    } else {
        Err(EngineError::InvalidConfig(format!(
            "fft size must be a power of two between {} and {}, got {}",
            MIN_FFT_SIZE, MAX_FFT_SIZE, fft_size
        )))
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Requested capture sample rate in Hz
    pub sample_rate: u32,

    /// Requested capture channel count (down-mixed to mono for analysis)
    pub channel_count: u16,

    /// Ask the platform for echo cancellation
    pub echo_cancellation: bool,

    /// Ask the platform for noise suppression
    pub noise_suppression: bool,

    /// Ask the platform for automatic gain control
    pub auto_gain_control: bool,

    /// Frame driver interval in milliseconds (~60fps)
    pub frame_interval_ms: u64,

    /// How often the device list is re-enumerated. Between polls a change is
    /// only seen early when a backend raises its hardware hint; the cpal
    /// backend does so when a running stream loses its device.
    pub device_poll_interval_ms: u64,

    /// Normalized spectrum level (0-1) at which a `peak` event is emitted
    pub peak_threshold: f32,

    /// Threshold multiplier used by the frame driver's beat events
    pub beat_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channel_count: 2,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            frame_interval_ms: 16,
            device_poll_interval_ms: 2000,
            peak_threshold: 0.95,
            beat_threshold: 1.5,
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON configuration; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channel_count == 0 {
            return Err(EngineError::InvalidConfig(
                "sample rate and channel count must be non-zero".to_string(),
            ));
        }
        if self.frame_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "frame interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a source captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureType {
    /// Input device (microphone, line in)
    Microphone,

    /// Full desktop audio (loopback)
    Desktop,

    /// A single application window
    Application,
}

impl CaptureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Desktop => "desktop",
            Self::Application => "application",
        }
    }
}

/// Window applied to each frame before the FFT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    Blackman,
    Hann,
    Hamming,
    Rectangular,
}

impl WindowFunction {
    /// Window coefficients for a frame of `size` samples.
    pub fn coefficients(&self, size: usize) -> Vec<f32> {
        use std::f32::consts::PI;
        let n = size as f32;
        (0..size)
            .map(|i| {
                let x = i as f32 / n;
                match self {
                    // Same definition as a browser analyser node (alpha = 0.16)
                    Self::Blackman => {
                        0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
                    }
                    Self::Hann => 0.5 * (1.0 - (2.0 * PI * x).cos()),
                    Self::Hamming => 0.54 - 0.46 * (2.0 * PI * x).cos(),
                    Self::Rectangular => 1.0,
                }
            })
            .collect()
    }
}

/// Per-analyzer FFT configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// FFT size, power of two in 32..=32768
    pub fft_size: usize,

    /// Temporal smoothing of the magnitude spectrum (0-1)
    pub smoothing_time_constant: f32,

    /// Linear gain of the shared gain stage
    pub gain: f32,

    /// Level mapped to byte value 0
    pub min_decibels: f32,

    /// Level mapped to byte value 255
    pub max_decibels: f32,

    pub window_function: WindowFunction,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing_time_constant: 0.8,
            gain: 1.0,
            min_decibels: -100.0,
            max_decibels: -30.0,
            window_function: WindowFunction::Blackman,
        }
    }
}

impl AnalyzerConfig {
    /// Number of magnitude bins (`fft_size / 2`)
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn validate(&self) -> Result<()> {
        validate_fft_size(self.fft_size)?;
        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(EngineError::InvalidConfig(format!(
                "smoothing time constant must be within [0, 1], got {}",
                self.smoothing_time_constant
            )));
        }
        if !self.min_decibels.is_finite()
            || !self.max_decibels.is_finite()
            || self.min_decibels >= self.max_decibels
        {
            return Err(EngineError::InvalidConfig(format!(
                "min decibels ({}) must be below max decibels ({})",
                self.min_decibels, self.max_decibels
            )));
        }
        if !self.gain.is_finite() || self.gain < 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "gain must be a finite non-negative number, got {}",
                self.gain
            )));
        }
        Ok(())
    }

    /// Produce the config that results from applying `patch`, validated.
    pub fn patched(&self, patch: &AnalyzerConfigPatch) -> Result<Self> {
        let next = Self {
            fft_size: patch.fft_size.unwrap_or(self.fft_size),
            smoothing_time_constant: patch
                .smoothing_time_constant
                .unwrap_or(self.smoothing_time_constant),
            gain: patch.gain.unwrap_or(self.gain),
            min_decibels: patch.min_decibels.unwrap_or(self.min_decibels),
            max_decibels: patch.max_decibels.unwrap_or(self.max_decibels),
            window_function: patch.window_function.unwrap_or(self.window_function),
        };
        next.validate()?;
        Ok(next)
    }
}

/// Partial analyzer update; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfigPatch {
    pub fft_size: Option<usize>,
    pub smoothing_time_constant: Option<f32>,
    pub gain: Option<f32>,
    pub min_decibels: Option<f32>,
    pub max_decibels: Option<f32>,
    pub window_function: Option<WindowFunction>,
}

impl From<&AnalyzerConfig> for AnalyzerConfigPatch {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            fft_size: Some(config.fft_size),
            smoothing_time_constant: Some(config.smoothing_time_constant),
            gain: Some(config.gain),
            min_decibels: Some(config.min_decibels),
            max_decibels: Some(config.max_decibels),
            window_function: Some(config.window_function),
        }
    }
}

/// Adaptive volume normalization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// RMS level the controller steers toward
    pub target_level: f32,

    pub min_gain: f32,
    pub max_gain: f32,

    /// Per-frame smoothing coefficient used when the gain target rises
    pub attack_time: f32,

    /// Per-frame smoothing coefficient used when the gain target falls
    pub release_time: f32,

    /// RMS history length in frames (~0.5s at 60fps)
    pub history_size: usize,

    /// Insert a dynamics compressor ahead of the analysis tap
    pub compressor_enabled: bool,

    /// Compressor threshold in dBFS
    pub compressor_threshold: f32,

    /// Compressor ratio (n:1)
    pub compressor_ratio: f32,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            target_level: 0.3,
            min_gain: 0.1,
            max_gain: 10.0,
            attack_time: 0.1,
            release_time: 0.05,
            history_size: 30,
            compressor_enabled: true,
            compressor_threshold: -24.0,
            compressor_ratio: 4.0,
        }
    }
}

impl NormalizationConfig {
    pub fn validate(&self) -> Result<()> {
        let finite = [
            self.target_level,
            self.min_gain,
            self.max_gain,
            self.attack_time,
            self.release_time,
            self.compressor_threshold,
            self.compressor_ratio,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(EngineError::InvalidConfig(
                "normalization values must be finite".to_string(),
            ));
        }
        if self.min_gain <= 0.0 || self.min_gain > self.max_gain {
            return Err(EngineError::InvalidConfig(format!(
                "normalization gain range [{}, {}] is empty",
                self.min_gain, self.max_gain
            )));
        }
        if self.target_level <= 0.0 || self.history_size == 0 || self.compressor_ratio < 1.0 {
            return Err(EngineError::InvalidConfig(
                "normalization target, history size and compressor ratio must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Options accepted when creating an analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateAnalyzerOptions {
    pub device_id: String,
    pub capture_type: CaptureType,
    /// Window/application target for `CaptureType::Application`
    pub capture_target_id: Option<String>,
    pub fft_size: usize,
    pub smoothing_time_constant: f32,
    pub gain: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub window_function: WindowFunction,
    pub normalization_enabled: bool,
    pub normalization_config: NormalizationConfig,
    pub label: Option<String>,
}

impl Default for CreateAnalyzerOptions {
    fn default() -> Self {
        let analyzer = AnalyzerConfig::default();
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            capture_type: CaptureType::Microphone,
            capture_target_id: None,
            fft_size: analyzer.fft_size,
            smoothing_time_constant: analyzer.smoothing_time_constant,
            gain: analyzer.gain,
            min_decibels: analyzer.min_decibels,
            max_decibels: analyzer.max_decibels,
            window_function: analyzer.window_function,
            normalization_enabled: false,
            normalization_config: NormalizationConfig::default(),
            label: None,
        }
    }
}

impl CreateAnalyzerOptions {
    /// The analyzer config these options describe, validated.
    pub fn analyzer_config(&self) -> Result<AnalyzerConfig> {
        let config = AnalyzerConfig {
            fft_size: self.fft_size,
            smoothing_time_constant: self.smoothing_time_constant,
            gain: self.gain,
            min_decibels: self.min_decibels,
            max_decibels: self.max_decibels,
            window_function: self.window_function,
        };
        config.validate()?;
        if self.normalization_enabled {
            self.normalization_config.validate()?;
        }
        Ok(config)
    }
}
