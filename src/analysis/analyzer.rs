//! Per-analyzer state: spectral read, derived metrics, beat/BPM, percussion
//! detectors and normalization.
//!
//! An analyzer only reads its source's conditioning graph. The normalization
//! gain it computes is handed back through `take_normalization_gain` for the
//! owning source to apply.

use super::bands::{self, FrequencyBands, FrequencyRange, RangeMode};
use super::beat::{bass_energy, BeatDetector, BeatResult, BpmEstimate, BpmEstimator};
use super::normalization::{NormalizationController, NormalizationState};
use super::percussion::{PercussionConfig, PercussionDetector, PercussionKind, PercussionResult};
use crate::audio::features::FeatureExtractor;
use crate::audio::graph::GraphView;
use crate::audio::spectrum::SpectralAnalyser;
use crate::clock::Clock;
use crate::config::{AnalyzerConfig, AnalyzerConfigPatch, NormalizationConfig};
use crate::error::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// One immutable read of an analyzer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerData {
    /// Read time in milliseconds
    pub timestamp: f64,
    pub sample_rate: u32,
    pub fft_size: usize,
    pub frequency_bin_count: usize,

    /// Byte-mapped magnitude spectrum (0-255)
    pub frequency_data: Vec<u8>,
    /// Magnitude spectrum in dB
    pub float_frequency_data: Vec<f32>,
    /// Time-domain frame as bytes (128 = silence)
    pub time_domain_data: Vec<u8>,
    /// Time-domain frame as samples (-1 to 1)
    pub float_time_domain_data: Vec<f32>,
    /// `frequency_data / 255`
    pub normalized_frequency_data: Vec<f32>,
    /// `time_domain_data / 255`
    pub normalized_time_domain_data: Vec<f32>,

    /// Mean of the normalized spectrum
    pub average_amplitude: f32,
    pub peak_bin: usize,
    /// Frequency of `peak_bin` in Hz
    pub peak_frequency: f32,
    /// Normalized spectrum value at `peak_bin`
    pub peak_level: f32,
    /// RMS of the time-domain frame
    pub rms: f32,
}

pub struct Analyzer {
    id: String,
    source_id: String,
    label: Option<String>,
    view: GraphView,
    clock: Arc<dyn Clock>,
    config: AnalyzerConfig,

    spectral: SpectralAnalyser,
    extractor: FeatureExtractor,
    frame: Vec<f32>,
    bytes: Vec<u8>,
    decibels: Vec<f32>,
    /// Graph write position of the last spectral read
    last_position: Option<u64>,
    /// Graph write position last fed to normalization
    normalized_position: Option<u64>,

    beat: BeatDetector,
    bpm: BpmEstimator,

    normalization: NormalizationController,
    normalization_enabled: bool,
    pending_gain: Option<f32>,

    detectors: HashMap<String, PercussionDetector>,
}

impl Analyzer {
    /// Build an analyzer over `view`. `config` must already be validated.
    pub fn new(
        id: String,
        source_id: String,
        label: Option<String>,
        view: GraphView,
        clock: Arc<dyn Clock>,
        config: AnalyzerConfig,
        normalization: Option<NormalizationConfig>,
    ) -> Self {
        let bins = config.frequency_bin_count();
        Self {
            spectral: SpectralAnalyser::new(&config),
            extractor: FeatureExtractor::new(),
            frame: vec![0.0; config.fft_size],
            bytes: vec![0; bins],
            decibels: vec![0.0; bins],
            last_position: None,
            normalized_position: None,
            beat: BeatDetector::new(),
            bpm: BpmEstimator::new(),
            normalization_enabled: normalization.is_some(),
            normalization: NormalizationController::new(normalization.unwrap_or_default()),
            pending_gain: None,
            detectors: HashMap::new(),
            id,
            source_id,
            label,
            view,
            clock,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Read the latest frame and rerun the spectrum if the graph has moved
    /// since the last read. Returns the graph write position of the frame.
    fn refresh(&mut self) -> u64 {
        let position = self.view.read_frame(&mut self.frame);
        if self.last_position != Some(position) {
            self.last_position = Some(position);
            self.spectral
                .analyse(&self.frame, &mut self.bytes, &mut self.decibels);
        }
        position
    }

    /// Fresh snapshot of the spectrum, frame and derived metrics. Feeds the
    /// frame RMS into normalization when enabled.
    pub fn get_data(&mut self) -> AnalyzerData {
        let position = self.refresh();
        let sample_rate = self.view.sample_rate();
        let bins = self.bytes.len();

        let normalized_frequency_data: Vec<f32> =
            self.bytes.iter().map(|&b| b as f32 / 255.0).collect();
        let time_domain_data: Vec<u8> = self
            .frame
            .iter()
            .map(|&s| (128.0 * (1.0 + s)).floor().clamp(0.0, 255.0) as u8)
            .collect();
        let normalized_time_domain_data =
            time_domain_data.iter().map(|&b| b as f32 / 255.0).collect();

        let average_amplitude = if bins == 0 {
            0.0
        } else {
            normalized_frequency_data.iter().sum::<f32>() / bins as f32
        };

        // Argmax over dB so saturated bytes do not hide the true peak
        let peak_bin = self
            .decibels
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let peak_frequency = peak_bin as f32 * bands::bin_width(sample_rate, bins);
        let peak_level = normalized_frequency_data
            .get(peak_bin)
            .copied()
            .unwrap_or(0.0);

        let rms = if self.frame.is_empty() {
            0.0
        } else {
            (self.frame.iter().map(|s| s * s).sum::<f32>() / self.frame.len() as f32).sqrt()
        };
        let rms = if rms.is_finite() { rms } else { 0.0 };

        // Any read may have refreshed the spectrum; normalization still sees
        // every new frame once
        if self.normalization_enabled && self.normalized_position != Some(position) {
            self.normalized_position = Some(position);
            let applied = self.view.normalization_gain();
            let raw_rms = if applied > 0.0 { rms / applied } else { rms };
            self.pending_gain = Some(self.normalization.process(raw_rms));
        }

        AnalyzerData {
            timestamp: self.clock.now_ms(),
            sample_rate,
            fft_size: self.config.fft_size,
            frequency_bin_count: bins,
            frequency_data: self.bytes.clone(),
            float_frequency_data: self.decibels.clone(),
            time_domain_data,
            float_time_domain_data: self.frame.clone(),
            normalized_frequency_data,
            normalized_time_domain_data,
            average_amplitude,
            peak_bin,
            peak_frequency,
            peak_level,
            rms,
        }
    }

    /// The seven fixed bands of the current spectrum.
    pub fn frequency_bands(&mut self) -> FrequencyBands {
        self.refresh();
        bands::frequency_bands(&self.bytes, self.view.sample_rate())
    }

    /// Mean normalized magnitude over `[low, high]` Hz.
    pub fn frequency_range(&mut self, low: f32, high: f32) -> f32 {
        self.frequency_range_advanced(low, high, RangeMode::Average)
    }

    pub fn frequency_range_advanced(&mut self, low: f32, high: f32, mode: RangeMode) -> f32 {
        self.refresh();
        bands::frequency_range(&self.bytes, self.view.sample_rate(), low, high, mode)
    }

    /// Evaluate many ranges against one spectral read.
    pub fn frequency_ranges(&mut self, ranges: &[FrequencyRange]) -> Vec<f32> {
        self.refresh();
        let sample_rate = self.view.sample_rate();
        ranges
            .iter()
            .map(|r| {
                bands::frequency_range(&self.bytes, sample_rate, r.low_freq, r.high_freq, r.mode)
            })
            .collect()
    }

    /// Check the current bass energy for a beat; detected beats feed the
    /// BPM estimator.
    pub fn detect_beat(&mut self, threshold: f32) -> BeatResult {
        self.refresh();
        let now = self.clock.now_ms();
        let mut result = self.beat.process(bass_energy(&self.bytes), threshold, now);
        let estimate = if result.detected {
            self.bpm.record_beat(now)
        } else {
            self.bpm.estimate()
        };
        result.bpm = estimate.bpm;
        result.bpm_confidence = estimate.confidence;
        result
    }

    pub fn bpm(&self) -> BpmEstimate {
        self.bpm.estimate()
    }

    pub fn reset_bpm(&mut self) {
        self.bpm.reset();
        self.beat.reset();
    }

    /// Inject a beat at the current time.
    pub fn tap_tempo(&mut self) -> BpmEstimate {
        self.bpm.record_beat(self.clock.now_ms())
    }

    /// Create a named detector, or update an existing one in place.
    pub fn create_percussion_detector(&mut self, id: &str, config: PercussionConfig) -> Result<()> {
        config.validate()?;
        match self.detectors.get_mut(id) {
            Some(detector) => detector.update_config(config),
            None => {
                self.detectors
                    .insert(id.to_string(), PercussionDetector::new(config));
            }
        }
        Ok(())
    }

    pub fn remove_percussion_detector(&mut self, id: &str) -> Result<()> {
        self.detectors
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::UnknownDetector(id.to_string()))
    }

    pub fn reset_percussion(&mut self, id: &str) -> Result<()> {
        let detector = self
            .detectors
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDetector(id.to_string()))?;
        detector.reset();
        Ok(())
    }

    pub fn percussion_detectors(&self) -> impl Iterator<Item = (&str, &PercussionConfig)> {
        self.detectors
            .iter()
            .map(|(id, detector)| (id.as_str(), detector.config()))
    }

    pub fn detect_percussion(&mut self, id: &str) -> Result<PercussionResult> {
        self.poll_detector(id)
            .ok_or_else(|| EngineError::UnknownDetector(id.to_string()))
    }

    fn poll_detector(&mut self, id: &str) -> Option<PercussionResult> {
        let now = self.clock.now_ms();
        if let Some(held) = self.detectors.get(id)?.held(now) {
            return Some(held);
        }

        self.view.read_frame(&mut self.frame);
        let features = self.extractor.extract(&self.frame, self.view.sample_rate());
        let detector = self.detectors.get_mut(id)?;
        Some(detector.process(&features, now))
    }

    /// Poll the detector named after `kind`, creating it with tuned defaults
    /// on first use.
    pub fn detect_kind(&mut self, kind: PercussionKind) -> PercussionResult {
        let id = kind.as_str();
        if !self.detectors.contains_key(id) {
            let detector = PercussionDetector::new(PercussionConfig::for_kind(kind));
            self.detectors.insert(id.to_string(), detector);
        }
        self.poll_detector(id).unwrap_or_default()
    }

    pub fn detect_kick(&mut self) -> PercussionResult {
        self.detect_kind(PercussionKind::Kick)
    }

    pub fn detect_snare(&mut self) -> PercussionResult {
        self.detect_kind(PercussionKind::Snare)
    }

    pub fn detect_hihat(&mut self) -> PercussionResult {
        self.detect_kind(PercussionKind::HiHat)
    }

    pub fn detect_clap(&mut self) -> PercussionResult {
        self.detect_kind(PercussionKind::Clap)
    }

    pub fn detect_tom(&mut self) -> PercussionResult {
        self.detect_kind(PercussionKind::Tom)
    }

    pub fn detect_cymbal(&mut self) -> PercussionResult {
        self.detect_kind(PercussionKind::Cymbal)
    }

    /// Start adapting gain with `config`. The source must rewire its graph
    /// afterwards.
    pub(crate) fn enable_normalization(&mut self, config: NormalizationConfig) -> Result<()> {
        config.validate()?;
        self.normalization = NormalizationController::new(config);
        self.normalization_enabled = true;
        self.normalized_position = None;
        self.pending_gain = None;
        Ok(())
    }

    pub(crate) fn disable_normalization(&mut self) {
        self.normalization.reset();
        self.normalization_enabled = false;
        self.pending_gain = None;
    }

    pub fn normalization_enabled(&self) -> bool {
        self.normalization_enabled
    }

    /// Whether this analyzer asks for a compressor stage
    pub fn wants_compressor(&self) -> bool {
        self.normalization_enabled && self.normalization.config().compressor_enabled
    }

    pub fn normalization_config(&self) -> &NormalizationConfig {
        self.normalization.config()
    }

    pub fn normalization_state(&self) -> NormalizationState {
        NormalizationState {
            enabled: self.normalization_enabled,
            current_gain: self.normalization.current_gain(),
            average_rms: self.normalization.average_rms(),
            config: self.normalization.config().clone(),
        }
    }

    /// Gain computed by the last fresh read, for the source to apply.
    pub(crate) fn take_normalization_gain(&mut self) -> Option<f32> {
        self.pending_gain.take()
    }

    /// Apply a partial update. Buffers are reallocated only when the FFT size
    /// changes. Gain is applied to the shared graph by the owning source.
    pub(crate) fn update_config(&mut self, patch: &AnalyzerConfigPatch) -> Result<AnalyzerConfig> {
        let next = self.config.patched(patch)?;
        if next.fft_size != self.config.fft_size {
            let bins = next.frequency_bin_count();
            self.frame = vec![0.0; next.fft_size];
            self.bytes = vec![0; bins];
            self.decibels = vec![0.0; bins];
            self.last_position = None;
        }
        self.spectral.configure(&next);
        self.config = next;
        Ok(self.config.clone())
    }

    /// Mirror the source's shared gain into this analyzer's config.
    pub(crate) fn sync_gain(&mut self, gain: f32) {
        self.config.gain = gain;
    }
}
