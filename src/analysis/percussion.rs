//! Transient (percussion) detection
//!
//! Each detector watches one frequency band for onsets. A poll scores the
//! band energy and spectral flux against their rolling averages, weights the
//! score by how well the frame's spectral shape matches the percussion class,
//! and gates the result on warm-up, a noise floor, an onset condition, the
//! threshold and a cooldown. A detection latches for `hold_time_ms`; polls
//! inside the hold return the cached result untouched.
//!
//! The per-class bands, thresholds and feature-match limits are perceptual
//! tuning values.

use super::bands::bin_span;
use crate::audio::features::Features;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Ratio clamp so near-zero averages cannot produce unbounded scores
const MAX_RATIO: f32 = 5.0;

/// Flux weight when spectral flux scoring is enabled / disabled
const FLUX_WEIGHT_BASE: f32 = 0.55;
const FLUX_WEIGHT_BASE_NO_FLUX: f32 = 0.25;
const FLUX_WEIGHT_PER_SENSITIVITY: f32 = 0.45;
const MAX_FLUX_WEIGHT: f32 = 0.9;

/// Score multiplier lost per failed feature check
const TYPE_MISMATCH_PENALTY: f32 = 0.2;
const MIN_TYPE_MATCH: f32 = 0.4;

/// Default rolling history length in frames (~0.7s at 60fps)
pub const DEFAULT_PERCUSSION_HISTORY: usize = 43;

/// Percussion classes with tuned defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercussionKind {
    Kick,
    Snare,
    HiHat,
    Clap,
    Tom,
    Cymbal,
    Custom,
}

impl PercussionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kick => "kick",
            Self::Snare => "snare",
            Self::HiHat => "hihat",
            Self::Clap => "clap",
            Self::Tom => "tom",
            Self::Cymbal => "cymbal",
            Self::Custom => "custom",
        }
    }

    /// Frame RMS at or below which this class never fires.
    pub fn noise_floor(&self) -> f32 {
        match self {
            Self::Kick | Self::Tom => 0.01,
            Self::Snare | Self::Clap => 0.008,
            Self::HiHat | Self::Cymbal => 0.003,
            Self::Custom => 0.005,
        }
    }

    /// How well `features` match the class's spectral signature, in [0.4, 1].
    pub fn type_match(&self, features: &Features) -> f32 {
        let centroid = features.spectral_centroid;
        let flatness = features.spectral_flatness;
        let zcr = features.zcr;

        let checks: [bool; 3] = match self {
            Self::Kick => [centroid < 1500.0, flatness < 0.4, zcr < 0.1],
            Self::Snare => [
                (800.0..=6000.0).contains(&centroid),
                flatness > 0.15,
                zcr > 0.05,
            ],
            Self::HiHat => [centroid > 5000.0, flatness > 0.3, zcr > 0.2],
            Self::Clap => [
                (1000.0..=5000.0).contains(&centroid),
                flatness > 0.25,
                zcr > 0.08,
            ],
            Self::Tom => [centroid < 2500.0, flatness < 0.35, zcr < 0.15],
            Self::Cymbal => [centroid > 4000.0, flatness > 0.35, zcr > 0.15],
            Self::Custom => return 1.0,
        };

        let misses = checks.iter().filter(|ok| !**ok).count() as f32;
        (1.0 - misses * TYPE_MISMATCH_PENALTY).clamp(MIN_TYPE_MATCH, 1.0)
    }
}

/// Second band blended into the energy (snare "snap")
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SecondaryBand {
    pub low_freq: f32,
    pub high_freq: f32,
    /// Blend weight of this band, 0-1
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercussionConfig {
    pub kind: PercussionKind,
    pub low_freq: f32,
    pub high_freq: f32,
    pub secondary: Option<SecondaryBand>,
    /// Score the blended ratio must exceed
    pub threshold: f32,
    /// Minimum time between detections
    pub cooldown_ms: f64,
    /// How long a detection stays latched
    pub hold_time_ms: f64,
    /// 0-1; higher favors flux and lowers the onset and score thresholds
    pub transient_sensitivity: f32,
    /// Rolling history length in frames
    pub history_size: usize,
    pub use_spectral_flux: bool,
}

impl PercussionConfig {
    /// Tuned defaults for a percussion class.
    pub fn for_kind(kind: PercussionKind) -> Self {
        let base = Self {
            kind,
            low_freq: 20.0,
            high_freq: 20000.0,
            secondary: None,
            threshold: 1.5,
            cooldown_ms: 100.0,
            hold_time_ms: 80.0,
            transient_sensitivity: 0.5,
            history_size: DEFAULT_PERCUSSION_HISTORY,
            use_spectral_flux: true,
        };
        match kind {
            PercussionKind::Kick => Self {
                low_freq: 40.0,
                high_freq: 150.0,
                cooldown_ms: 120.0,
                hold_time_ms: 90.0,
                ..base
            },
            PercussionKind::Snare => Self {
                low_freq: 150.0,
                high_freq: 400.0,
                secondary: Some(SecondaryBand {
                    low_freq: 2000.0,
                    high_freq: 6000.0,
                    weight: 0.4,
                }),
                threshold: 1.4,
                ..base
            },
            PercussionKind::HiHat => Self {
                low_freq: 6000.0,
                high_freq: 16000.0,
                threshold: 1.3,
                cooldown_ms: 50.0,
                hold_time_ms: 50.0,
                ..base
            },
            PercussionKind::Clap => Self {
                low_freq: 1200.0,
                high_freq: 4000.0,
                cooldown_ms: 120.0,
                ..base
            },
            PercussionKind::Tom => Self {
                low_freq: 80.0,
                high_freq: 300.0,
                cooldown_ms: 120.0,
                hold_time_ms: 90.0,
                ..base
            },
            PercussionKind::Cymbal => Self {
                low_freq: 5000.0,
                high_freq: 16000.0,
                threshold: 1.35,
                cooldown_ms: 150.0,
                hold_time_ms: 150.0,
                ..base
            },
            PercussionKind::Custom => base,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let band_ok = |low: f32, high: f32| {
            low.is_finite() && high.is_finite() && 0.0 <= low && low < high
        };
        if !band_ok(self.low_freq, self.high_freq) {
            return Err(EngineError::InvalidConfig(format!(
                "percussion band [{}, {}] is not a valid frequency range",
                self.low_freq, self.high_freq
            )));
        }
        if let Some(secondary) = &self.secondary {
            if !band_ok(secondary.low_freq, secondary.high_freq)
                || !(0.0..=1.0).contains(&secondary.weight)
            {
                return Err(EngineError::InvalidConfig(
                    "secondary band needs a valid range and a weight within [0, 1]".to_string(),
                ));
            }
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "percussion threshold must be positive, got {}",
                self.threshold
            )));
        }
        if !self.cooldown_ms.is_finite() || !self.hold_time_ms.is_finite() {
            return Err(EngineError::InvalidConfig(
                "cooldown and hold time must be finite".to_string(),
            ));
        }
        if self.history_size == 0 {
            return Err(EngineError::InvalidConfig(
                "percussion history size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn sensitivity(&self) -> f32 {
        if self.transient_sensitivity.is_finite() {
            self.transient_sensitivity.clamp(0.0, 1.0)
        } else {
            0.5
        }
    }

    /// Frames of history required before the first detection attempt
    fn warm_up(&self) -> usize {
        (self.history_size / 4).clamp(3.min(self.history_size), self.history_size)
    }
}

impl Default for PercussionConfig {
    fn default() -> Self {
        Self::for_kind(PercussionKind::Custom)
    }
}

/// Outcome of one percussion poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercussionResult {
    pub detected: bool,
    /// 0-1 strength of the hit
    pub intensity: f32,
    /// Band energy of the frame
    pub energy: f32,
    /// Rolling mean band energy
    pub average_energy: f32,
    /// Positive spectral flux of the frame
    pub flux: f32,
    /// Rolling mean frame RMS
    pub average_rms: f32,
    /// Type-weighted score compared against the threshold
    pub score: f32,
    /// Poll time in milliseconds
    pub timestamp: f64,
}

pub struct PercussionDetector {
    config: PercussionConfig,
    energy_history: VecDeque<f32>,
    flux_history: VecDeque<f32>,
    rms_history: VecDeque<f32>,
    previous_spectrum: Vec<f32>,
    last_detection_ms: Option<f64>,
    hold_until_ms: f64,
    cached: PercussionResult,
}

impl PercussionDetector {
    /// Build a detector from a validated config.
    pub fn new(config: PercussionConfig) -> Self {
        Self {
            energy_history: VecDeque::with_capacity(config.history_size),
            flux_history: VecDeque::with_capacity(config.history_size),
            rms_history: VecDeque::with_capacity(config.history_size),
            config,
            previous_spectrum: Vec::new(),
            last_detection_ms: None,
            hold_until_ms: f64::NEG_INFINITY,
            cached: PercussionResult::default(),
        }
    }

    pub fn config(&self) -> &PercussionConfig {
        &self.config
    }

    /// Replace the configuration, keeping the rolling histories.
    pub fn update_config(&mut self, config: PercussionConfig) {
        let size = config.history_size;
        for history in [
            &mut self.energy_history,
            &mut self.flux_history,
            &mut self.rms_history,
        ] {
            while history.len() > size {
                history.pop_front();
            }
        }
        self.config = config;
    }

    /// The latched result while `now_ms` is inside the hold window.
    pub fn held(&self, now_ms: f64) -> Option<PercussionResult> {
        (now_ms < self.hold_until_ms).then_some(self.cached)
    }

    /// Score one frame. Inside the hold window the cached result is returned.
    pub fn process(&mut self, features: &Features, now_ms: f64) -> PercussionResult {
        if let Some(cached) = self.held(now_ms) {
            return cached;
        }

        let spectrum = &features.amplitude_spectrum;
        let primary = band_rms(
            spectrum,
            features.bin_width,
            self.config.low_freq,
            self.config.high_freq,
        );
        let energy = match &self.config.secondary {
            Some(secondary) => {
                let snap = band_rms(
                    spectrum,
                    features.bin_width,
                    secondary.low_freq,
                    secondary.high_freq,
                );
                primary * (1.0 - secondary.weight) + snap * secondary.weight
            }
            None => primary,
        };
        let energy = finite_or_zero(energy);

        let flux = finite_or_zero(positive_flux(&self.previous_spectrum, spectrum));
        self.previous_spectrum.clear();
        self.previous_spectrum.extend_from_slice(spectrum);

        let rms = finite_or_zero(features.rms);
        let size = self.config.history_size.max(1);
        push_bounded(&mut self.energy_history, energy, size);
        push_bounded(&mut self.flux_history, flux, size);
        push_bounded(&mut self.rms_history, rms, size);

        let average_energy = mean(&self.energy_history);
        let average_flux = mean(&self.flux_history);
        let average_rms = mean(&self.rms_history);

        let sensitivity = self.config.sensitivity();
        let base = if self.config.use_spectral_flux {
            FLUX_WEIGHT_BASE
        } else {
            FLUX_WEIGHT_BASE_NO_FLUX
        };
        let flux_weight =
            (base + sensitivity * FLUX_WEIGHT_PER_SENSITIVITY).clamp(0.0, MAX_FLUX_WEIGHT);

        let energy_ratio = ratio(energy, average_energy);
        let flux_ratio = ratio(flux, average_flux);
        let score = (energy_ratio * (1.0 - flux_weight) + flux_ratio * flux_weight)
            * self.config.kind.type_match(features);

        let mut result = PercussionResult {
            energy,
            average_energy,
            flux,
            average_rms,
            score,
            timestamp: now_ms,
            ..Default::default()
        };

        let warmed_up = self.energy_history.len() >= self.config.warm_up();
        let audible = rms > self.config.kind.noise_floor();
        let onset = flux > average_flux * (1.5 - 0.6 * sensitivity);
        let effective_threshold = self.config.threshold * (1.1 - 0.2 * sensitivity);
        let cooled = self
            .last_detection_ms
            .map(|last| now_ms - last > self.config.cooldown_ms)
            .unwrap_or(true);

        if warmed_up && audible && onset && score > effective_threshold && cooled {
            result.detected = true;
            result.intensity = (score / (2.0 * effective_threshold)).clamp(0.0, 1.0);
            self.last_detection_ms = Some(now_ms);
            self.hold_until_ms = now_ms + self.config.hold_time_ms.max(0.0);
            self.cached = result;
        }

        result
    }

    pub fn reset(&mut self) {
        self.energy_history.clear();
        self.flux_history.clear();
        self.rms_history.clear();
        self.previous_spectrum.clear();
        self.last_detection_ms = None;
        self.hold_until_ms = f64::NEG_INFINITY;
        self.cached = PercussionResult::default();
    }
}

/// RMS of the amplitude bins whose frequencies fall inside `[low, high]`.
fn band_rms(spectrum: &[f32], bin_width: f32, low: f32, high: f32) -> f32 {
    match bin_span(low, high, bin_width, spectrum.len()) {
        Some((first, last)) => {
            let bins = &spectrum[first..=last];
            (bins.iter().map(|a| a * a).sum::<f32>() / bins.len() as f32).sqrt()
        }
        None => 0.0,
    }
}

/// RMS of positive bin-wise increases; zero without a comparable previous frame.
fn positive_flux(previous: &[f32], current: &[f32]) -> f32 {
    if previous.is_empty() || previous.len() != current.len() {
        return 0.0;
    }
    let sum_sq: f32 = previous
        .iter()
        .zip(current)
        .map(|(p, c)| (c - p).max(0.0))
        .map(|d| d * d)
        .sum();
    (sum_sq / current.len() as f32).sqrt()
}

fn ratio(value: f32, average: f32) -> f32 {
    if average > f32::EPSILON {
        finite_or_zero(value / average).clamp(0.0, MAX_RATIO)
    } else {
        0.0
    }
}

fn push_bounded(history: &mut VecDeque<f32>, value: f32, size: usize) {
    history.push_back(value);
    while history.len() > size {
        history.pop_front();
    }
}

fn mean(history: &VecDeque<f32>) -> f32 {
    if history.is_empty() {
        0.0
    } else {
        history.iter().sum::<f32>() / history.len() as f32
    }
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BINS: usize = 256;
    const BIN_WIDTH: f32 = 93.75; // 48 kHz, 512-sample frame

    fn frame(level: f32, rms: f32) -> Features {
        Features {
            rms,
            zcr: 0.05,
            spectral_centroid: 1000.0,
            spectral_flatness: 0.2,
            amplitude_spectrum: vec![level; BINS],
            bin_width: BIN_WIDTH,
        }
    }

    fn warmed_detector(config: PercussionConfig) -> PercussionDetector {
        let mut detector = PercussionDetector::new(config);
        for i in 0..20 {
            let r = detector.process(&frame(0.1, 0.05), i as f64 * 16.0);
            assert!(!r.detected);
        }
        detector
    }

    #[test]
    fn per_kind_defaults_are_valid() {
        for kind in [
            PercussionKind::Kick,
            PercussionKind::Snare,
            PercussionKind::HiHat,
            PercussionKind::Clap,
            PercussionKind::Tom,
            PercussionKind::Cymbal,
            PercussionKind::Custom,
        ] {
            let config = PercussionConfig::for_kind(kind);
            assert!(config.validate().is_ok(), "{:?}", kind);
            assert_eq!(config.kind, kind);
        }
        let snare = PercussionConfig::for_kind(PercussionKind::Snare);
        assert_eq!(snare.secondary.map(|s| s.weight), Some(0.4));
    }

    #[test]
    fn spike_after_steady_frames_is_detected() {
        let mut detector = warmed_detector(PercussionConfig::default());
        let hit = detector.process(&frame(1.0, 0.5), 400.0);
        assert!(hit.detected);
        assert!(hit.intensity > 0.0 && hit.intensity <= 1.0);
        assert!(hit.energy > hit.average_energy);
    }

    #[test]
    fn hold_returns_cached_result_then_reevaluates() {
        let config = PercussionConfig::default();
        let hold = config.hold_time_ms;
        let mut detector = warmed_detector(config);
        let hit = detector.process(&frame(1.0, 0.5), 400.0);
        assert!(hit.detected);

        // Signal has gone silent, but the hold is still latched
        let held = detector.process(&frame(0.0, 0.0), 400.0 + hold / 2.0);
        assert_eq!(held, hit);

        let after = detector.process(&frame(0.0, 0.0), 400.0 + hold + 1.0);
        assert!(!after.detected);
        assert_eq!(after.timestamp, 400.0 + hold + 1.0);
    }

    #[test]
    fn below_noise_floor_never_detects() {
        let mut detector = PercussionDetector::new(PercussionConfig::default());
        let floor = PercussionKind::Custom.noise_floor();
        for i in 0..100 {
            // Alternate silence and bursts to keep flux and energy ratios high
            let level = if i % 10 == 9 { 5.0 } else { 0.01 };
            let r = detector.process(&frame(level, floor * 0.5), i as f64 * 200.0);
            assert!(!r.detected, "detected at frame {i}");
        }
    }

    #[test]
    fn no_detection_during_warm_up() {
        let mut detector = PercussionDetector::new(PercussionConfig::default());
        detector.process(&frame(0.1, 0.05), 0.0);
        let r = detector.process(&frame(1.0, 0.5), 16.0);
        assert!(!r.detected);
    }

    #[test]
    fn cooldown_blocks_back_to_back_hits() {
        let config = PercussionConfig {
            hold_time_ms: 0.0,
            ..Default::default()
        };
        let mut detector = warmed_detector(config);
        assert!(detector.process(&frame(1.0, 0.5), 400.0).detected);
        detector.process(&frame(0.1, 0.05), 416.0);
        // Within the 100ms cooldown
        assert!(!detector.process(&frame(2.0, 0.5), 450.0).detected);
    }

    #[test]
    fn hihat_signature_is_penalized_for_kick() {
        let hihat_like = Features {
            rms: 0.2,
            zcr: 0.4,
            spectral_centroid: 9000.0,
            spectral_flatness: 0.6,
            amplitude_spectrum: Vec::new(),
            bin_width: BIN_WIDTH,
        };
        assert_eq!(PercussionKind::Kick.type_match(&hihat_like), MIN_TYPE_MATCH);
        assert_eq!(PercussionKind::HiHat.type_match(&hihat_like), 1.0);
        assert_eq!(PercussionKind::Custom.type_match(&hihat_like), 1.0);
    }

    #[test]
    fn secondary_band_is_blended() {
        let mut spectrum = vec![0.0; BINS];
        // Light only the 2-6 kHz snap band
        let (first, last) = bin_span(2000.0, 6000.0, BIN_WIDTH, BINS).unwrap();
        spectrum[first..=last].fill(1.0);
        let features = Features {
            amplitude_spectrum: spectrum,
            ..frame(0.0, 0.1)
        };
        let mut detector =
            PercussionDetector::new(PercussionConfig::for_kind(PercussionKind::Snare));
        let r = detector.process(&features, 0.0);
        assert!((r.energy - 0.4).abs() < 1e-6);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PercussionConfig {
            low_freq: 500.0,
            high_freq: 100.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
