//! Bass-energy beat detection and median-interval BPM estimation

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Rolling bass-energy history (~1s at 60fps)
pub const BEAT_HISTORY_SIZE: usize = 43;

/// Minimum time between two beats
pub const BEAT_COOLDOWN_MS: f64 = 100.0;

/// Default energy-ratio multiplier
pub const DEFAULT_BEAT_THRESHOLD: f32 = 1.5;

/// Share of the lowest spectrum bins treated as bass
const BASS_BIN_FRACTION: usize = 10;

/// Beat timestamps kept for tempo estimation
pub const BPM_HISTORY_SIZE: usize = 20;

const MIN_BEATS_FOR_BPM: usize = 4;
const MIN_INTERVALS_FOR_BPM: usize = 3;

/// Plausible beat spacing: 60-200 BPM
const MIN_INTERVAL_MS: f64 = 300.0;
const MAX_INTERVAL_MS: f64 = 1000.0;

/// Estimates at or below this confidence are not committed
const MIN_COMMIT_CONFIDENCE: f32 = 0.3;

/// Weight of a new raw estimate when blending into the committed BPM
const BPM_SMOOTHING: f32 = 0.3;

/// Result of one beat check
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BeatResult {
    pub detected: bool,
    /// 0-1 strength of the beat
    pub intensity: f32,
    /// Bass RMS of this frame (0-1)
    pub energy: f32,
    /// Rolling mean bass energy before this frame
    pub average_energy: f32,
    pub bpm: f32,
    pub bpm_confidence: f32,
}

/// Current tempo estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BpmEstimate {
    /// Committed BPM, 0 until the first confident estimate
    pub bpm: f32,
    /// Confidence of the most recent evaluation (0-1)
    pub confidence: f32,
    pub beat_count: usize,
}

/// RMS of the lowest ~10% of a byte spectrum, normalized to 0-1.
pub fn bass_energy(spectrum: &[u8]) -> f32 {
    if spectrum.is_empty() {
        return 0.0;
    }
    let count = (spectrum.len() / BASS_BIN_FRACTION).max(1);
    let sum_sq: f32 = spectrum[..count]
        .iter()
        .map(|&b| {
            let v = b as f32 / 255.0;
            v * v
        })
        .sum();
    (sum_sq / count as f32).sqrt()
}

/// Energy-ratio beat detector with a fixed cooldown
#[derive(Debug, Clone, Default)]
pub struct BeatDetector {
    history: VecDeque<f32>,
    last_beat_ms: Option<f64>,
}

impl BeatDetector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(BEAT_HISTORY_SIZE),
            last_beat_ms: None,
        }
    }

    /// Check `energy` against the rolling average. `threshold` values that are
    /// not finite and positive fall back to the default multiplier.
    pub fn process(&mut self, energy: f32, threshold: f32, now_ms: f64) -> BeatResult {
        let threshold = if threshold.is_finite() && threshold > 0.0 {
            threshold
        } else {
            DEFAULT_BEAT_THRESHOLD
        };
        let energy = if energy.is_finite() { energy.max(0.0) } else { 0.0 };

        let average = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f32>() / self.history.len() as f32
        };

        self.history.push_back(energy);
        if self.history.len() > BEAT_HISTORY_SIZE {
            self.history.pop_front();
        }

        let ratio = if average > f32::EPSILON {
            energy / average
        } else {
            0.0
        };
        let cooled = self
            .last_beat_ms
            .map(|last| now_ms - last >= BEAT_COOLDOWN_MS)
            .unwrap_or(true);

        let mut result = BeatResult {
            energy,
            average_energy: average,
            ..Default::default()
        };

        if ratio > threshold && cooled {
            self.last_beat_ms = Some(now_ms);
            result.detected = true;
            result.intensity = (ratio / (2.0 * threshold)).min(1.0);
        }

        result
    }

    pub fn last_beat_ms(&self) -> Option<f64> {
        self.last_beat_ms
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.last_beat_ms = None;
    }
}

/// Tempo from the median of recent inter-beat intervals
#[derive(Debug, Clone, Default)]
pub struct BpmEstimator {
    beat_times: VecDeque<f64>,
    bpm: f32,
    confidence: f32,
    committed: bool,
}

impl BpmEstimator {
    pub fn new() -> Self {
        Self {
            beat_times: VecDeque::with_capacity(BPM_HISTORY_SIZE),
            ..Default::default()
        }
    }

    /// Record a beat and re-evaluate the tempo.
    pub fn record_beat(&mut self, time_ms: f64) -> BpmEstimate {
        if time_ms.is_finite() {
            self.beat_times.push_back(time_ms);
            if self.beat_times.len() > BPM_HISTORY_SIZE {
                self.beat_times.pop_front();
            }
            self.evaluate();
        }
        self.estimate()
    }

    fn evaluate(&mut self) {
        if self.beat_times.len() < MIN_BEATS_FOR_BPM {
            return;
        }

        let mut intervals: Vec<f64> = self
            .beat_times
            .iter()
            .zip(self.beat_times.iter().skip(1))
            .map(|(a, b)| b - a)
            .filter(|i| (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(i))
            .collect();
        if intervals.len() < MIN_INTERVALS_FOR_BPM {
            return;
        }

        intervals.sort_by(|a, b| a.total_cmp(b));
        let mid = intervals.len() / 2;
        let median = if intervals.len() % 2 == 0 {
            (intervals[mid - 1] + intervals[mid]) / 2.0
        } else {
            intervals[mid]
        };
        let raw_bpm = (60000.0 / median) as f32;

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance =
            intervals.iter().map(|i| (i - mean) * (i - mean)).sum::<f64>() / intervals.len() as f64;
        let cv = (variance.sqrt() / mean) as f32;
        let confidence = (1.0 - 5.0 * cv).clamp(0.0, 1.0);
        self.confidence = if confidence.is_finite() { confidence } else { 0.0 };

        if self.confidence > MIN_COMMIT_CONFIDENCE && raw_bpm.is_finite() {
            self.bpm = if self.committed {
                (1.0 - BPM_SMOOTHING) * self.bpm + BPM_SMOOTHING * raw_bpm
            } else {
                raw_bpm
            };
            self.committed = true;
        }
    }

    pub fn estimate(&self) -> BpmEstimate {
        BpmEstimate {
            bpm: self.bpm,
            confidence: self.confidence,
            beat_count: self.beat_times.len(),
        }
    }

    pub fn reset(&mut self) {
        self.beat_times.clear();
        self.bpm = 0.0;
        self.confidence = 0.0;
        self.committed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f32, expected: f32, tolerance: f32) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected} +/- {tolerance}, got {actual}"
        );
    }

    #[test]
    fn bass_energy_uses_lowest_tenth_of_bins() {
        let mut spectrum = vec![0u8; 100];
        spectrum[..10].fill(255);
        assert_approx(bass_energy(&spectrum), 1.0, 1e-6);

        let mut high_only = vec![0u8; 100];
        high_only[10..].fill(255);
        assert_eq!(bass_energy(&high_only), 0.0);
        assert_eq!(bass_energy(&[]), 0.0);
    }

    #[test]
    fn beat_fires_on_energy_spike() {
        let mut detector = BeatDetector::new();
        for i in 0..BEAT_HISTORY_SIZE {
            let r = detector.process(0.1, 1.5, i as f64 * 16.0);
            assert!(!r.detected);
        }
        let r = detector.process(0.4, 1.5, 1000.0);
        assert!(r.detected);
        assert_approx(r.average_energy, 0.1, 1e-5);
        assert!(r.intensity > 0.0 && r.intensity <= 1.0);
    }

    #[test]
    fn beat_respects_cooldown() {
        let mut detector = BeatDetector::new();
        for i in 0..10 {
            detector.process(0.1, 1.5, i as f64 * 16.0);
        }
        assert!(detector.process(0.5, 1.5, 500.0).detected);
        // 50ms later: suppressed by the 100ms cooldown
        assert!(!detector.process(0.9, 1.5, 550.0).detected);
        assert!(detector.process(2.0, 1.5, 601.0).detected);
    }

    #[test]
    fn beat_needs_ratio_above_threshold() {
        let mut detector = BeatDetector::new();
        for i in 0..10 {
            detector.process(0.2, 2.0, i as f64 * 16.0);
        }
        assert!(!detector.process(0.35, 2.0, 500.0).detected);
    }

    #[test]
    fn invalid_threshold_falls_back_to_default() {
        let mut detector = BeatDetector::new();
        detector.process(0.1, f32::NAN, 0.0);
        assert!(detector.process(0.2, f32::NAN, 200.0).detected);
    }

    #[test]
    fn periodic_beats_lock_to_120_bpm() {
        let mut bpm = BpmEstimator::new();
        let mut estimate = BpmEstimate::default();
        for i in 0..6 {
            estimate = bpm.record_beat(i as f64 * 500.0);
        }
        assert_approx(estimate.bpm, 120.0, 2.0);
        assert!(estimate.confidence > 0.3);
        assert_eq!(estimate.beat_count, 6);
    }

    #[test]
    fn jittered_beats_are_not_committed() {
        let mut bpm = BpmEstimator::new();
        let times = [0.0, 500.0, 850.0, 1500.0, 1900.0, 2500.0, 2850.0];
        let mut estimate = BpmEstimate::default();
        for t in times {
            estimate = bpm.record_beat(t);
        }
        assert!(estimate.confidence <= 0.3, "confidence {}", estimate.confidence);
        assert_eq!(estimate.bpm, 0.0);
    }

    #[test]
    fn median_ignores_single_outlier() {
        let mut bpm = BpmEstimator::new();
        // The extra beat at 1250ms leaves two 250ms gaps, both too short to count
        for t in [0.0, 500.0, 1000.0, 1250.0, 1500.0, 2000.0, 2500.0] {
            bpm.record_beat(t);
        }
        assert_approx(bpm.estimate().bpm, 120.0, 2.0);
    }

    #[test]
    fn reset_forgets_committed_tempo() {
        let mut bpm = BpmEstimator::new();
        for i in 0..5 {
            bpm.record_beat(i as f64 * 500.0);
        }
        assert_approx(bpm.estimate().bpm, 120.0, 0.01);

        bpm.reset();
        assert_eq!(bpm.estimate(), BpmEstimate::default());

        // Fresh history after reset commits directly
        for i in 0..5 {
            bpm.record_beat(10_000.0 + i as f64 * 400.0);
        }
        assert_approx(bpm.estimate().bpm, 150.0, 0.01);
    }

    #[test]
    fn beat_history_is_bounded() {
        let mut bpm = BpmEstimator::new();
        for i in 0..50 {
            bpm.record_beat(i as f64 * 500.0);
        }
        assert_eq!(bpm.estimate().beat_count, BPM_HISTORY_SIZE);
    }
}
