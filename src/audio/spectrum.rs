//! Spectral-analysis primitive
//!
//! Windowed FFT with temporal smoothing, decibel conversion and byte mapping,
//! matching the semantics of a browser analyser node so spectra look the same
//! to downstream visuals.

use crate::config::{AnalyzerConfig, WindowFunction};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Floor for magnitudes before taking the logarithm, keeps dB values finite
const MIN_MAGNITUDE: f32 = 1e-20;

pub struct SpectralAnalyser {
    planner: FftPlanner<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window_function: WindowFunction,
    window: Vec<f32>,
    smoothing_time_constant: f32,
    min_decibels: f32,
    max_decibels: f32,

    scratch: Vec<Complex<f32>>,
    /// Smoothed linear magnitudes, one per bin
    smoothed: Vec<f32>,
}

impl SpectralAnalyser {
    pub fn new(config: &AnalyzerConfig) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.fft_size);
        Self {
            planner,
            fft,
            fft_size: config.fft_size,
            window_function: config.window_function,
            window: config.window_function.coefficients(config.fft_size),
            smoothing_time_constant: config.smoothing_time_constant,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            scratch: vec![Complex::new(0.0, 0.0); config.fft_size],
            smoothed: vec![0.0; config.fft_size / 2],
        }
    }

    /// Apply a new configuration. Buffers are reallocated only when the FFT
    /// size changes; smoothing history survives other updates.
    pub fn configure(&mut self, config: &AnalyzerConfig) {
        if config.fft_size != self.fft_size {
            self.fft_size = config.fft_size;
            self.fft = self.planner.plan_fft_forward(config.fft_size);
            self.scratch = vec![Complex::new(0.0, 0.0); config.fft_size];
            self.smoothed = vec![0.0; config.fft_size / 2];
            self.window = config.window_function.coefficients(config.fft_size);
        } else if config.window_function != self.window_function {
            self.window = config.window_function.coefficients(config.fft_size);
        }
        self.window_function = config.window_function;
        self.smoothing_time_constant = config.smoothing_time_constant;
        self.min_decibels = config.min_decibels;
        self.max_decibels = config.max_decibels;
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Transform one time-domain frame.
    ///
    /// `bytes` receives the 0-255 mapped spectrum and `decibels` the raw dB
    /// values; both must hold `frequency_bin_count()` entries. Frames shorter
    /// than the FFT size are zero-padded.
    pub fn analyse(&mut self, frame: &[f32], bytes: &mut [u8], decibels: &mut [f32]) {
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = frame.get(i).copied().filter(|s| s.is_finite()).unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let norm = 1.0 / self.fft_size as f32;
        let tau = self.smoothing_time_constant;
        let range = self.max_decibels - self.min_decibels;
        let scale = if range > 0.0 { 255.0 / range } else { 0.0 };

        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[k].norm() * norm;
            let mut next = tau * *smoothed + (1.0 - tau) * magnitude;
            if !next.is_finite() {
                next = 0.0;
            }
            *smoothed = next;

            let db = 20.0 * next.max(MIN_MAGNITUDE).log10();
            if let Some(slot) = decibels.get_mut(k) {
                *slot = db;
            }
            if let Some(slot) = bytes.get_mut(k) {
                *slot = (scale * (db - self.min_decibels)).floor().clamp(0.0, 255.0) as u8;
            }
        }
    }

    /// Forget smoothing history.
    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, sample_rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    fn peak_bin(decibels: &[f32]) -> usize {
        decibels
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    #[test]
    fn pure_tone_peaks_within_one_bin() {
        let sample_rate = 48000.0;
        for fft_size in [256, 1024, 4096] {
            let config = AnalyzerConfig {
                fft_size,
                ..Default::default()
            };
            let mut analyser = SpectralAnalyser::new(&config);
            let bins = analyser.frequency_bin_count();
            let mut bytes = vec![0u8; bins];
            let mut db = vec![0.0f32; bins];

            let freq = 1000.0;
            analyser.analyse(&tone(freq, sample_rate, fft_size, 0.8), &mut bytes, &mut db);

            let bin_width = sample_rate / 2.0 / bins as f32;
            let peak_freq = peak_bin(&db) as f32 * bin_width;
            assert!(
                (peak_freq - freq).abs() <= bin_width,
                "fft {fft_size}: peak at {peak_freq} Hz, expected {freq} +/- {bin_width}"
            );
        }
    }

    #[test]
    fn silence_maps_to_zero_bytes_and_finite_decibels() {
        let mut analyser = SpectralAnalyser::new(&AnalyzerConfig::default());
        let bins = analyser.frequency_bin_count();
        let mut bytes = vec![255u8; bins];
        let mut db = vec![0.0f32; bins];

        analyser.analyse(&vec![0.0; analyser.fft_size()], &mut bytes, &mut db);

        assert!(bytes.iter().all(|&b| b == 0));
        assert!(db.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn non_finite_samples_are_treated_as_silence() {
        let mut analyser = SpectralAnalyser::new(&AnalyzerConfig::default());
        let bins = analyser.frequency_bin_count();
        let mut bytes = vec![0u8; bins];
        let mut db = vec![0.0f32; bins];

        let frame = vec![f32::NAN; analyser.fft_size()];
        analyser.analyse(&frame, &mut bytes, &mut db);
        assert!(db.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn configure_resizes_only_on_fft_change() {
        let mut config = AnalyzerConfig::default();
        let mut analyser = SpectralAnalyser::new(&config);
        let bins = analyser.frequency_bin_count();
        let mut bytes = vec![0u8; bins];
        let mut db = vec![0.0f32; bins];
        analyser.analyse(&tone(440.0, 48000.0, 2048, 0.5), &mut bytes, &mut db);
        let history: f32 = analyser.smoothed.iter().sum();
        assert!(history > 0.0);

        config.smoothing_time_constant = 0.5;
        analyser.configure(&config);
        assert_eq!(analyser.smoothed.iter().sum::<f32>(), history);

        config.fft_size = 512;
        analyser.configure(&config);
        assert_eq!(analyser.frequency_bin_count(), 256);
        assert_eq!(analyser.smoothed.len(), 256);
        assert!(analyser.smoothed.iter().all(|&v| v == 0.0));
    }
}
