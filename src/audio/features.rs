//! Feature-extraction primitive
//!
//! Per-frame descriptors used to classify transients: RMS, zero-crossing
//! rate, spectral centroid, spectral flatness and the amplitude spectrum.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Features extracted from one time-domain frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    /// Root-mean-square level
    pub rms: f32,

    /// Zero crossings per sample (0.0 to 1.0)
    pub zcr: f32,

    /// Magnitude-weighted mean frequency in Hz ("brightness")
    pub spectral_centroid: f32,

    /// Geometric / arithmetic mean of the amplitude spectrum.
    /// 0.0 = pure tone, 1.0 = white noise.
    pub spectral_flatness: f32,

    /// Hann-windowed FFT magnitudes, `frame.len() / 2` bins
    pub amplitude_spectrum: Vec<f32>,

    /// Width of one amplitude-spectrum bin in Hz
    pub bin_width: f32,
}

pub struct FeatureExtractor {
    planner: FftPlanner<f32>,
    fft: Option<(usize, Arc<dyn Fft<f32>>)>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            fft: None,
            window: Vec::new(),
            scratch: Vec::new(),
        }
    }

    fn plan(&mut self, size: usize) -> Arc<dyn Fft<f32>> {
        match &self.fft {
            Some((planned, fft)) if *planned == size => fft.clone(),
            _ => {
                let fft = self.planner.plan_fft_forward(size);
                self.window = crate::config::WindowFunction::Hann.coefficients(size);
                self.scratch = vec![Complex::new(0.0, 0.0); size];
                self.fft = Some((size, fft.clone()));
                fft
            }
        }
    }

    pub fn extract(&mut self, frame: &[f32], sample_rate: u32) -> Features {
        let n = frame.len();
        if n < 2 {
            return Features::default();
        }

        let clean = |s: f32| if s.is_finite() { s } else { 0.0 };

        let rms = (frame.iter().map(|&s| clean(s) * clean(s)).sum::<f32>() / n as f32).sqrt();

        let crossings = frame
            .windows(2)
            .filter(|w| (clean(w[0]) >= 0.0) != (clean(w[1]) >= 0.0))
            .count();
        let zcr = crossings as f32 / (n - 1) as f32;

        let fft = self.plan(n);
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = Complex::new(clean(frame[i]) * self.window[i], 0.0);
        }
        fft.process(&mut self.scratch);

        let amplitude_spectrum: Vec<f32> =
            self.scratch.iter().take(n / 2).map(|c| c.norm()).collect();
        let bin_width = sample_rate as f32 / n as f32;

        let total: f32 = amplitude_spectrum.iter().sum();
        let spectral_centroid = if total > 0.0 {
            amplitude_spectrum
                .iter()
                .enumerate()
                .map(|(k, &a)| k as f32 * bin_width * a)
                .sum::<f32>()
                / total
        } else {
            0.0
        };

        let spectral_flatness = flatness(&amplitude_spectrum);

        Features {
            rms,
            zcr,
            spectral_centroid,
            spectral_flatness,
            amplitude_spectrum,
            bin_width,
        }
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn flatness(spectrum: &[f32]) -> f32 {
    if spectrum.is_empty() {
        return 0.0;
    }
    let n = spectrum.len() as f32;
    let arithmetic = spectrum.iter().sum::<f32>() / n;
    if arithmetic <= f32::EPSILON {
        return 0.0;
    }
    let log_mean = spectrum.iter().map(|&a| (a + 1e-10).ln()).sum::<f32>() / n;
    (log_mean.exp() / arithmetic).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    /// Deterministic white-ish noise (xorshift)
    fn noise(len: usize) -> Vec<f32> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn silence_has_no_features() {
        let mut extractor = FeatureExtractor::new();
        let f = extractor.extract(&[0.0; 1024], 48000);
        assert_eq!(f.rms, 0.0);
        assert_eq!(f.spectral_centroid, 0.0);
        assert_eq!(f.spectral_flatness, 0.0);
        assert_eq!(f.amplitude_spectrum.len(), 512);
    }

    #[test]
    fn tone_centroid_sits_near_its_frequency() {
        let mut extractor = FeatureExtractor::new();
        let f = extractor.extract(&tone(2000.0, 48000.0, 2048), 48000);
        assert!((f.rms - 0.5 / 2f32.sqrt()).abs() < 0.01);
        assert!(
            (f.spectral_centroid - 2000.0).abs() < 200.0,
            "centroid {}",
            f.spectral_centroid
        );
        assert!(f.spectral_flatness < 0.1);
    }

    #[test]
    fn noise_is_flatter_and_crosses_more_than_a_bass_tone() {
        let mut extractor = FeatureExtractor::new();
        let n = extractor.extract(&noise(2048), 48000);
        let t = extractor.extract(&tone(60.0, 48000.0, 2048), 48000);
        assert!(n.spectral_flatness > t.spectral_flatness);
        assert!(n.zcr > t.zcr);
        assert!(n.spectral_centroid > t.spectral_centroid);
    }

    #[test]
    fn frame_size_change_replans() {
        let mut extractor = FeatureExtractor::new();
        assert_eq!(extractor.extract(&[0.1; 256], 48000).amplitude_spectrum.len(), 128);
        assert_eq!(extractor.extract(&[0.1; 512], 48000).amplitude_spectrum.len(), 256);
    }
}
