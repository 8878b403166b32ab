//! Frequency bands and arbitrary range reduction over a byte spectrum

use serde::{Deserialize, Serialize};

/// The seven fixed bands, in Hz
pub const BAND_RANGES: [(&str, f32, f32); 7] = [
    ("sub_bass", 20.0, 60.0),
    ("bass", 60.0, 250.0),
    ("low_mid", 250.0, 500.0),
    ("mid", 500.0, 2000.0),
    ("upper_mid", 2000.0, 4000.0),
    ("presence", 4000.0, 6000.0),
    ("brilliance", 6000.0, 20000.0),
];

/// Normalized (0-1) mean magnitude of each fixed band
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBands {
    pub sub_bass: f32,
    pub bass: f32,
    pub low_mid: f32,
    pub mid: f32,
    pub upper_mid: f32,
    pub presence: f32,
    pub brilliance: f32,
}

impl FrequencyBands {
    pub fn as_array(&self) -> [f32; 7] {
        [
            self.sub_bass,
            self.bass,
            self.low_mid,
            self.mid,
            self.upper_mid,
            self.presence,
            self.brilliance,
        ]
    }
}

/// How a range of bins is reduced to one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeMode {
    #[default]
    Average,
    Peak,
    Rms,
    /// Sum normalized by the largest possible sum over the range
    Sum,
    /// Linearly increasing weight toward the top of the range
    Weighted,
}

/// A frequency range request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub low_freq: f32,
    pub high_freq: f32,
    #[serde(default)]
    pub mode: RangeMode,
}

/// Inclusive bin span whose bin frequencies (`k * bin_width`) fall inside
/// `[low, high]`. `None` when the range covers no bin.
pub fn bin_span(low: f32, high: f32, bin_width: f32, bin_count: usize) -> Option<(usize, usize)> {
    if bin_count == 0
        || !(bin_width > 0.0)
        || !low.is_finite()
        || !high.is_finite()
        || low > high
        || high < 0.0
    {
        return None;
    }
    let first = (low.max(0.0) / bin_width).ceil() as usize;
    let last = ((high / bin_width).floor() as usize).min(bin_count - 1);
    (first <= last).then_some((first, last))
}

/// Reduce normalized values with the given mode.
pub fn reduce(values: impl ExactSizeIterator<Item = f32>, mode: RangeMode) -> f32 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let result = match mode {
        RangeMode::Average | RangeMode::Sum => {
            // Max possible sum over n normalized bins is n
            values.sum::<f32>() / n as f32
        }
        RangeMode::Peak => values.fold(0.0f32, f32::max),
        RangeMode::Rms => (values.map(|v| v * v).sum::<f32>() / n as f32).sqrt(),
        RangeMode::Weighted => {
            let mut weighted = 0.0;
            let mut total_weight = 0.0;
            for (i, v) in values.enumerate() {
                let w = (i + 1) as f32 / n as f32;
                weighted += v * w;
                total_weight += w;
            }
            weighted / total_weight
        }
    };
    if result.is_finite() {
        result
    } else {
        0.0
    }
}

/// Width in Hz of one bin of a spectrum with `bin_count` bins.
pub fn bin_width(sample_rate: u32, bin_count: usize) -> f32 {
    if bin_count == 0 {
        0.0
    } else {
        sample_rate as f32 / 2.0 / bin_count as f32
    }
}

/// Reduce the bytes of `spectrum` covering `[low, high]` Hz to one 0-1 value.
pub fn frequency_range(
    spectrum: &[u8],
    sample_rate: u32,
    low: f32,
    high: f32,
    mode: RangeMode,
) -> f32 {
    let width = bin_width(sample_rate, spectrum.len());
    match bin_span(low, high, width, spectrum.len()) {
        Some((first, last)) => reduce(
            spectrum[first..=last].iter().map(|&b| b as f32 / 255.0),
            mode,
        ),
        None => 0.0,
    }
}

/// The seven fixed bands of `spectrum`.
pub fn frequency_bands(spectrum: &[u8], sample_rate: u32) -> FrequencyBands {
    let mut values = [0.0f32; 7];
    for (slot, (_, low, high)) in values.iter_mut().zip(BAND_RANGES.iter()) {
        *slot = frequency_range(spectrum, sample_rate, *low, *high, RangeMode::Average);
    }
    let [sub_bass, bass, low_mid, mid, upper_mid, presence, brilliance] = values;
    FrequencyBands {
        sub_bass,
        bass,
        low_mid,
        mid,
        upper_mid,
        presence,
        brilliance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum_with(bins: usize, lit: std::ops::RangeInclusive<usize>) -> Vec<u8> {
        (0..bins)
            .map(|k| if lit.contains(&k) { 255 } else { 0 })
            .collect()
    }

    #[test]
    fn range_exactly_covering_lit_bins_averages_to_one() {
        // 1024 bins at 48 kHz -> 23.4375 Hz per bin; 60-250 Hz covers bins 3..=10
        let spectrum = spectrum_with(1024, 3..=10);
        assert_eq!(bin_span(60.0, 250.0, bin_width(48000, 1024), 1024), Some((3, 10)));
        assert_eq!(
            frequency_range(&spectrum, 48000, 60.0, 250.0, RangeMode::Average),
            1.0
        );
    }

    #[test]
    fn modes_reduce_differently() {
        let values = [0.0f32, 0.5, 1.0];
        let it = || values.iter().copied();
        assert!((reduce(it(), RangeMode::Average) - 0.5).abs() < 1e-6);
        assert!((reduce(it(), RangeMode::Sum) - 0.5).abs() < 1e-6);
        assert_eq!(reduce(it(), RangeMode::Peak), 1.0);
        assert!((reduce(it(), RangeMode::Rms) - (1.25f32 / 3.0).sqrt()).abs() < 1e-6);
        // weights 1/3, 2/3, 1 -> (0 + 1/3 + 1) / 2
        assert!((reduce(it(), RangeMode::Weighted) - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn weighted_mode_favors_the_top_of_the_range() {
        let rising = [0.0f32, 0.0, 1.0];
        let falling = [1.0f32, 0.0, 0.0];
        assert!(
            reduce(rising.iter().copied(), RangeMode::Weighted)
                > reduce(falling.iter().copied(), RangeMode::Weighted)
        );
    }

    #[test]
    fn range_narrower_than_a_bin_is_zero() {
        // 16 bins at 48 kHz -> 1500 Hz per bin
        let spectrum = vec![255u8; 16];
        assert_eq!(
            frequency_range(&spectrum, 48000, 20.0, 60.0, RangeMode::Average),
            0.0
        );
        assert_eq!(frequency_bands(&spectrum, 48000).sub_bass, 0.0);
    }

    #[test]
    fn invalid_ranges_are_zero() {
        let spectrum = vec![255u8; 1024];
        assert_eq!(frequency_range(&spectrum, 48000, 500.0, 100.0, RangeMode::Peak), 0.0);
        assert_eq!(frequency_range(&spectrum, 48000, f32::NAN, 100.0, RangeMode::Peak), 0.0);
        assert_eq!(frequency_range(&[], 48000, 20.0, 100.0, RangeMode::Peak), 0.0);
    }

    #[test]
    fn bands_pick_up_energy_in_their_range() {
        // Light only the bass band (60-250 Hz)
        let spectrum = spectrum_with(1024, 3..=10);
        let bands = frequency_bands(&spectrum, 48000);
        assert_eq!(bands.bass, 1.0);
        assert_eq!(bands.mid, 0.0);
        assert_eq!(bands.brilliance, 0.0);
        assert_eq!(bands.as_array().len(), 7);
    }
}
