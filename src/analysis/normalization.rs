//! Adaptive loudness normalization

use crate::config::NormalizationConfig;
use serde::Serialize;
use std::collections::VecDeque;

/// Average RMS below this is treated as silence and leaves the gain alone
pub const SILENCE_FLOOR: f32 = 0.001;

/// Snapshot reported by `normalization_state`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizationState {
    pub enabled: bool,
    pub current_gain: f32,
    pub average_rms: f32,
    pub config: NormalizationConfig,
}

/// Steers a gain toward `target_level / avg_rms` with asymmetric smoothing.
#[derive(Debug, Clone)]
pub struct NormalizationController {
    config: NormalizationConfig,
    history: VecDeque<f32>,
    current_gain: f32,
}

impl NormalizationController {
    pub fn new(config: NormalizationConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_size),
            config,
            current_gain: 1.0,
        }
    }

    pub fn config(&self) -> &NormalizationConfig {
        &self.config
    }

    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    pub fn average_rms(&self) -> f32 {
        if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f32>() / self.history.len() as f32
        }
    }

    /// Feed one frame's RMS (measured before normalization) and return the
    /// updated gain.
    pub fn process(&mut self, rms: f32) -> f32 {
        if !rms.is_finite() || rms < 0.0 {
            return self.current_gain;
        }

        self.history.push_back(rms);
        while self.history.len() > self.config.history_size.max(1) {
            self.history.pop_front();
        }

        let average = self.average_rms();
        if average < SILENCE_FLOOR {
            return self.current_gain;
        }

        let target =
            (self.config.target_level / average).clamp(self.config.min_gain, self.config.max_gain);
        let rate = if target > self.current_gain {
            self.config.attack_time
        } else {
            self.config.release_time
        }
        .clamp(0.0, 1.0);

        let next = self.current_gain + (target - self.current_gain) * rate;
        if next.is_finite() {
            self.current_gain = next;
        }
        self.current_gain
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.current_gain = 1.0;
    }
}
