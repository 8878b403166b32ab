//! Shared signal-conditioning graph
//!
//! One graph per source. The capture thread pushes mono samples through the
//! wired stages (gain, then optionally normalization gain and compressor) into
//! the analysis ring buffer that every analyzer on the source reads from. The
//! gain stage output also feeds the monitor queue, scaled by 0 or 1.
//!
//! The wiring is never patched: every shape change disconnects all stages and
//! reconnects them from the shape's declarative stage list.

use super::capture::AudioBuffer;
use crate::config::MAX_FFT_SIZE;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Compressor knee width in dB
const COMPRESSOR_KNEE_DB: f32 = 10.0;

/// Compressor attack in seconds
const COMPRESSOR_ATTACK: f32 = 0.003;

/// Compressor release in seconds
const COMPRESSOR_RELEASE: f32 = 0.25;

/// Monitor queue bound (samples); oldest audio is dropped past this
const MONITOR_QUEUE_SECONDS: usize = 1;

/// Pipeline shapes the graph can be wired as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineShape {
    /// source -> gain -> analysis
    Bypassed,
    /// source -> gain -> normalization gain -> analysis
    Normalizing,
    /// source -> gain -> normalization gain -> compressor -> analysis
    NormalizingCompressed,
}

/// A processing stage between the source node and the analysis tap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Gain,
    NormalizationGain,
    Compressor,
}

impl PipelineShape {
    /// Ordered stage list for this shape.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Self::Bypassed => &[Stage::Gain],
            Self::Normalizing => &[Stage::Gain, Stage::NormalizationGain],
            Self::NormalizingCompressed => {
                &[Stage::Gain, Stage::NormalizationGain, Stage::Compressor]
            }
        }
    }
}

/// Feed-forward dynamics compressor with a fixed soft knee and fixed timing
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    /// Smoothed gain reduction in dB (<= 0)
    reduction_db: f32,
}

impl Compressor {
    pub fn new(threshold_db: f32, ratio: f32, sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f32;
        Self {
            threshold_db,
            ratio: ratio.max(1.0),
            attack_coeff: (-1.0 / (COMPRESSOR_ATTACK * sr)).exp(),
            release_coeff: (-1.0 / (COMPRESSOR_RELEASE * sr)).exp(),
            reduction_db: 0.0,
        }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    /// Static gain curve: reduction in dB for a given input level.
    pub fn gain_reduction_db(&self, input_db: f32) -> f32 {
        let slope = 1.0 / self.ratio - 1.0;
        let over = input_db - self.threshold_db;
        if 2.0 * over < -COMPRESSOR_KNEE_DB {
            0.0
        } else if 2.0 * over.abs() <= COMPRESSOR_KNEE_DB {
            let x = over + COMPRESSOR_KNEE_DB / 2.0;
            slope * x * x / (2.0 * COMPRESSOR_KNEE_DB)
        } else {
            slope * over
        }
    }

    pub fn process(&mut self, sample: f32) -> f32 {
        let level_db = 20.0 * sample.abs().max(1e-6).log10();
        let target = self.gain_reduction_db(level_db);

        // More reduction engages with the attack time, less with the release time
        let coeff = if target < self.reduction_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.reduction_db = target + coeff * (self.reduction_db - target);

        sample * 10f32.powf(self.reduction_db / 20.0)
    }

    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }
}

/// The conditioning graph itself
pub struct ConditioningGraph {
    sample_rate: u32,
    shape: PipelineShape,

    /// Currently wired stages; empty when disconnected
    wired: Vec<Stage>,

    gain: f32,
    gain_target: f32,
    /// Per-sample approach coefficient toward `gain_target` (1 = immediate)
    gain_step: f32,

    normalization_gain: f32,
    compressor: Compressor,
    monitor_gain: f32,

    analysis: AudioBuffer,
    monitor: VecDeque<f32>,
    monitor_capacity: usize,

    rebuilds: u64,
}

impl ConditioningGraph {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        let monitor_capacity = sample_rate as usize * MONITOR_QUEUE_SECONDS;
        Self {
            sample_rate,
            shape: PipelineShape::Bypassed,
            wired: Vec::new(),
            gain: 1.0,
            gain_target: 1.0,
            gain_step: 1.0,
            normalization_gain: 1.0,
            compressor: Compressor::new(-24.0, 4.0, sample_rate),
            monitor_gain: 0.0,
            analysis: AudioBuffer::new(analysis_capacity(sample_rate)),
            monitor: VecDeque::with_capacity(monitor_capacity),
            monitor_capacity,
            rebuilds: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Adopt the sample rate the stream actually opened with. Buffers are
    /// reallocated and the current shape is rewired.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let sample_rate = sample_rate.max(1);
        if sample_rate == self.sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        self.analysis = AudioBuffer::new(analysis_capacity(sample_rate));
        self.monitor_capacity = sample_rate as usize * MONITOR_QUEUE_SECONDS;
        self.monitor.clear();
        self.compressor = Compressor::new(
            self.compressor.threshold_db(),
            self.compressor.ratio(),
            sample_rate,
        );
        if self.is_connected() {
            self.rebuild(self.shape);
        }
    }

    pub fn shape(&self) -> PipelineShape {
        self.shape
    }

    pub fn is_connected(&self) -> bool {
        !self.wired.is_empty()
    }

    /// Number of full rewires since creation
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Disconnect every stage, then wire `shape` from its stage list.
    pub fn rebuild(&mut self, shape: PipelineShape) {
        self.disconnect();
        self.shape = shape;
        self.wired.extend_from_slice(shape.stages());
        if !self.wired.contains(&Stage::NormalizationGain) {
            self.normalization_gain = 1.0;
        }
        self.rebuilds += 1;
        log::debug!("Conditioning graph wired as {:?}", shape);
    }

    /// Replace compressor settings; takes effect on the next rebuild's signal.
    pub fn configure_compressor(&mut self, threshold_db: f32, ratio: f32) {
        self.compressor = Compressor::new(threshold_db, ratio, self.sample_rate);
    }

    pub fn disconnect(&mut self) {
        self.wired.clear();
        self.compressor.reset();
        self.monitor.clear();
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        let gain = sanitize_gain(gain, self.gain);
        self.gain = gain;
        self.gain_target = gain;
        self.gain_step = 1.0;
    }

    /// Approach `target` exponentially with the given time constant (seconds).
    pub fn ramp_gain(&mut self, target: f32, time_constant: f32) {
        self.gain_target = sanitize_gain(target, self.gain);
        if !time_constant.is_finite() || time_constant <= 0.0 {
            self.gain = self.gain_target;
            self.gain_step = 1.0;
        } else {
            self.gain_step = 1.0 - (-1.0 / (time_constant * self.sample_rate as f32)).exp();
        }
    }

    pub fn normalization_gain(&self) -> f32 {
        self.normalization_gain
    }

    pub fn set_normalization_gain(&mut self, gain: f32) {
        self.normalization_gain = sanitize_gain(gain, self.normalization_gain);
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_gain > 0.0
    }

    pub fn set_monitoring(&mut self, enabled: bool) {
        self.monitor_gain = if enabled { 1.0 } else { 0.0 };
        if !enabled {
            self.monitor.clear();
        }
    }

    /// Run mono capture samples through the wired stages.
    pub fn process(&mut self, input: &[f32]) {
        if self.wired.is_empty() {
            return;
        }

        for &sample in input {
            if self.gain != self.gain_target {
                self.gain += (self.gain_target - self.gain) * self.gain_step;
                if (self.gain_target - self.gain).abs() < 1e-6 {
                    self.gain = self.gain_target;
                }
            }

            let mut x = sample;
            for stage in &self.wired {
                match stage {
                    Stage::Gain => {
                        x *= self.gain;
                        if self.monitor_gain > 0.0 {
                            if self.monitor.len() >= self.monitor_capacity {
                                self.monitor.pop_front();
                            }
                            self.monitor.push_back(x * self.monitor_gain);
                        }
                    }
                    Stage::NormalizationGain => x *= self.normalization_gain,
                    Stage::Compressor => x = self.compressor.process(x),
                }
            }
            self.analysis.push_samples(&[x]);
        }
    }

    /// Copy the most recent `out.len()` analysis samples into `out`.
    pub fn copy_latest(&self, out: &mut [f32]) {
        self.analysis.copy_latest(out);
    }

    /// Analysis samples written since the buffer was allocated
    pub fn analysis_position(&self) -> u64 {
        self.analysis.total_written()
    }

    /// Fill `out` from the monitor queue, padding with silence.
    pub fn drain_monitor(&mut self, out: &mut [f32]) {
        for slot in out.iter_mut() {
            *slot = self.monitor.pop_front().unwrap_or(0.0);
        }
    }

    pub fn monitor_backlog(&self) -> usize {
        self.monitor.len()
    }
}

fn analysis_capacity(sample_rate: u32) -> usize {
    (sample_rate as usize * 2).max(MAX_FFT_SIZE)
}

fn sanitize_gain(gain: f32, fallback: f32) -> f32 {
    if gain.is_finite() && gain >= 0.0 {
        gain
    } else {
        fallback
    }
}

/// Graph handle shared between a source and its capture thread
#[derive(Clone)]
pub struct SharedGraph {
    inner: Arc<Mutex<ConditioningGraph>>,
}

impl SharedGraph {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConditioningGraph::new(sample_rate))),
        }
    }

    /// Called from the capture callback with down-mixed samples.
    pub fn push_samples(&self, mono: &[f32]) {
        self.inner.lock().process(mono);
    }

    /// Called from the monitor output callback.
    pub fn fill_monitor(&self, out: &mut [f32]) {
        self.inner.lock().drain_monitor(out);
    }

    pub fn with<R>(&self, f: impl FnOnce(&ConditioningGraph) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Mutable access, reserved for the owning source.
    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut ConditioningGraph) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Read-only view handed to analyzers.
    pub fn view(&self) -> GraphView {
        GraphView {
            inner: self.inner.clone(),
        }
    }
}

/// Read-only view of a source's graph
#[derive(Clone)]
pub struct GraphView {
    inner: Arc<Mutex<ConditioningGraph>>,
}

impl GraphView {
    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().sample_rate()
    }

    pub fn normalization_gain(&self) -> f32 {
        self.inner.lock().normalization_gain()
    }

    pub fn shape(&self) -> PipelineShape {
        self.inner.lock().shape()
    }

    /// Copy the latest time-domain frame into `out` and return the analysis
    /// write position it was read at.
    pub fn read_frame(&self, out: &mut [f32]) -> u64 {
        let graph = self.inner.lock();
        graph.copy_latest(out);
        graph.analysis_position()
    }
}
