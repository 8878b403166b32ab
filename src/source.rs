//! A capture source: one stream, one conditioning graph, many analyzers

use crate::analysis::{Analyzer, AnalyzerData};
use crate::audio::capture::{CaptureBackend, CaptureStream, StreamRequest, TrackKind};
use crate::audio::graph::{PipelineShape, SharedGraph};
use crate::clock::Clock;
use crate::config::{
    AnalyzerConfig, AnalyzerConfigPatch, CaptureType, EngineConfig, NormalizationConfig,
};
use crate::error::{EngineError, Result};
use crate::events::{DataPayload, EngineEvent, EventBus, EventKind, EventPayload, SourceState};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Identity of a capture stream; analyzers with equal keys share a source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceKey {
    pub device_id: String,
    pub capture_type: CaptureType,
    pub target_id: Option<String>,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.capture_type.as_str(), self.device_id)?;
        if let Some(target) = &self.target_id {
            write!(f, ":{}", target)?;
        }
        Ok(())
    }
}

/// Summary reported by `Manager::sources`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub key: SourceKey,
    pub state: SourceState,
    pub analyzer_count: usize,
    pub listening: bool,
    pub shape: PipelineShape,
}

pub struct Source {
    id: String,
    key: SourceKey,
    state: SourceState,
    graph: SharedGraph,
    stream: Option<Box<dyn CaptureStream>>,
    /// Insertion order is frame processing order
    analyzers: Vec<Analyzer>,
    /// The one gain stage value every analyzer config reports
    gain: f32,
    listening: bool,
    clock: Arc<dyn Clock>,
}

impl Source {
    pub fn new(id: String, key: SourceKey, sample_rate: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            key,
            state: SourceState::Inactive,
            graph: SharedGraph::new(sample_rate),
            stream: None,
            analyzers: Vec::new(),
            gain: 1.0,
            listening: false,
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id.clone(),
            key: self.key.clone(),
            state: self.state,
            analyzer_count: self.analyzers.len(),
            listening: self.listening,
            shape: self.graph.with(|g| g.shape()),
        }
    }

    /// Open the capture stream, then wire the graph.
    ///
    /// Desktop and application captures drop any video track and fail with
    /// `DeviceUnavailable` when no audio track is left.
    pub async fn start(
        &mut self,
        backend: &dyn CaptureBackend,
        config: &EngineConfig,
    ) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let request = StreamRequest {
            device_id: self.key.device_id.clone(),
            capture_type: self.key.capture_type,
            target_id: self.key.target_id.clone(),
            sample_rate: config.sample_rate,
            channel_count: config.channel_count,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
        };
        let pending = backend.open_stream(request, self.graph.clone())?;
        let mut stream = pending.stream;

        let sample_rate = match pending.ready.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                stream.stop();
                return Err(e);
            }
            Err(_) => {
                stream.stop();
                return Err(EngineError::StreamFailed(
                    "capture stream closed before it opened".to_string(),
                ));
            }
        };

        if self.key.capture_type != CaptureType::Microphone {
            for track in stream.tracks() {
                if track.kind == TrackKind::Video {
                    stream.stop_track(track.id);
                }
            }
            if !stream.tracks().iter().any(|t| t.kind == TrackKind::Audio) {
                stream.stop();
                return Err(EngineError::DeviceUnavailable(format!(
                    "{} produced no audio track",
                    self.key
                )));
            }
        }

        self.graph.with_mut(|g| {
            g.set_sample_rate(sample_rate);
            g.rebuild(PipelineShape::Bypassed);
        });
        self.stream = Some(stream);
        self.state = SourceState::Active;
        log::info!("Source {} started ({}, {} Hz)", self.id, self.key, sample_rate);
        Ok(())
    }

    /// Attach a new analyzer to the shared graph. The first analyzer sets the
    /// shared gain; later ones adopt it.
    pub fn create_analyzer(
        &mut self,
        id: String,
        label: Option<String>,
        mut config: AnalyzerConfig,
        normalization: Option<NormalizationConfig>,
    ) -> Result<&mut Analyzer> {
        if self.stream.is_none() {
            return Err(EngineError::NotActive(self.id.clone()));
        }

        if self.analyzers.is_empty() {
            self.gain = config.gain;
            self.graph.with_mut(|g| g.set_gain(config.gain));
        } else if config.gain != self.gain {
            log::debug!(
                "Analyzer {} joins {} at its shared gain {} (asked for {})",
                id,
                self.id,
                self.gain,
                config.gain
            );
            config.gain = self.gain;
        }

        let normalizing = normalization.is_some();
        let analyzer = Analyzer::new(
            id,
            self.id.clone(),
            label,
            self.graph.view(),
            self.clock.clone(),
            config,
            normalization,
        );
        self.analyzers.push(analyzer);
        if normalizing {
            self.refresh_pipeline();
        }

        let index = self.analyzers.len() - 1;
        Ok(&mut self.analyzers[index])
    }

    /// Detach an analyzer. Returns false if it is not on this source.
    pub fn remove_analyzer(&mut self, analyzer_id: &str) -> bool {
        let Some(index) = self.analyzers.iter().position(|a| a.id() == analyzer_id) else {
            return false;
        };
        let removed = self.analyzers.remove(index);
        if removed.normalization_enabled() && self.stream.is_some() {
            self.refresh_pipeline();
        }
        true
    }

    pub fn analyzer_count(&self) -> usize {
        self.analyzers.len()
    }

    pub fn analyzer_ids(&self) -> Vec<String> {
        self.analyzers.iter().map(|a| a.id().to_string()).collect()
    }

    pub fn has_analyzer(&self, analyzer_id: &str) -> bool {
        self.analyzers.iter().any(|a| a.id() == analyzer_id)
    }

    pub fn analyzer(&self, analyzer_id: &str) -> Option<&Analyzer> {
        self.analyzers.iter().find(|a| a.id() == analyzer_id)
    }

    pub fn analyzer_mut(&mut self, analyzer_id: &str) -> Option<&mut Analyzer> {
        self.analyzers.iter_mut().find(|a| a.id() == analyzer_id)
    }

    fn require(&mut self, analyzer_id: &str) -> Result<&mut Analyzer> {
        self.analyzer_mut(analyzer_id)
            .ok_or_else(|| EngineError::UnknownAnalyzer(analyzer_id.to_string()))
    }

    /// Read an analyzer and apply the normalization gain it computed.
    pub fn read_data(&mut self, analyzer_id: &str) -> Result<AnalyzerData> {
        let analyzer = self.require(analyzer_id)?;
        let data = analyzer.get_data();
        let gain = analyzer.take_normalization_gain();
        self.apply_normalization_gain(gain);
        Ok(data)
    }

    fn apply_normalization_gain(&self, gain: Option<f32>) {
        if let Some(gain) = gain {
            self.graph.with_mut(|g| {
                if g.shape() != PipelineShape::Bypassed {
                    g.set_normalization_gain(gain);
                }
            });
        }
    }

    pub fn enable_normalization(
        &mut self,
        analyzer_id: &str,
        config: NormalizationConfig,
    ) -> Result<()> {
        self.require(analyzer_id)?.enable_normalization(config)?;
        self.refresh_pipeline();
        Ok(())
    }

    pub fn disable_normalization(&mut self, analyzer_id: &str) -> Result<()> {
        self.require(analyzer_id)?.disable_normalization();
        self.refresh_pipeline();
        Ok(())
    }

    /// Partial analyzer update; a gain change reaches the shared gain stage
    /// and every analyzer's config immediately.
    pub fn update_analyzer_config(
        &mut self,
        analyzer_id: &str,
        patch: &AnalyzerConfigPatch,
    ) -> Result<AnalyzerConfig> {
        let updated = self.require(analyzer_id)?.update_config(patch)?;
        if updated.gain != self.gain {
            self.share_gain(updated.gain);
            self.graph.with_mut(|g| g.set_gain(updated.gain));
        }
        Ok(updated)
    }

    /// Rewire the graph for the normalization needs of the current
    /// analyzers. Always a full rebuild.
    pub fn refresh_pipeline(&mut self) {
        let compressor = self
            .analyzers
            .iter()
            .find(|a| a.wants_compressor())
            .map(|a| {
                let config = a.normalization_config();
                (config.compressor_threshold, config.compressor_ratio)
            });
        let normalizing = self.analyzers.iter().any(|a| a.normalization_enabled());

        let shape = match (compressor, normalizing) {
            (Some(_), _) => PipelineShape::NormalizingCompressed,
            (None, true) => PipelineShape::Normalizing,
            (None, false) => PipelineShape::Bypassed,
        };

        self.graph.with_mut(|g| {
            if let Some((threshold, ratio)) = compressor {
                g.configure_compressor(threshold, ratio);
            }
            g.rebuild(shape);
        });
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    fn share_gain(&mut self, gain: f32) {
        self.gain = gain;
        for analyzer in &mut self.analyzers {
            analyzer.sync_gain(gain);
        }
    }

    /// Record `target` as the shared gain and ramp the gain stage toward it
    /// with an exponential time constant in seconds.
    pub fn set_gain_smooth(
        &mut self,
        analyzer_id: &str,
        target: f32,
        time_constant: f32,
    ) -> Result<()> {
        let patch = AnalyzerConfigPatch {
            gain: Some(target),
            ..Default::default()
        };
        let updated = self.require(analyzer_id)?.update_config(&patch)?;
        self.share_gain(updated.gain);
        self.graph
            .with_mut(|g| g.ramp_gain(updated.gain, time_constant));
        Ok(())
    }

    /// Route the gain stage output to the monitor output (or stop doing so).
    pub fn set_listening(&mut self, listening: bool) {
        self.listening = listening;
        self.graph.with_mut(|g| g.set_monitoring(listening));
    }

    pub fn suspend(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::NotActive(self.id.clone()))?;
        stream.suspend()?;
        self.state = SourceState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::NotActive(self.id.clone()))?;
        stream.resume()?;
        self.state = SourceState::Active;
        Ok(())
    }

    /// Disconnect the graph, stop every track, release the stream and drop
    /// all analyzers. Safe to call repeatedly. Returns the ids of the
    /// analyzers that were dropped.
    pub fn stop(&mut self) -> Vec<String> {
        let dropped = self.analyzer_ids();
        self.analyzers.clear();
        self.graph.with_mut(|g| {
            g.set_monitoring(false);
            g.disconnect();
        });

        if let Some(mut stream) = self.stream.take() {
            for track in stream.tracks() {
                stream.stop_track(track.id);
            }
            stream.stop();
            log::info!("Source {} stopped", self.id);
        }
        self.listening = false;
        self.state = SourceState::Inactive;
        dropped
    }

    /// Per-frame work for every analyzer, in insertion order. Only what some
    /// listener (or normalization) needs is computed.
    pub fn process_frame(&mut self, bus: &mut EventBus, config: &EngineConfig) {
        if self.state != SourceState::Active {
            return;
        }

        for index in 0..self.analyzers.len() {
            let analyzer_id = self.analyzers[index].id().to_string();
            let scope = Some(analyzer_id.as_str());
            let wants_data = bus.has_listeners(EventKind::Data, scope);
            let wants_peak = bus.has_listeners(EventKind::Peak, scope);
            let wants_beat = bus.has_listeners(EventKind::Beat, scope);

            let analyzer = &mut self.analyzers[index];
            let data = if wants_data || wants_peak || analyzer.normalization_enabled() {
                let data = analyzer.get_data();
                let gain = analyzer.take_normalization_gain();
                self.apply_normalization_gain(gain);
                Some(data)
            } else {
                None
            };

            let analyzer = &mut self.analyzers[index];
            let event = |payload| EngineEvent {
                timestamp: self.clock.now_ms(),
                source_id: Some(self.id.clone()),
                analyzer_id: Some(analyzer_id.clone()),
                payload,
            };

            if let Some(data) = data {
                if wants_peak && data.peak_level >= config.peak_threshold {
                    bus.emit(&event(EventPayload::Peak {
                        level: data.peak_level,
                        frequency: data.peak_frequency,
                    }));
                }
                if wants_data {
                    let bands = analyzer.frequency_bands();
                    let payload = DataPayload { data, bands };
                    bus.emit(&event(EventPayload::Data(Box::new(payload))));
                }
            }

            if wants_beat {
                let beat = analyzer.detect_beat(config.beat_threshold);
                if beat.detected {
                    bus.emit(&event(EventPayload::Beat {
                        intensity: beat.intensity,
                        bpm: beat.bpm,
                        bpm_confidence: beat.bpm_confidence,
                    }));
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn graph(&self) -> &SharedGraph {
        &self.graph
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.stop();
    }
}
