//! The engine instance: devices, pooled sources, analyzers and events
//!
//! A `Manager` is constructed explicitly and driven by its owner: `init()`
//! once, `tick()` per display frame (or `run()` to do that on a timer), and
//! `destroy()` when done.

use crate::analysis::{
    AnalyzerData, BeatResult, BpmEstimate, FrequencyBands, FrequencyRange, NormalizationState,
    PercussionConfig, PercussionKind, PercussionResult, RangeMode,
};
use crate::audio::capture::CaptureBackend;
use crate::audio::devices::{CaptureTarget, Device, DeviceManager, DeviceRefresh};
use crate::clock::{Clock, SystemClock};
use crate::config::{
    AnalyzerConfig, AnalyzerConfigPatch, CreateAnalyzerOptions, EngineConfig, NormalizationConfig,
};
use crate::error::{EngineError, Result};
use crate::events::{
    EngineEvent, EventBus, EventKind, EventPayload, Listener, SourceState, Subscription,
};
use crate::source::{Source, SourceInfo, SourceKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Manager {
    config: EngineConfig,
    backend: Arc<dyn CaptureBackend>,
    clock: Arc<dyn Clock>,
    devices: DeviceManager,
    sources: Vec<Source>,
    bus: EventBus,
    next_source: u64,
    next_analyzer: u64,
    last_device_poll: Option<f64>,
    initialized: bool,
    destroyed: bool,
}

impl Manager {
    pub fn new(config: EngineConfig, backend: Arc<dyn CaptureBackend>) -> Self {
        Self::with_clock(config, backend, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        config: EngineConfig,
        backend: Arc<dyn CaptureBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            devices: DeviceManager::new(backend.clone()),
            config,
            backend,
            clock,
            sources: Vec::new(),
            bus: EventBus::new(),
            next_source: 0,
            next_analyzer: 0,
            last_device_poll: None,
            initialized: false,
            destroyed: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(EngineError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, source_id: Option<&str>, analyzer_id: Option<&str>, payload: EventPayload) {
        let event = EngineEvent {
            timestamp: self.clock.now_ms(),
            source_id: source_id.map(str::to_string),
            analyzer_id: analyzer_id.map(str::to_string),
            payload,
        };
        self.bus.emit(&event);
    }

    fn report(&mut self, source_id: Option<&str>, analyzer_id: Option<&str>, err: &EngineError) {
        log::error!("{}", err);
        self.emit(source_id, analyzer_id, EventPayload::error(err));
    }

    /// Request capture permission and take the first device snapshot.
    pub fn init(&mut self) -> Result<()> {
        self.ensure_alive()?;
        if self.initialized {
            return Ok(());
        }
        match self.devices.initialize() {
            Ok(refresh) => {
                self.initialized = true;
                self.last_device_poll = Some(self.clock.now_ms());
                if let DeviceRefresh::Changed(devices) = refresh {
                    self.emit(None, None, EventPayload::DeviceChange(devices));
                }
                log::info!("Audio engine initialized");
                Ok(())
            }
            Err(e) => {
                self.report(None, None, &e);
                Err(e)
            }
        }
    }

    /// Re-enumerate devices. A failure is reported and the previous snapshot
    /// stays in place.
    pub fn refresh_devices(&mut self) -> Result<()> {
        self.ensure_alive()?;
        self.last_device_poll = Some(self.clock.now_ms());
        match self.devices.refresh_devices() {
            Ok(DeviceRefresh::Changed(devices)) => {
                self.emit(None, None, EventPayload::DeviceChange(devices));
                Ok(())
            }
            Ok(DeviceRefresh::Unchanged) => Ok(()),
            Err(e) => {
                self.report(None, None, &e);
                Err(e)
            }
        }
    }

    pub fn devices(&self) -> &[Device] {
        self.devices.devices()
    }

    pub fn input_devices(&self) -> Vec<Device> {
        self.devices.input_devices()
    }

    pub fn output_devices(&self) -> Vec<Device> {
        self.devices.output_devices()
    }

    pub fn default_input_device(&self) -> Option<Device> {
        self.devices.default_input_device()
    }

    pub fn capture_targets(&self) -> Vec<CaptureTarget> {
        self.backend.capture_targets()
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.sources.iter().map(Source::info).collect()
    }

    /// Create an analyzer, opening (or reusing) the source for its device,
    /// capture type and target.
    pub async fn create_analyzer(&mut self, options: CreateAnalyzerOptions) -> Result<String> {
        self.ensure_alive()?;

        let config = match options.analyzer_config() {
            Ok(config) => config,
            Err(e) => {
                self.report(None, None, &e);
                return Err(e);
            }
        };
        let key = SourceKey {
            device_id: options.device_id.clone(),
            capture_type: options.capture_type,
            target_id: options.capture_target_id.clone(),
        };

        let index = match self
            .sources
            .iter()
            .position(|s| s.key() == &key && s.state() != SourceState::Inactive)
        {
            Some(index) => index,
            None => {
                self.next_source += 1;
                let source_id = format!("source-{}", self.next_source);
                let mut source = Source::new(
                    source_id.clone(),
                    key,
                    self.config.sample_rate,
                    self.clock.clone(),
                );
                if let Err(e) = source.start(self.backend.as_ref(), &self.config).await {
                    self.report(Some(&source_id), None, &e);
                    return Err(e);
                }
                self.sources.push(source);
                self.emit(
                    Some(&source_id),
                    None,
                    EventPayload::StateChange(SourceState::Active),
                );
                self.sources.len() - 1
            }
        };

        self.next_analyzer += 1;
        let analyzer_id = format!("analyzer-{}", self.next_analyzer);
        let normalization = options
            .normalization_enabled
            .then(|| options.normalization_config.clone());
        self.sources[index].create_analyzer(
            analyzer_id.clone(),
            options.label.clone(),
            config,
            normalization,
        )?;
        log::info!(
            "Analyzer {} created on {}",
            analyzer_id,
            self.sources[index].id()
        );
        Ok(analyzer_id)
    }

    fn source_of(&mut self, analyzer_id: &str) -> Result<&mut Source> {
        self.sources
            .iter_mut()
            .find(|s| s.has_analyzer(analyzer_id))
            .ok_or_else(|| EngineError::UnknownAnalyzer(analyzer_id.to_string()))
    }

    fn source_by_id(&mut self, source_id: &str) -> Result<&mut Source> {
        self.sources
            .iter_mut()
            .find(|s| s.id() == source_id)
            .ok_or_else(|| EngineError::UnknownSource(source_id.to_string()))
    }

    /// Handle for one analyzer.
    pub fn analyzer(&mut self, analyzer_id: &str) -> Result<AnalyzerHandle<'_>> {
        self.source_of(analyzer_id)?;
        Ok(AnalyzerHandle {
            manager: self,
            id: analyzer_id.to_string(),
        })
    }

    pub fn analyzer_ids(&self) -> Vec<String> {
        self.sources.iter().flat_map(|s| s.analyzer_ids()).collect()
    }

    /// Destroy an analyzer; the last analyzer on a source tears it down.
    pub fn remove_analyzer(&mut self, analyzer_id: &str) -> Result<()> {
        let index = self
            .sources
            .iter()
            .position(|s| s.has_analyzer(analyzer_id))
            .ok_or_else(|| EngineError::UnknownAnalyzer(analyzer_id.to_string()))?;

        self.sources[index].remove_analyzer(analyzer_id);
        self.bus.remove_analyzer(analyzer_id);
        log::info!("Analyzer {} removed", analyzer_id);

        if self.sources[index].analyzer_count() == 0 {
            let mut source = self.sources.remove(index);
            source.stop();
            self.emit(
                Some(source.id()),
                None,
                EventPayload::StateChange(SourceState::Inactive),
            );
        }
        Ok(())
    }

    /// Listen to every event of `kind`.
    pub fn subscribe(&mut self, kind: EventKind, listener: Listener) -> Subscription {
        self.bus.subscribe(kind, None, listener)
    }

    /// Listen to events of `kind` from one analyzer.
    pub fn subscribe_analyzer(
        &mut self,
        kind: EventKind,
        analyzer_id: &str,
        listener: Listener,
    ) -> Result<Subscription> {
        self.source_of(analyzer_id)?;
        Ok(self
            .bus
            .subscribe(kind, Some(analyzer_id.to_string()), listener))
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.bus.unsubscribe(subscription)
    }

    pub fn set_listening(&mut self, source_id: &str, listening: bool) -> Result<()> {
        self.source_by_id(source_id)?.set_listening(listening);
        Ok(())
    }

    pub fn suspend_source(&mut self, source_id: &str) -> Result<()> {
        let result = self.source_by_id(source_id)?.suspend();
        self.after_state_change(source_id, result, SourceState::Suspended)
    }

    pub fn resume_source(&mut self, source_id: &str) -> Result<()> {
        let result = self.source_by_id(source_id)?.resume();
        self.after_state_change(source_id, result, SourceState::Active)
    }

    fn after_state_change(
        &mut self,
        source_id: &str,
        result: Result<()>,
        state: SourceState,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.emit(Some(source_id), None, EventPayload::StateChange(state));
                Ok(())
            }
            Err(e) => {
                self.report(Some(source_id), None, &e);
                Err(e)
            }
        }
    }

    /// One display frame: poll devices when due, then run every source's
    /// analyzers in order.
    pub fn tick(&mut self) {
        if self.destroyed {
            return;
        }

        if self.initialized {
            let now = self.clock.now_ms();
            let due = self
                .last_device_poll
                .map(|last| now - last >= self.config.device_poll_interval_ms as f64)
                .unwrap_or(true);
            let hinted = self.devices.hardware_changed();
            if due || hinted {
                // Failures are already reported as error events
                let _ = self.refresh_devices();
            }
        }

        for source in self.sources.iter_mut() {
            source.process_frame(&mut self.bus, &self.config);
        }
    }

    /// Drive `tick()` from a timer until `shutdown` fires, then destroy.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.frame_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        log::info!("Frame driver started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Frame driver received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        self.destroy();
    }

    /// Stop every source and drop all listeners. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for mut source in std::mem::take(&mut self.sources) {
            source.stop();
            self.emit(
                Some(source.id()),
                None,
                EventPayload::StateChange(SourceState::Inactive),
            );
        }
        self.bus.clear();
        self.destroyed = true;
        log::info!("Audio engine destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Borrowed handle to one analyzer
pub struct AnalyzerHandle<'a> {
    manager: &'a mut Manager,
    id: String,
}

impl AnalyzerHandle<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn source(&mut self) -> Result<&mut Source> {
        self.manager.source_of(&self.id)
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut crate::analysis::Analyzer) -> R) -> Result<R> {
        let id = self.id.clone();
        let analyzer = self
            .source()?
            .analyzer_mut(&id)
            .ok_or(EngineError::UnknownAnalyzer(id))?;
        Ok(f(analyzer))
    }

    /// Receive this analyzer's `data` events.
    pub fn on_data(&mut self, listener: Listener) -> Subscription {
        self.manager
            .bus
            .subscribe(EventKind::Data, Some(self.id.clone()), listener)
    }

    pub fn source_id(&mut self) -> Result<String> {
        Ok(self.source()?.id().to_string())
    }

    pub fn get_data(&mut self) -> Result<AnalyzerData> {
        let id = self.id.clone();
        self.source()?.read_data(&id)
    }

    pub fn frequency_bands(&mut self) -> Result<FrequencyBands> {
        self.with(|a| a.frequency_bands())
    }

    pub fn frequency_range(&mut self, low: f32, high: f32) -> Result<f32> {
        self.with(|a| a.frequency_range(low, high))
    }

    pub fn frequency_range_advanced(
        &mut self,
        low: f32,
        high: f32,
        mode: RangeMode,
    ) -> Result<f32> {
        self.with(|a| a.frequency_range_advanced(low, high, mode))
    }

    pub fn frequency_ranges(&mut self, ranges: &[FrequencyRange]) -> Result<Vec<f32>> {
        self.with(|a| a.frequency_ranges(ranges))
    }

    pub fn detect_beat(&mut self, threshold: f32) -> Result<BeatResult> {
        self.with(|a| a.detect_beat(threshold))
    }

    pub fn bpm(&mut self) -> Result<BpmEstimate> {
        self.with(|a| a.bpm())
    }

    pub fn reset_bpm(&mut self) -> Result<()> {
        self.with(|a| a.reset_bpm())
    }

    pub fn tap_tempo(&mut self) -> Result<BpmEstimate> {
        self.with(|a| a.tap_tempo())
    }

    pub fn create_percussion_detector(
        &mut self,
        id: &str,
        config: PercussionConfig,
    ) -> Result<()> {
        self.with(|a| a.create_percussion_detector(id, config))?
    }

    pub fn remove_percussion_detector(&mut self, id: &str) -> Result<()> {
        self.with(|a| a.remove_percussion_detector(id))?
    }

    pub fn reset_percussion(&mut self, id: &str) -> Result<()> {
        self.with(|a| a.reset_percussion(id))?
    }

    pub fn detect_percussion(&mut self, id: &str) -> Result<PercussionResult> {
        self.with(|a| a.detect_percussion(id))?
    }

    pub fn detect_kind(&mut self, kind: PercussionKind) -> Result<PercussionResult> {
        self.with(|a| a.detect_kind(kind))
    }

    pub fn detect_kick(&mut self) -> Result<PercussionResult> {
        self.detect_kind(PercussionKind::Kick)
    }

    pub fn detect_snare(&mut self) -> Result<PercussionResult> {
        self.detect_kind(PercussionKind::Snare)
    }

    pub fn detect_hihat(&mut self) -> Result<PercussionResult> {
        self.detect_kind(PercussionKind::HiHat)
    }

    pub fn detect_clap(&mut self) -> Result<PercussionResult> {
        self.detect_kind(PercussionKind::Clap)
    }

    pub fn detect_tom(&mut self) -> Result<PercussionResult> {
        self.detect_kind(PercussionKind::Tom)
    }

    pub fn detect_cymbal(&mut self) -> Result<PercussionResult> {
        self.detect_kind(PercussionKind::Cymbal)
    }

    pub fn enable_normalization(&mut self, config: NormalizationConfig) -> Result<()> {
        let id = self.id.clone();
        self.source()?.enable_normalization(&id, config)
    }

    pub fn disable_normalization(&mut self) -> Result<()> {
        let id = self.id.clone();
        self.source()?.disable_normalization(&id)
    }

    pub fn normalization_state(&mut self) -> Result<NormalizationState> {
        self.with(|a| a.normalization_state())
    }

    pub fn config(&mut self) -> Result<AnalyzerConfig> {
        self.with(|a| a.config().clone())
    }

    pub fn update_config(&mut self, patch: &AnalyzerConfigPatch) -> Result<AnalyzerConfig> {
        let id = self.id.clone();
        self.source()?.update_analyzer_config(&id, patch)
    }

    pub fn set_gain(&mut self, gain: f32) -> Result<()> {
        self.update_config(&AnalyzerConfigPatch {
            gain: Some(gain),
            ..Default::default()
        })
        .map(|_| ())
    }

    pub fn set_gain_smooth(&mut self, target: f32, time_constant: f32) -> Result<()> {
        let id = self.id.clone();
        self.source()?.set_gain_smooth(&id, target, time_constant)
    }

    /// Remove the analyzer, tearing its source down if it was the last one.
    pub fn destroy(self) -> Result<()> {
        self.manager.remove_analyzer(&self.id)
    }
}
