//! VJ Audio Engine
//!
//! Real-time audio analysis for live visuals. Capture devices, desktop
//! loopback and single applications feed pooled sources; each source runs a
//! small conditioning graph and any number of analyzers reading spectra,
//! frequency bands, beats, tempo and percussion hits from it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vj_audio_engine::{CpalBackend, EngineConfig, EngineEvent, EventKind, Manager};
//!
//! # async fn demo() -> vj_audio_engine::Result<()> {
//! let mut manager = Manager::new(EngineConfig::default(), Arc::new(CpalBackend::new()));
//! manager.init()?;
//! let id = manager.create_analyzer(Default::default()).await?;
//! manager.subscribe(
//!     EventKind::Beat,
//!     Box::new(|event: &EngineEvent| println!("{:?}", event)),
//! );
//! let bands = manager.analyzer(&id)?.frequency_bands()?;
//! println!("bass {}", bands.bass);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod source;

#[cfg(test)]
mod testing;

pub use analysis::{
    AnalyzerData, BeatResult, BpmEstimate, FrequencyBands, FrequencyRange, NormalizationState,
    PercussionConfig, PercussionKind, PercussionResult, RangeMode,
};
pub use audio::{CaptureBackend, CpalBackend, Device, DeviceKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AnalyzerConfig, AnalyzerConfigPatch, CaptureType, CreateAnalyzerOptions, EngineConfig,
    NormalizationConfig, WindowFunction,
};
pub use error::{EngineError, ErrorCode, Result};
pub use events::{EngineEvent, EventKind, EventPayload, Listener, SourceState, Subscription};
pub use manager::{AnalyzerHandle, Manager};
pub use source::{SourceInfo, SourceKey};
