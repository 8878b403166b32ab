//! Analysis layer: analyzers and the detectors they carry

pub mod analyzer;
pub mod bands;
pub mod beat;
pub mod normalization;
pub mod percussion;

pub use analyzer::{Analyzer, AnalyzerData};
pub use bands::{FrequencyBands, FrequencyRange, RangeMode};
pub use beat::{BeatResult, BpmEstimate};
pub use normalization::NormalizationState;
pub use percussion::{PercussionConfig, PercussionKind, PercussionResult, SecondaryBand};
