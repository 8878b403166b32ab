//! Audio capture, conditioning and spectral analysis

pub mod capture;
pub mod devices;
pub mod features;
pub mod graph;
pub mod platform;
pub mod spectrum;

pub use capture::{CaptureBackend, CaptureStream, CpalBackend, PendingStream, StreamRequest};
pub use devices::{CaptureTarget, Device, DeviceKind, DeviceManager};
pub use graph::{PipelineShape, SharedGraph};
