//! Engine events and their dispatch tables

use crate::analysis::{AnalyzerData, FrequencyBands};
use crate::audio::devices::Device;
use crate::error::{EngineError, ErrorCode};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

/// Lifecycle state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Active,
    Inactive,
    Suspended,
}

/// Payload of a `data` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPayload {
    pub data: AnalyzerData,
    pub bands: FrequencyBands,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    Data(Box<DataPayload>),
    DeviceChange(Vec<Device>),
    StateChange(SourceState),
    Error {
        code: ErrorCode,
        message: String,
    },
    Peak {
        level: f32,
        frequency: f32,
    },
    Beat {
        intensity: f32,
        bpm: f32,
        bpm_confidence: f32,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::DeviceChange(_) => EventKind::DeviceChange,
            Self::StateChange(_) => EventKind::StateChange,
            Self::Error { .. } => EventKind::Error,
            Self::Peak { .. } => EventKind::Peak,
            Self::Beat { .. } => EventKind::Beat,
        }
    }

    pub fn error(err: &EngineError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// An event as delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    pub timestamp: f64,
    /// `None` for engine-wide events such as device changes
    pub source_id: Option<String>,
    pub analyzer_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Data,
    DeviceChange,
    StateChange,
    Error,
    Peak,
    Beat,
}

pub type Listener = Box<dyn FnMut(&EngineEvent) + Send>;

/// Token returned by `subscribe`; pass it back to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: EventKind,
    token: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

struct Entry {
    token: u64,
    /// Only deliver events of this analyzer
    analyzer_id: Option<String>,
    listener: Listener,
}

impl Entry {
    fn wants(&self, analyzer_id: Option<&str>) -> bool {
        match &self.analyzer_id {
            None => true,
            Some(filter) => analyzer_id == Some(filter.as_str()),
        }
    }
}

/// One dispatch table per event kind
#[derive(Default)]
pub struct EventBus {
    next_token: u64,
    tables: HashMap<EventKind, Vec<Entry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`, optionally limited to one analyzer.
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        analyzer_id: Option<String>,
        listener: Listener,
    ) -> Subscription {
        self.next_token += 1;
        let token = self.next_token;
        self.tables.entry(kind).or_default().push(Entry {
            token,
            analyzer_id,
            listener,
        });
        Subscription { kind, token }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let Some(table) = self.tables.get_mut(&subscription.kind) else {
            return false;
        };
        let before = table.len();
        table.retain(|e| e.token != subscription.token);
        table.len() != before
    }

    /// Drop every listener bound to `analyzer_id`.
    pub fn remove_analyzer(&mut self, analyzer_id: &str) {
        for table in self.tables.values_mut() {
            table.retain(|e| e.analyzer_id.as_deref() != Some(analyzer_id));
        }
    }

    /// Whether an event of `kind` for `analyzer_id` would reach anyone.
    pub fn has_listeners(&self, kind: EventKind, analyzer_id: Option<&str>) -> bool {
        self.tables
            .get(&kind)
            .map(|table| table.iter().any(|e| e.wants(analyzer_id)))
            .unwrap_or(false)
    }

    pub fn listener_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Deliver `event` to every interested listener. A panicking listener is
    /// logged and skipped; the rest still receive the event.
    pub fn emit(&mut self, event: &EngineEvent) -> usize {
        let Some(table) = self.tables.get_mut(&event.kind()) else {
            return 0;
        };

        let mut delivered = 0;
        for entry in table.iter_mut() {
            if !entry.wants(event.analyzer_id.as_deref()) {
                continue;
            }
            let listener = &mut entry.listener;
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(cause) => {
                    let message = cause
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| cause.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    log::error!(
                        "Listener {} for {:?} events panicked: {}",
                        entry.token,
                        event.kind(),
                        message
                    );
                }
            }
        }
        delivered
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
