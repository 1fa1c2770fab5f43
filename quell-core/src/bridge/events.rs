//! Payloads published through the [`EventBridge`](super::EventBridge).
//!
//! ## Channel names
//!
//! | Event | Channel |
//! |-------|---------|
//! | `EngineStatusEvent` | `"quell://status"` |
//! | `StreamEvent` | `"quell://stream"` |
//! | `ProcessingMetrics` | `"quell://metrics"` |
//! | `ProcessedChunk` | `"quell://chunk"` |
//! | `ErrorRecord` | `"quell://error"` |

use serde::{Deserialize, Serialize};

use crate::engine::state::EngineState;
use crate::engine::stream::{PipelineKind, StreamState};
use crate::error::ErrorRecord;
use crate::metrics::ProcessingMetrics;
use crate::recording::ProcessedChunk;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum BridgeEvent {
    Status(EngineStatusEvent),
    Stream(StreamEvent),
    Metrics(ProcessingMetrics),
    Chunk(Box<ProcessedChunk>),
    Error(ErrorRecord),
}

impl BridgeEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Status(_) => "quell://status",
            Self::Stream(_) => "quell://stream",
            Self::Metrics(_) => "quell://metrics",
            Self::Chunk(_) => "quell://chunk",
            Self::Error(_) => "quell://error",
        }
    }
}

/// Emitted on every engine state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub state: EngineState,
    pub previous: EngineState,
    /// Neural backend unavailable; the amplitude gate is serving frames.
    pub degraded: bool,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Emitted when a stream starts, pauses, resumes or stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub stream_id: u64,
    pub pipeline: PipelineKind,
    pub state: StreamState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_is_tagged_and_kebab_cased() {
        let event = BridgeEvent::Status(EngineStatusEvent {
            state: EngineState::LoadingModule,
            previous: EngineState::CreatingContext,
            degraded: false,
            detail: None,
        });
        assert_eq!(event.channel(), "quell://status");

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["type"], "status");
        assert_eq!(json["payload"]["state"], "loading-module");
        assert_eq!(json["payload"]["previous"], "creating-context");
        assert_eq!(json["payload"]["degraded"], false);

        let round_trip: BridgeEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn stream_event_uses_camel_case_fields() {
        let event = BridgeEvent::Stream(StreamEvent {
            stream_id: 4,
            pipeline: PipelineKind::Inline,
            state: StreamState::Paused,
        });
        let json = serde_json::to_value(&event).expect("serialize stream event");
        assert_eq!(json["payload"]["streamId"], 4);
        assert_eq!(json["payload"]["pipeline"], "inline");
        assert_eq!(json["payload"]["state"], "paused");
    }

    #[test]
    fn error_event_carries_machine_code() {
        let record = crate::error::QuellError::ModuleLoad("all strategies failed".into()).record();
        let json = serde_json::to_value(BridgeEvent::Error(record)).expect("serialize error");
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "MODULE_LOAD");
    }
}
