//! Event infrastructure: canonical schema, agent-event translation, the run
//! pipeline and SSE framing.

pub mod pipeline;
pub mod sse;
pub mod translation;
pub mod types;

pub use pipeline::{EventPipeline, EventSink, EventStream};
pub use sse::{SseDecoder, SseMessage};
pub use translation::translate_agent_event;
pub use types::{EventType, ToolEvent, ToolStatus};
