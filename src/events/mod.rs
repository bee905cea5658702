//! Event system for engine observability
//!
//! Every significant action in the engine emits an [`EngineEvent`] to the
//! [`EventBus`]. Consumers (CLI progress printer, JSONL logger, a future
//! frontend) subscribe and read at their own pace; slow consumers lose
//! events instead of slowing the engine down.

mod bus;
mod logger;
mod types;

pub use bus::{EventBus, EventStream, SUBSCRIBER_QUEUE_CAPACITY};
pub use logger::spawn_event_logger;
pub use types::{EngineEvent, EventType};
