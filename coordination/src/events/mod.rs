//! Event aggregation for coordination sessions
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the [`CoordinationEvent`] vocabulary and
//!    the [`SessionEvent`] envelope placed on a session's timeline.
//!
//! 2. **Aggregator** (`bus.rs`): merges every worker's stream into one
//!    ordered timeline per session, with per-subscriber backpressure and
//!    optional persistence through an [`EventSink`].
//!
//! 3. **Event History** (`history.rs`): loading and replaying a persisted
//!    `events.jsonl` log.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐  seq  ┌──────────────┐     ┌──────────────┐
//! │   Workers    │──────▶│  Aggregator  │────▶│  Subscribers │
//! │  (publish)   │       │  (reorder)   │     │   (recv)     │
//! └──────────────┘       └──────┬───────┘     └──────────────┘
//!                               │
//!                               ▼
//!                        ┌──────────────┐
//!                        │ events.jsonl │
//!                        └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use coordination::events::{CoordinationEvent, EventAggregator};
//!
//! let bus = EventAggregator::new().with_sink(store.clone()).shared();
//! bus.register(&session_id)?;
//! let mut stream = bus.subscribe(&session_id)?;
//!
//! bus.publish(&session_id, "agent_a", 0, CoordinationEvent::ContentChunk {
//!     text: "thinking...".to_string(),
//! })?;
//!
//! while let Some(event) = stream.recv().await {
//!     println!("{}", event.event_type());
//! }
//! ```

pub mod bus;
pub mod history;
pub mod types;

// Re-export core types
pub use bus::{
    EventAggregator, EventBusError, EventBusResult, EventFilter, EventSink, EventStream,
    FilteredStream, SharedEventAggregator, DEFAULT_RETAINED_SESSIONS, DEFAULT_SUBSCRIBER_CAPACITY,
};
pub use history::{EventHistory, EventStats, HistoryError, HistoryResult, ReplayStats};
pub use types::{CoordinationEvent, EventId, EventPriority, SessionEvent};
