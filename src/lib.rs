//! # Shutter
//!
//! A message-driven image ingest pipeline: uploads are fanned out from a
//! topic, validated, persisted idempotently, dead-lettered when rejected,
//! and confirmed or rejected by notification.
//!
//! ## Architecture
//!
//! ```text
//! Storage event -> Topic -> Router -> Queues -> Consumers -> Handlers
//!                                                  |            |
//!                                             dead-letter   RecordStore / Notifier
//! ```
//!
//! ## Modules
//!
//! - [`event`]: envelope codec and typed payloads
//! - [`schema`]: boundary schema checks for metadata messages
//! - [`filter`]: subscription filter predicates
//! - [`router`]: topic fan-out
//! - [`queue`]: at-least-once queues (in-memory, Redis streams)
//! - [`dlq`]: redrive policies and dead-letter stamping
//! - [`store`]: image record persistence
//! - [`notify`]: notifiers and notification templates
//! - [`workers`]: message handlers and the retry/dead-letter decision
//! - [`consumer`]: batching worker runtime
//! - [`pipeline`]: the fixed topology
//! - [`config`]: TOML configuration
//! - [`shutdown`]: graceful shutdown

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod filter;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod router;
pub mod schema;
pub mod shutdown;
pub mod store;
pub mod workers;

// Re-export commonly used types at crate root
pub use config::ShutterConfig;
pub use event::{Envelope, Message, MessageKind};
pub use pipeline::Pipeline;
pub use router::Router;
