//! Progressive enrichment engine
//!
//! Leaves first: breakers, in-flight registry, cache, scheduler,
//! aggregator, session, publisher, and the orchestrator that wires them.

pub mod aggregator;
pub mod breaker;
pub mod cache;
pub mod error;
pub mod inflight;
pub mod orchestrator;
pub mod publisher;
pub mod scheduler;
pub mod session;

pub use aggregator::{FieldAggregator, FieldDelta, FieldEntry};
pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerStatus, CircuitBreakerRegistry};
pub use cache::{TieredCache, TtlPolicy};
pub use error::OrchestrationError;
pub use inflight::InFlightRegistry;
pub use orchestrator::{Orchestrator, OrchestratorSettings, SessionHandle};
pub use publisher::{StreamEvent, TerminalKind};
pub use scheduler::{LayerScheduler, RetryPolicy};
pub use session::{EnrichmentSession, SessionStatus};
