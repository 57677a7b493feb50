//! Shared foundation for smsgate agents: settings loading, tracing and
//! metrics bootstrap, connection construction for Postgres, Redis and NATS,
//! the concrete store implementations, and the agent run loop.

#![forbid(unsafe_code)]
#![warn(unused_extern_crates)]

pub mod agent;
pub mod broker;
pub mod cache;
pub mod db;
pub mod metrics;
pub mod settings;
pub mod stores;
pub mod trace;

pub use agent::{agent_main, supervise, AgentTask, BaseAgent, LoadableFromSettings};
pub use broker::{Broker, SUBJECT_DLQ, SUBJECT_SEND};
pub use metrics::CoreMetrics;
pub use settings::Settings;
