//! Async trait seams between the gateway logic and its collaborators.
//!
//! The Postgres/Redis implementations live in `smsgate-base`; tests swap in
//! in-memory versions.

mod client_store;
mod credit_ledger;
mod idempotency;
mod message_store;
mod provider;
mod rate_limiter;

pub use client_store::ClientStore;
pub use credit_ledger::CreditLedger;
pub use idempotency::IdempotencyGate;
pub use message_store::MessageStore;
pub use provider::{OutboundSms, ProviderSendOutcome, SendStatus, SmsProvider};
pub use rate_limiter::{RateDecision, RateLimiter};
