//! Concrete implementations of the core store traits: Postgres for clients,
//! messages and credit locks; Redis for the idempotency gate and the rate
//! limiter.

mod clients;
mod credit;
mod idempotency;
mod messages;
mod rate_limit;

pub use clients::PgClientStore;
pub use credit::PgCreditLedger;
pub use idempotency::RedisIdempotencyGate;
pub use messages::PgMessageStore;
pub use rate_limit::RedisRateLimiter;
