//! Outbound provider implementations.

mod http;
mod mock;

pub use http::HttpProvider;
pub use mock::MockProvider;
