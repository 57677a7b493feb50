//! Core primitives shared by all smsgate crates.
//!
//! This crate holds the domain model (clients, messages, credit locks, job
//! payloads), the message-part calculator, the typed error taxonomy, and the
//! async trait seams implemented by the storage and provider layers. It
//! performs no I/O of its own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod parts;
pub mod traits;
pub mod types;

pub use error::{GatewayError, GatewayResult};
pub use parts::{calculate_parts, is_gsm7};
pub use traits::*;
pub use types::*;
