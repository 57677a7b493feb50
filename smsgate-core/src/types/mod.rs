//! Domain model for the gateway.

mod client;
mod credit;
mod job;
mod message;

pub use client::Client;
pub use credit::{CreditLock, LockState};
pub use job::{DlqJob, DlrNotification, DlrStatus, SendJob};
pub use message::{Message, MessageStatus, NewMessage};
