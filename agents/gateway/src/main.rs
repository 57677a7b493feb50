//! The smsgate gateway agent accepts send requests over HTTP, reserves
//! prepaid credit, enqueues work on the broker, drives provider submissions
//! through a worker pool, ingests delivery receipts and finalizes billing.

#![forbid(unsafe_code)]
#![warn(unused_extern_crates)]

use eyre::Result;

use smsgate_base::agent_main;

use crate::gateway::Gateway;

mod dlr;
mod gateway;
mod intake;
mod msg;
mod providers;
mod server;
mod settings;
mod sweeper;

#[cfg(test)]
mod testutil;

#[tokio::main]
async fn main() -> Result<()> {
    agent_main::<Gateway>().await
}
