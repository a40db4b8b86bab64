//! Gateway: the long-running process hosting the channel manager.
//!
//! One HTTP port serves the health check and webhook ingress (`/telegram/webhook`,
//! `/webhook/:channel`); polling and socket adapters run on their own tasks.

mod server;

pub use server::{build_state, router, run_gateway, GatewayState};
