//! Relay core library: channel adapters, the per-channel dispatch engine with session
//! debouncing, the pipeline client, configuration and the gateway process.

pub mod channels;
pub mod config;
pub mod gateway;
pub mod init;
pub mod pipeline;
pub mod routing;
