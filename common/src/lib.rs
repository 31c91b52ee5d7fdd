//! Shared building blocks for the hookscribe capture and API servers.

pub mod config;
pub mod event;
pub mod protocol;
pub mod store;
