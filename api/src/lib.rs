//! Hookscribe API: lists captured webhooks and synthesizes handler code
//! for a selection of them through a text-generation backend.

pub mod aggregate;
pub mod error;
pub mod generation;
pub mod pagination;
pub mod prompt;
pub mod relay;
pub mod server;
pub mod session;
