//! CLI Commands

pub mod peer;
pub mod server;
