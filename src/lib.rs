// ABOUTME: Library crate for project-sync
// ABOUTME: PostgreSQL to ClickHouse synchronization engines, stores and operator commands

pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod model;
pub mod sink;
pub mod source;
pub mod sync;
pub mod utils;

pub use config::SyncConfig;
pub use error::SyncError;
