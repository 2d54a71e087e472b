//! Shared types, error model, and configuration for loadctl.
//!
//! This crate is the foundation depended on by all other loadctl crates.
//! It provides:
//! - [`LoadCtlError`] — the unified error type
//! - Domain types ([`SourceConfig`], [`Watermark`], [`ExecutionRecord`], ids and enums)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DatabaseConfig, WatermarkConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{LoadCtlError, Result};
pub use types::{
    ExecutionId, ExecutionRecord, LoadStrategy, NewRun, NewSource, RunFilter, RunOutcome,
    RunStatus, SourceConfig, SourceId, SourceType, SourceUpdate, TerminalStatus, Watermark,
    WatermarkAdvance, WatermarkPolicy,
};
