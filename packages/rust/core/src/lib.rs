//! Control-plane operations for incremental ETL pipelines.
//!
//! This crate composes the source registry, watermark store, and execution
//! log from `loadctl-storage` into the [`ControlPlane`] service that an
//! orchestrator and its extract/load workers call.

pub mod control;
pub mod plan;

pub use control::ControlPlane;
pub use plan::ExtractPlan;
