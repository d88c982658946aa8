//! Core domain types and traits for suiteq.
//!
//! This crate contains:
//! - Build and worker identifiers
//! - The execution engine trait and its observer callbacks
//! - Job id helpers
//! - The telemetry sink trait

pub mod engine;
pub mod error;
pub mod id;
pub mod job;
pub mod telemetry;

pub use error::{Error, Result};
pub use id::{BuildId, WorkerId};
