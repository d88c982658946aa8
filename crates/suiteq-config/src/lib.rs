//! Configuration for suiteq.
//!
//! This crate handles:
//! - The `suiteq.kdl` settings file
//! - Resolving test files and directories into a job list

pub mod error;
pub mod files;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use files::{FileFilter, resolve_files};
pub use settings::{
    FileSettings, ReporterSettings, Settings, ShutdownSignal, WorkerSettings,
};
