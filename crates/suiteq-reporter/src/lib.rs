//! Build result aggregation for suiteq.
//!
//! The reporter only reads the build (apart from stamping its finish time
//! and folding timings back into the shared history). It prints failures as
//! they are recorded and a summary once the build is over.

pub mod error;
pub mod reporter;
pub mod rerun;
pub mod summary;

pub use error::{ReportError, ReportResult};
pub use reporter::{ReportOutcome, Reporter, ReporterConfig};
pub use summary::{BuildSummary, FlakyJob, humanize_duration};
