//! Scheduling and job execution for suiteq.
//!
//! Every worker runs the same code. The first worker of a build to win the
//! election publishes the schedule; all of them then pull jobs from the
//! shared queue until it is exhausted or the build fails fast. A supervisor
//! process wraps each worker so a dying worker never strands its job.

pub mod error;
pub mod heartbeat;
pub mod recorder;
pub mod schedule;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use error::{WorkerError, WorkerResult};
pub use schedule::{ScheduleConfig, publish_schedule};
pub use supervisor::{FORCED_EXIT_CODE, SUPERVISED_CHILD_ENV, Supervisor, SupervisorConfig};
pub use worker::{IdlePolicy, Worker, WorkerConfig, WorkerExit};
