//! Drives a workflow across one or more serverless clusters.
//!
//! [`Orchestrator::run_job`] validates a [`JobRequest`], stages its inputs
//! into object storage, hands the step graph to the [`Scheduler`], downloads
//! the top-level outputs and always removes what the job stored.

pub mod assignment;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod scheduler;

pub use assignment::AssignmentTable;
pub use error::{ClientError, Result};
pub use events::{EventSink, JobEvent};
pub use orchestrator::{CleanupSummary, JobRequest, JobResult, Orchestrator, OutputFile, StepReport};
pub use registry::{ClusterInfo, ClusterRegistry, PlannedStep};
pub use scheduler::{JobOutcome, JobStatus, Scheduler, SchedulerSettings};
