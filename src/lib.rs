use std::fmt;

pub mod action;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod probe;
pub mod process;
pub mod progress;
pub mod registry;
pub mod reporter;
pub mod server;
pub mod service;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod task;
pub mod telemetry;
pub mod view;
pub mod worker;

pub use error::{Error, Result};

/// Caller identity as assigned by the transport.
pub type UserId = i64;

pub type JobId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}
