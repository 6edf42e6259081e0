use cumulus_core::errors::ErrorKind;
use cumulus_core::model::JobId;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

/// Progress notifications for whoever drives a job, typically the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Validated {
        steps: usize,
        clusters: usize,
    },
    StagingInputs {
        job_id: JobId,
        total: usize,
    },
    InputStaged {
        name: String,
        objects: usize,
    },
    StepAssigned {
        step: String,
        cluster: String,
    },
    StepSubmitted {
        step: String,
        cluster: String,
        attempt: u32,
    },
    StepRunning {
        step: String,
        cluster: String,
    },
    StepRetrying {
        step: String,
        attempt: u32,
        reason: String,
    },
    StepSucceeded {
        step: String,
        cluster: String,
    },
    StepFailed {
        step: String,
        cluster: String,
        kind: ErrorKind,
        message: String,
    },
    StepTimedOut {
        step: String,
        cluster: String,
    },
    Progress {
        running: usize,
        succeeded: usize,
        failed: usize,
        pending: usize,
        total: usize,
    },
    JobAborted {
        reason: String,
    },
    DownloadingOutputs {
        total: usize,
    },
    OutputDownloaded {
        name: String,
        path: PathBuf,
    },
    CleanedUp {
        deleted: usize,
        failed: usize,
    },
}

/// Optional event channel; sending never fails the job.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<Sender<JobEvent>>);

impl EventSink {
    pub fn new(sender: Option<Sender<JobEvent>>) -> Self {
        Self(sender)
    }

    pub fn send(&self, event: JobEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
