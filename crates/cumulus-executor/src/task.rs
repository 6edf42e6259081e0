use crate::error::TaskError;
use crate::rpc::InvocationId;
use chrono::{DateTime, Utc};
use cumulus_core::graph::Step;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::TimedOut
        )
    }

    /// Edges of the task lifecycle. `Pending -> Pending` is the retry
    /// self-loop after a transient submission failure.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Pending, Pending)
                | (Submitted, Running)
                | (Submitted, Failed)
                | (Submitted, TimedOut)
                | (Submitted, Pending)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Submitted => "submitted",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed-out",
        };
        write!(f, "{}", s)
    }
}

/// The immutable part of a task, shared with its attempt drivers.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub step: Step,
    pub step_index: usize,
    pub cluster_index: usize,
    pub cluster_name: String,
    pub max_retries: u32,
}

/// A proposed state change. Only the scheduler commits these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Submitted {
        invocation: InvocationId,
    },
    Running,
    Succeeded {
        outputs: BTreeMap<String, Vec<String>>,
        exit_code: Option<i32>,
        log_ref: Option<String>,
    },
    Failed(TaskError),
    TimedOut(TaskError),
    /// Back to `Pending` for another attempt on the same cluster.
    Retry(TaskError),
}

impl Transition {
    pub fn target(&self) -> TaskState {
        match self {
            Transition::Submitted { .. } => TaskState::Submitted,
            Transition::Running => TaskState::Running,
            Transition::Succeeded { .. } => TaskState::Succeeded,
            Transition::Failed(_) => TaskState::Failed,
            Transition::TimedOut(_) => TaskState::TimedOut,
            Transition::Retry(_) => TaskState::Pending,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("step '{step}' cannot move from {from} to {to}")]
    Illegal {
        step: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("step '{step}' has used all {max_retries} retries")]
    RetryBudgetExhausted { step: String, max_retries: u32 },
}

#[derive(Debug, Clone)]
pub struct Task {
    pub spec: Arc<TaskSpec>,
    pub state: TaskState,
    pub retry_count: u32,
    /// Attempts started, including the current one.
    pub attempts: u32,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<TaskError>,
    pub invocation: Option<InvocationId>,
    pub outputs: BTreeMap<String, Vec<String>>,
    pub log_ref: Option<String>,
}

impl Task {
    pub fn new(spec: Arc<TaskSpec>) -> Self {
        Self {
            spec,
            state: TaskState::Pending,
            retry_count: 0,
            attempts: 0,
            submitted_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            invocation: None,
            outputs: BTreeMap::new(),
            log_ref: None,
        }
    }

    pub fn step(&self) -> &str {
        &self.spec.step.name
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.spec.max_retries
    }

    /// Applies `transition` if the lifecycle allows it and returns the new state.
    pub fn commit(&mut self, transition: Transition) -> Result<TaskState, TransitionError> {
        let next = transition.target();
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                step: self.step().to_string(),
                from: self.state,
                to: next,
            });
        }
        if matches!(transition, Transition::Retry(_)) && !self.retries_left() {
            return Err(TransitionError::RetryBudgetExhausted {
                step: self.step().to_string(),
                max_retries: self.spec.max_retries,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Submitted { invocation } => {
                self.invocation = Some(invocation);
                self.submitted_at = Some(now);
            }
            Transition::Running => {
                self.started_at.get_or_insert(now);
            }
            Transition::Succeeded {
                outputs,
                exit_code,
                log_ref,
            } => {
                self.outputs = outputs;
                self.exit_code = exit_code;
                self.log_ref = log_ref;
                self.error = None;
                self.finished_at = Some(now);
            }
            Transition::Failed(error) | Transition::TimedOut(error) => {
                self.exit_code = error.exit_code.or(self.exit_code);
                if error.log_ref.is_some() {
                    self.log_ref = error.log_ref.clone();
                }
                self.error = Some(error);
                self.finished_at = Some(now);
            }
            Transition::Retry(error) => {
                self.retry_count += 1;
                self.invocation = None;
                self.error = Some(error);
            }
        }
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::errors::ErrorKind;

    fn task(max_retries: u32) -> Task {
        Task::new(Arc::new(TaskSpec {
            step: Step {
                name: "s".into(),
                command: "true".into(),
                env: BTreeMap::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                depends_on: Vec::new(),
            },
            step_index: 0,
            cluster_index: 0,
            cluster_name: "c1".into(),
            max_retries,
        }))
    }

    fn transient() -> TaskError {
        TaskError::new(ErrorKind::TransientExecution, "503")
    }

    #[test]
    fn test_forward_path() {
        let mut t = task(0);
        t.commit(Transition::Submitted {
            invocation: InvocationId("i".into()),
        })
        .unwrap();
        t.commit(Transition::Running).unwrap();
        let state = t
            .commit(Transition::Succeeded {
                outputs: BTreeMap::new(),
                exit_code: Some(0),
                log_ref: None,
            })
            .unwrap();
        assert_eq!(state, TaskState::Succeeded);
        assert!(t.finished_at.is_some());
        assert!(t.started_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut t = task(3);
        t.commit(Transition::Failed(TaskError::new(ErrorKind::Submission, "400")))
            .unwrap();
        for transition in [
            Transition::Running,
            Transition::Retry(transient()),
            Transition::Failed(transient()),
        ] {
            assert!(matches!(
                t.commit(transition),
                Err(TransitionError::Illegal { .. })
            ));
        }
        assert_eq!(t.state, TaskState::Failed);
    }

    #[test]
    fn test_cannot_skip_submission() {
        let mut t = task(0);
        assert!(t.commit(Transition::Running).is_err());
        assert!(t
            .commit(Transition::TimedOut(TaskError::timeout(
                std::time::Duration::from_secs(1)
            )))
            .is_err());
    }

    #[test]
    fn test_retry_budget_enforced() {
        let mut t = task(2);
        assert_eq!(t.commit(Transition::Retry(transient())).unwrap(), TaskState::Pending);
        t.commit(Transition::Submitted {
            invocation: InvocationId("i".into()),
        })
        .unwrap();
        t.commit(Transition::Retry(transient())).unwrap();
        assert_eq!(t.retry_count, 2);
        assert!(t.invocation.is_none());
        assert!(matches!(
            t.commit(Transition::Retry(transient())),
            Err(TransitionError::RetryBudgetExhausted { .. })
        ));
    }

    #[test]
    fn test_failure_records_exit_code() {
        let mut t = task(0);
        t.commit(Transition::Submitted {
            invocation: InvocationId("i".into()),
        })
        .unwrap();
        t.commit(Transition::Failed(TaskError::remote_failure(
            Some(7),
            Some("log".into()),
        )))
        .unwrap();
        assert_eq!(t.exit_code, Some(7));
        assert_eq!(t.log_ref.as_deref(), Some("log"));
    }
}
