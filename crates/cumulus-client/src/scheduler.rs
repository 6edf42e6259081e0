use crate::assignment::AssignmentTable;
use crate::events::{EventSink, JobEvent};
use cumulus_core::config::ExecutionConfig;
use cumulus_core::errors::{ErrorKind, SchedulingError};
use cumulus_core::graph::{InputSource, StepGraph};
use cumulus_executor::{
    deadline_after, sleep_until_deadline, AttemptEvent, AttemptRequest, AttemptUpdate, Task,
    TaskError, TaskExecutionManager, TaskSpec, TaskState, Transition, UpstreamOutput,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed-out",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Upper bound on tasks with a live attempt.
    pub concurrency: usize,
    pub continue_on_error: bool,
    pub job_timeout: Option<Duration>,
    pub max_retries: u32,
}

impl From<&ExecutionConfig> for SchedulerSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.effective_concurrency(),
            continue_on_error: config.continue_on_error(),
            job_timeout: config.job_timeout(),
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Indexed like the graph's steps.
    pub tasks: Vec<Task>,
    /// Topological order the tasks were released in.
    pub order: Vec<usize>,
    pub assignments: BTreeMap<String, String>,
}

impl JobOutcome {
    pub fn task(&self, step: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.step() == step)
    }
}

/// The single control loop of a job.
///
/// Attempt drivers run concurrently and report back over a channel, but only
/// this loop commits state transitions, so every task has exactly one writer.
pub struct Scheduler<'a> {
    graph: &'a StepGraph,
    manager: Arc<TaskExecutionManager>,
    cluster_names: Vec<String>,
    settings: SchedulerSettings,
    events: EventSink,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a StepGraph,
        manager: Arc<TaskExecutionManager>,
        cluster_names: Vec<String>,
        settings: SchedulerSettings,
        events: EventSink,
    ) -> Self {
        Self {
            graph,
            manager,
            cluster_names,
            settings,
            events,
        }
    }

    pub async fn run(self, table: &mut AssignmentTable) -> Result<JobOutcome, SchedulingError> {
        let graph = self.graph;
        let order = graph.topological_order()?;
        let n = graph.steps.len();

        let mut rank = vec![0; n];
        for (position, &i) in order.iter().enumerate() {
            rank[i] = position;
        }

        let mut cluster_of = vec![0; n];
        let mut assignments = BTreeMap::new();
        for &i in &order {
            let step = &graph.steps[i].name;
            let index = table.assign(step);
            let cluster = self.cluster_names.get(index).cloned().unwrap_or_default();
            tracing::debug!("Step '{}' assigned to cluster '{}'", step, cluster);
            self.events.send(JobEvent::StepAssigned {
                step: step.clone(),
                cluster: cluster.clone(),
            });
            assignments.insert(step.clone(), cluster);
            cluster_of[i] = index;
        }

        let tasks: Vec<Task> = graph
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                Task::new(Arc::new(TaskSpec {
                    step: step.clone(),
                    step_index: i,
                    cluster_index: cluster_of[i],
                    cluster_name: self
                        .cluster_names
                        .get(cluster_of[i])
                        .cloned()
                        .unwrap_or_default(),
                    max_retries: self.settings.max_retries,
                }))
            })
            .collect();

        let waiting_on: Vec<usize> = graph.steps.iter().map(|s| s.upstream().len()).collect();
        let ready = (0..n)
            .filter(|&i| waiting_on[i] == 0)
            .map(|i| (rank[i], i))
            .collect();

        let (tx, rx) = unbounded_channel::<AttemptEvent>();
        let mut run = Run {
            graph,
            manager: self.manager,
            deadline: self.settings.job_timeout.and_then(deadline_after),
            settings: self.settings,
            events: self.events,
            dependents: graph.dependents(),
            tasks,
            rank,
            waiting_on,
            ready,
            active: BTreeSet::new(),
            aborted: false,
            timed_out: false,
            tx,
            rx,
            attempts: JoinSet::new(),
            drivers: HashMap::new(),
            root: CancellationToken::new(),
        };
        run.drive().await;

        let status = if run.timed_out {
            JobStatus::TimedOut
        } else if run.tasks.iter().all(|t| t.state == TaskState::Succeeded) {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        tracing::info!("Job finished with status '{}'", status);

        Ok(JobOutcome {
            status,
            tasks: run.tasks,
            order,
            assignments,
        })
    }
}

struct Run<'a> {
    graph: &'a StepGraph,
    manager: Arc<TaskExecutionManager>,
    settings: SchedulerSettings,
    events: EventSink,
    dependents: Vec<Vec<usize>>,
    tasks: Vec<Task>,
    rank: Vec<usize>,
    /// Upstream steps not yet succeeded, per step.
    waiting_on: Vec<usize>,
    /// `(rank, index)` so ties break in topological order.
    ready: BTreeSet<(usize, usize)>,
    /// Tasks with a live attempt, including ones waiting out a retry delay.
    active: BTreeSet<usize>,
    aborted: bool,
    timed_out: bool,
    deadline: Option<Instant>,
    tx: UnboundedSender<AttemptEvent>,
    rx: UnboundedReceiver<AttemptEvent>,
    attempts: JoinSet<()>,
    /// `(step index, attempt)` driven by each spawned attempt.
    drivers: HashMap<Id, (usize, u32)>,
    root: CancellationToken,
}

enum Wake {
    Attempt(Option<AttemptEvent>),
    Joined(Result<(Id, ()), JoinError>),
    Deadline,
}

impl Run<'_> {
    async fn drive(&mut self) {
        loop {
            if !self.aborted {
                while self.active.len() < self.settings.concurrency {
                    let Some((_, i)) = self.ready.pop_first() else {
                        break;
                    };
                    self.start(i, Duration::ZERO);
                }
            }
            if self.active.is_empty() || self.aborted {
                break;
            }

            let wake = tokio::select! {
                event = self.rx.recv() => Wake::Attempt(event),
                Some(joined) = self.attempts.join_next_with_id() => Wake::Joined(joined),
                _ = sleep_until_deadline(self.deadline) => Wake::Deadline,
            };
            match wake {
                Wake::Attempt(Some(event)) => self.handle(event).await,
                Wake::Attempt(None) => break,
                Wake::Joined(joined) => self.reap(joined).await,
                Wake::Deadline => {
                    self.expire().await;
                    break;
                }
            }
        }

        self.root.cancel();
        self.attempts.shutdown().await;
        self.settle_leftovers();
    }

    fn start(&mut self, i: usize, delay: Duration) {
        let upstream = self.upstream_for(i);
        let task = &mut self.tasks[i];
        task.attempts += 1;
        let attempt = task.attempts;
        let req = AttemptRequest {
            spec: task.spec.clone(),
            attempt,
            upstream,
            delay,
        };
        tracing::debug!(
            "Starting attempt {} of step '{}' on '{}'",
            attempt,
            task.step(),
            task.spec.cluster_name
        );
        self.active.insert(i);
        let driver = self.attempts.spawn(self.manager.clone().run_attempt(
            req,
            self.tx.clone(),
            self.root.child_token(),
        ));
        self.drivers.insert(driver.id(), (i, attempt));
    }

    /// A driver that ends without reporting a terminal update fails its task.
    async fn reap(&mut self, joined: Result<(Id, ()), JoinError>) {
        let id = match &joined {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        let Some((i, attempt)) = self.drivers.remove(&id) else {
            return;
        };
        let Err(e) = joined else {
            return;
        };
        let task = &self.tasks[i];
        if task.attempts != attempt || task.state.is_terminal() {
            return;
        }
        tracing::error!(
            "Attempt {} of step '{}' stopped unexpectedly: {}",
            attempt,
            task.step(),
            e
        );
        if let Some(invocation) = task.invocation.clone() {
            self.manager
                .cancel(task.spec.cluster_index, &invocation)
                .await;
        }
        self.active.remove(&i);
        let error = TaskError::new(
            ErrorKind::Scheduling,
            format!("attempt {} stopped unexpectedly: {}", attempt, e),
        );
        if self.commit(i, Transition::Failed(error)) {
            self.on_failure(i).await;
        }
    }

    fn upstream_for(&self, i: usize) -> BTreeMap<String, UpstreamOutput> {
        let storage = self.manager.storage();
        self.graph.steps[i]
            .inputs
            .iter()
            .filter_map(|binding| match &binding.source {
                InputSource::Step { step, output } => {
                    let index = self.graph.index_of(step)?;
                    let keys = self.tasks[index]
                        .outputs
                        .get(output)
                        .cloned()
                        .unwrap_or_default();
                    Some((
                        binding.name.clone(),
                        UpstreamOutput {
                            prefix: storage.output_prefix(step),
                            keys,
                        },
                    ))
                }
                _ => None,
            })
            .collect()
    }

    fn commit(&mut self, i: usize, transition: Transition) -> bool {
        match self.tasks[i].commit(transition) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Rejected state change: {}", e);
                false
            }
        }
    }

    fn cluster_of(&self, i: usize) -> String {
        self.tasks[i].spec.cluster_name.clone()
    }

    async fn handle(&mut self, event: AttemptEvent) {
        let i = event.step_index;
        let Some(task) = self.tasks.get(i) else {
            return;
        };
        if event.attempt != task.attempts || task.state.is_terminal() {
            tracing::debug!(
                "Ignoring stale update for step '{}' attempt {}",
                task.step(),
                event.attempt
            );
            return;
        }
        let step = task.step().to_string();

        match event.update {
            AttemptUpdate::Submitted(invocation) => {
                if self.commit(i, Transition::Submitted { invocation }) {
                    self.events.send(JobEvent::StepSubmitted {
                        step,
                        cluster: self.cluster_of(i),
                        attempt: event.attempt,
                    });
                }
            }
            AttemptUpdate::Running => {
                if self.commit(i, Transition::Running) {
                    self.events.send(JobEvent::StepRunning {
                        step,
                        cluster: self.cluster_of(i),
                    });
                }
            }
            AttemptUpdate::Succeeded {
                outputs,
                exit_code,
                log_ref,
            } => {
                self.active.remove(&i);
                if self.commit(
                    i,
                    Transition::Succeeded {
                        outputs,
                        exit_code,
                        log_ref,
                    },
                ) {
                    tracing::info!("Step '{}' succeeded on '{}'", step, self.cluster_of(i));
                    self.events.send(JobEvent::StepSucceeded {
                        step,
                        cluster: self.cluster_of(i),
                    });
                    self.release_dependents(i);
                }
                self.report_progress();
            }
            AttemptUpdate::Errored(error) => {
                match self.manager.retry(&self.tasks[i], error) {
                    Transition::Retry(error) => {
                        let reason = error.to_string();
                        if !self.commit(i, Transition::Retry(error.clone())) {
                            self.active.remove(&i);
                            self.commit(i, Transition::Failed(error));
                            self.on_failure(i).await;
                        } else {
                            let delay = self.manager.retry_delay_for(&self.tasks[i]);
                            tracing::warn!(
                                "Step '{}' attempt {} failed ({}); retrying in {:?}",
                                step,
                                event.attempt,
                                reason,
                                delay
                            );
                            self.events.send(JobEvent::StepRetrying {
                                step,
                                attempt: event.attempt + 1,
                                reason,
                            });
                            self.start(i, delay);
                        }
                    }
                    other => {
                        self.active.remove(&i);
                        self.commit(i, other);
                        self.on_failure(i).await;
                    }
                }
            }
            AttemptUpdate::TimedOut(error) => {
                self.active.remove(&i);
                self.commit(i, Transition::TimedOut(error));
                self.on_failure(i).await;
            }
        }
    }

    fn release_dependents(&mut self, i: usize) {
        for &d in &self.dependents[i] {
            self.waiting_on[d] = self.waiting_on[d].saturating_sub(1);
            if self.waiting_on[d] == 0 && self.tasks[d].state == TaskState::Pending {
                self.ready.insert((self.rank[d], d));
            }
        }
    }

    fn report_failure(&self, i: usize) {
        let task = &self.tasks[i];
        let cluster = self.cluster_of(i);
        if task.state == TaskState::TimedOut {
            self.events.send(JobEvent::StepTimedOut {
                step: task.step().to_string(),
                cluster,
            });
            return;
        }
        let (kind, message) = task
            .error
            .as_ref()
            .map(|e| (e.kind, e.message.clone()))
            .unwrap_or((ErrorKind::PropagatedFailure, String::new()));
        self.events.send(JobEvent::StepFailed {
            step: task.step().to_string(),
            cluster,
            kind,
            message,
        });
    }

    async fn on_failure(&mut self, i: usize) {
        let step = self.tasks[i].step().to_string();
        match &self.tasks[i].error {
            Some(e) => tracing::error!("Step '{}' {}: {}", step, self.tasks[i].state, e),
            None => tracing::error!("Step '{}' {}", step, self.tasks[i].state),
        }
        self.report_failure(i);

        if self.settings.continue_on_error {
            for d in self.graph.transitive_dependents(i) {
                if self.tasks[d].state.is_terminal() {
                    continue;
                }
                self.ready.remove(&(self.rank[d], d));
                let error = TaskError::propagated(format!("upstream step '{}' failed", step));
                if self.commit(d, Transition::Failed(error)) {
                    tracing::warn!("Step '{}' skipped: upstream '{}' failed", self.tasks[d].step(), step);
                    self.report_failure(d);
                }
            }
            self.report_progress();
            return;
        }

        let reason = format!("step '{}' failed", step);
        tracing::error!("Aborting job: {}", reason);
        self.aborted = true;
        self.events.send(JobEvent::JobAborted {
            reason: reason.clone(),
        });
        self.cancel_active(|_| {
            Transition::Failed(TaskError::propagated(format!("cancelled: {}", reason)))
        })
        .await;
        self.fail_unstarted(TaskError::propagated(format!("not started: {}", reason)));
    }

    async fn expire(&mut self) {
        let reason = match self.settings.job_timeout {
            Some(limit) => format!("job timeout of {}s exceeded", limit.as_secs()),
            None => "job timeout exceeded".to_string(),
        };
        tracing::error!("Aborting job: {}", reason);
        self.timed_out = true;
        self.events.send(JobEvent::JobAborted {
            reason: reason.clone(),
        });
        self.cancel_active(|state| {
            let error = TaskError::new(ErrorKind::Timeout, reason.clone());
            match state {
                TaskState::Submitted | TaskState::Running => Transition::TimedOut(error),
                _ => Transition::Failed(error),
            }
        })
        .await;
        self.fail_unstarted(TaskError::new(
            ErrorKind::Timeout,
            "job timed out before the step started",
        ));
    }

    /// Stops every live attempt. Drivers holding an invocation ask their
    /// cluster to cancel it, each within one cancel grace period.
    async fn cancel_active(&mut self, transition_for: impl Fn(TaskState) -> Transition) {
        self.root.cancel();
        if !self.active.is_empty() {
            tracing::info!("Stopping {} in-flight attempts", self.active.len());
        }

        let grace = self.manager.settings().cancel_grace;
        let attempts = &mut self.attempts;
        let stopped = tokio::time::timeout(grace.saturating_mul(2), async move {
            while attempts.join_next().await.is_some() {}
        })
        .await;
        if stopped.is_err() {
            tracing::warn!("Some attempts did not stop within {:?}", grace.saturating_mul(2));
        }
        self.drivers.clear();

        // Invocations created before the abort but not yet recorded.
        while let Ok(event) = self.rx.try_recv() {
            let i = event.step_index;
            if !self.active.contains(&i) || self.tasks[i].attempts != event.attempt {
                continue;
            }
            match event.update {
                AttemptUpdate::Submitted(invocation) => {
                    self.commit(i, Transition::Submitted { invocation });
                }
                AttemptUpdate::Running => {
                    self.commit(i, Transition::Running);
                }
                _ => {}
            }
        }

        for i in std::mem::take(&mut self.active) {
            let transition = transition_for(self.tasks[i].state);
            if self.commit(i, transition) {
                self.report_failure(i);
            }
        }
    }

    fn fail_unstarted(&mut self, error: TaskError) {
        self.ready.clear();
        for i in 0..self.tasks.len() {
            if self.tasks[i].state == TaskState::Pending
                && self.tasks[i].attempts == 0
                && self.commit(i, Transition::Failed(error.clone()))
            {
                self.report_failure(i);
            }
        }
    }

    /// Anything still pending when the loop ends was never releasable.
    fn settle_leftovers(&mut self) {
        for i in 0..self.tasks.len() {
            if !self.tasks[i].state.is_terminal() {
                let error = TaskError::propagated("upstream steps never completed");
                if self.commit(i, Transition::Failed(error)) {
                    self.report_failure(i);
                }
            }
        }
    }

    fn report_progress(&self) {
        let total = self.tasks.len();
        let succeeded = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Succeeded)
            .count();
        let failed = self
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Failed | TaskState::TimedOut))
            .count();
        let running = self.active.len();
        self.events.send(JobEvent::Progress {
            running,
            succeeded,
            failed,
            pending: total.saturating_sub(succeeded + failed + running),
            total,
        });
    }
}
