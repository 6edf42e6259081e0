use async_trait::async_trait;
use cumulus_core::model::{ClusterConfig, StorageConfig};
use cumulus_executor::{
    ClusterConnector, ClusterRpc, InvocationId, InvocationPayload, RemoteState, RemoteStatus,
    RpcError, ServiceRef, ServiceSpec,
};
use cumulus_storage::ObjectStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// How a scripted cluster answers for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Writes `files` under the output prefix on invoke and reports success
    /// once `polls` status queries have been made.
    Succeed {
        files: Vec<(String, Vec<u8>)>,
        polls: u32,
    },
    /// Runs for `polls` status queries, then exits with `code`.
    Exit { code: i32, polls: u32 },
    /// Rejects every invoke with HTTP 503.
    Unavailable,
    /// Rejects every invoke with HTTP 401.
    Denied,
    /// Rejects every invoke with HTTP 400.
    Rejected,
    /// Stays running until cancelled.
    Hang,
    /// Accepts the invocation, then panics on the first status query.
    Panic,
    /// Answers 503 to the first `failures` invokes, then follows `then`.
    Flaky { failures: u32, then: Box<Behavior> },
}

impl Behavior {
    pub fn succeed() -> Self {
        Behavior::Succeed {
            files: Vec::new(),
            polls: 1,
        }
    }

    pub fn produce(name: &str, data: &[u8]) -> Self {
        Behavior::Succeed {
            files: vec![(name.to_string(), data.to_vec())],
            polls: 1,
        }
    }

    /// Like [`Behavior::produce`] but keeps running for `polls` queries.
    pub fn produce_slowly(name: &str, data: &[u8], polls: u32) -> Self {
        Behavior::Succeed {
            files: vec![(name.to_string(), data.to_vec())],
            polls,
        }
    }

    pub fn exit(code: i32) -> Self {
        Behavior::Exit { code, polls: 1 }
    }

    pub fn exit_after(code: i32, polls: u32) -> Self {
        Behavior::Exit { code, polls }
    }

    fn for_invoke(&self, invoke: u32) -> Behavior {
        match self {
            Behavior::Flaky { failures, .. } if invoke <= *failures => Behavior::Unavailable,
            Behavior::Flaky { failures, then } => then.for_invoke(invoke - failures),
            other => other.clone(),
        }
    }
}

/// Per-cluster answers, keyed by step name.
#[derive(Debug, Clone)]
pub struct Script {
    steps: HashMap<String, Behavior>,
    otherwise: Behavior,
    service_denied: bool,
    unreachable: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            steps: HashMap::new(),
            otherwise: Behavior::succeed(),
            service_denied: false,
            unreachable: false,
        }
    }
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: &str, behavior: Behavior) -> Self {
        self.steps.insert(step.to_string(), behavior);
        self
    }

    pub fn otherwise(mut self, behavior: Behavior) -> Self {
        self.otherwise = behavior;
        self
    }

    pub fn deny_service(mut self) -> Self {
        self.service_denied = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    fn behavior(&self, step: &str) -> &Behavior {
        self.steps.get(step).unwrap_or(&self.otherwise)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Verify { cluster: String },
    Invoke { cluster: String, step: String, attempt: u32 },
    Status { cluster: String, step: String },
    Cancel { cluster: String, step: String },
}

#[derive(Debug, Default)]
struct LogInner {
    calls: Vec<Call>,
    in_flight: usize,
    peak: usize,
}

/// Every RPC made against any scripted cluster of one connector, in order.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<LogInner>>);

impl CallLog {
    fn record(&self, call: Call) {
        self.0.lock().unwrap().calls.push(call);
    }

    fn started(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.in_flight += 1;
        inner.peak = inner.peak.max(inner.in_flight);
    }

    fn finished(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().calls.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().calls.is_empty()
    }

    /// Invoke calls for `step`, accepted or not.
    pub fn invokes(&self, step: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Invoke { step: s, .. } if s == step))
            .count()
    }

    /// Clusters `step` was invoked on, in call order.
    pub fn clusters_for(&self, step: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Invoke { cluster, step: s, .. } if s == step => Some(cluster),
                _ => None,
            })
            .collect()
    }

    /// Steps in the order of their first invoke.
    pub fn invoke_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for call in self.calls() {
            if let Call::Invoke { step, .. } = call {
                if !order.contains(&step) {
                    order.push(step);
                }
            }
        }
        order
    }

    pub fn cancels(&self, step: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Cancel { step: s, .. } if s == step))
            .count()
    }

    pub fn verifications(&self, cluster: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Verify { cluster: n } if n == cluster))
            .count()
    }

    /// Highest number of invocations that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.0.lock().unwrap().peak
    }
}

struct Invocation {
    step: String,
    behavior: Behavior,
    polls: u32,
    cancelled: bool,
    finished: bool,
}

/// A [`ClusterRpc`] that follows a [`Script`] instead of running anything.
pub struct ScriptedCluster {
    name: String,
    store: Arc<dyn ObjectStore>,
    script: Script,
    log: CallLog,
    invocations: Mutex<HashMap<InvocationId, Invocation>>,
    invokes: Mutex<HashMap<String, u32>>,
    counter: AtomicU64,
}

impl ScriptedCluster {
    pub fn new(name: &str, store: Arc<dyn ObjectStore>, script: Script, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            store,
            script,
            log,
            invocations: Mutex::new(HashMap::new()),
            invokes: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn status_error(code: u16) -> RpcError {
        RpcError::Status {
            code,
            message: format!("scripted HTTP {}", code),
        }
    }
}

#[async_trait]
impl ClusterRpc for ScriptedCluster {
    async fn create_or_verify_service(&self, spec: &ServiceSpec) -> Result<ServiceRef, RpcError> {
        self.log.record(Call::Verify {
            cluster: self.name.clone(),
        });
        if self.script.unreachable {
            return Err(RpcError::Unreachable(format!("{} is offline", self.name)));
        }
        if self.script.service_denied {
            return Err(Self::status_error(401));
        }
        Ok(ServiceRef {
            name: spec.name.clone(),
        })
    }

    async fn invoke(
        &self,
        _service: &ServiceRef,
        payload: &InvocationPayload,
    ) -> Result<InvocationId, RpcError> {
        self.log.record(Call::Invoke {
            cluster: self.name.clone(),
            step: payload.step.clone(),
            attempt: payload.attempt,
        });
        let n = {
            let mut invokes = self.invokes.lock().unwrap();
            let count = invokes.entry(payload.step.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let behavior = self.script.behavior(&payload.step).for_invoke(n);

        match &behavior {
            Behavior::Unavailable => return Err(Self::status_error(503)),
            Behavior::Denied => return Err(Self::status_error(401)),
            Behavior::Rejected => return Err(Self::status_error(400)),
            Behavior::Succeed { files, .. } => {
                for (name, data) in files {
                    self.store
                        .put(&format!("{}{}", payload.output_prefix, name), data.clone())
                        .await
                        .map_err(|e| RpcError::Other(e.to_string()))?;
                }
            }
            Behavior::Exit { .. } | Behavior::Hang | Behavior::Panic | Behavior::Flaky { .. } => {}
        }

        let id = InvocationId(format!(
            "{}-{}-{}",
            self.name,
            payload.step,
            self.counter.fetch_add(1, Ordering::Relaxed)
        ));
        self.invocations.lock().unwrap().insert(
            id.clone(),
            Invocation {
                step: payload.step.clone(),
                behavior,
                polls: 0,
                cancelled: false,
                finished: false,
            },
        );
        self.log.started();
        Ok(id)
    }

    async fn get_status(&self, id: &InvocationId) -> Result<RemoteStatus, RpcError> {
        let mut invocations = self.invocations.lock().unwrap();
        let inv = invocations
            .get_mut(id)
            .ok_or_else(|| RpcError::UnknownInvocation(id.clone()))?;
        self.log.record(Call::Status {
            cluster: self.name.clone(),
            step: inv.step.clone(),
        });
        inv.polls += 1;
        if inv.behavior == Behavior::Panic {
            drop(invocations);
            panic!("scripted status query for {} panicked", id);
        }

        let status = if inv.cancelled {
            RemoteStatus::new(RemoteState::Failed)
        } else {
            match &inv.behavior {
                Behavior::Succeed { polls, .. } if inv.polls >= *polls => RemoteStatus {
                    state: RemoteState::Succeeded,
                    exit_code: Some(0),
                    logs: Some(format!("{}/{}/stderr.log", self.name, id)),
                },
                Behavior::Exit { code, polls } if inv.polls >= *polls => RemoteStatus {
                    state: RemoteState::Failed,
                    exit_code: Some(*code),
                    logs: Some(format!("{}/{}/stderr.log", self.name, id)),
                },
                _ => RemoteStatus::new(RemoteState::Running),
            }
        };

        if status.state.is_terminal() && !inv.finished {
            inv.finished = true;
            self.log.finished();
        }
        Ok(status)
    }

    async fn cancel(&self, id: &InvocationId) -> Result<(), RpcError> {
        let mut invocations = self.invocations.lock().unwrap();
        let inv = invocations
            .get_mut(id)
            .ok_or_else(|| RpcError::UnknownInvocation(id.clone()))?;
        self.log.record(Call::Cancel {
            cluster: self.name.clone(),
            step: inv.step.clone(),
        });
        inv.cancelled = true;
        if !inv.finished {
            inv.finished = true;
            self.log.finished();
        }
        Ok(())
    }
}

/// Connects every configured cluster to a [`ScriptedCluster`] sharing one
/// [`CallLog`].
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: HashMap<String, Script>,
    store: Option<Arc<dyn ObjectStore>>,
    log: CallLog,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster(mut self, name: &str, script: Script) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    /// Serves this store regardless of the configured endpoint.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ClusterConnector for ScriptedConnector {
    fn open_store(&self, config: &StorageConfig) -> cumulus_executor::Result<Arc<dyn ObjectStore>> {
        match &self.store {
            Some(store) => Ok(store.clone()),
            None => Ok(cumulus_storage::open_store(config)?),
        }
    }

    fn connect(
        &self,
        cluster: &ClusterConfig,
        store: Arc<dyn ObjectStore>,
    ) -> cumulus_executor::Result<Arc<dyn ClusterRpc>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.get(&cluster.name).cloned().unwrap_or_default();
        Ok(Arc::new(ScriptedCluster::new(
            &cluster.name,
            store,
            script,
            self.log.clone(),
        )))
    }
}
