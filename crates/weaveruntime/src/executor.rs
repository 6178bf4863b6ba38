use crate::checkpoint::{restore, Checkpoint, CheckpointEntry, CheckpointStore};
use crate::graph::DependencyGraph;
use crate::registry::NodeRegistry;
use crate::state::{ExecutionState, ExecutionStatus, NodeState, NodeStatus};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;
use weavecore::{
    CredentialVault, ErrorHandling, EventPublisher, EventStream, ExecutionId,
    ExecutionSubscription, JsonMap, NodeContext, NodeError, NodeExecutor, NodeFailure, NodeId,
    NodeSpec, Redactor, RetryPolicy, WeaveError, WorkflowGraph, WorkflowId,
};

/// Engine-wide limits and defaults. Workflow and node settings take
/// precedence where both exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on any workflow's own `max_concurrency`.
    pub max_concurrency: usize,
    /// Used when neither the node nor the workflow sets a timeout.
    pub node_timeout_ms: Option<u64>,
    /// Used when neither the node nor the workflow sets a retry policy.
    pub default_retry: RetryPolicy,
    pub event_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            node_timeout_ms: None,
            default_retry: RetryPolicy::none(),
            event_buffer_size: 1024,
        }
    }
}

/// Per-execution inputs: who runs it, with what credentials and data.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub user_id: String,
    pub credentials: Arc<CredentialVault>,
    /// Merged into the input of every root node.
    pub inputs: JsonMap,
    /// Visible to every node through its context.
    pub variables: JsonMap,
    pub trace_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            credentials: Arc::new(CredentialVault::empty(user_id.clone())),
            user_id,
            inputs: JsonMap::new(),
            variables: JsonMap::new(),
            trace_id: None,
        }
    }

    pub fn with_credentials(mut self, credentials: CredentialVault) -> Self {
        self.credentials = Arc::new(credentials);
        self
    }

    pub fn with_inputs(mut self, inputs: JsonMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_variables(mut self, variables: JsonMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Final outcome of one run of an execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub trace_id: String,
    pub status: ExecutionStatus,
    pub state: ExecutionState,
    /// Outputs of every completed node, including ones restored from checkpoints.
    pub outputs: BTreeMap<NodeId, JsonMap>,
    /// Node failures of this run, in the order they happened.
    pub failures: Vec<NodeFailure>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.state.node_status(id)
    }
}

/// Control surface of a running execution.
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    trace_id: String,
    cancel: CancellationToken,
    pause: CancellationToken,
    snapshot: watch::Receiver<ExecutionState>,
    events: Arc<EventStream>,
    join: JoinHandle<Result<ExecutionReport, WeaveError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Stop dispatching and cancel in-flight nodes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop dispatching and let in-flight nodes settle; the execution ends `paused`.
    pub fn pause(&self) {
        self.pause.cancel();
    }

    pub fn snapshot(&self) -> ExecutionState {
        self.snapshot.borrow().clone()
    }

    /// Events of this execution from now on.
    pub fn subscribe(&self) -> ExecutionSubscription {
        self.events.subscribe_execution(self.execution_id)
    }

    pub async fn wait(self) -> Result<ExecutionReport, WeaveError> {
        self.join
            .await
            .map_err(|e| WeaveError::Execution(format!("execution task failed: {e}")))?
    }
}

/// Drives workflow graphs to completion.
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    events: Arc<EventStream>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: EngineConfig,
    live: Arc<Mutex<HashSet<ExecutionId>>>,
}

/// Marks an execution as driven by this process until dropped.
struct LiveClaim {
    execution_id: ExecutionId,
    live: Arc<Mutex<HashSet<ExecutionId>>>,
}

impl LiveClaim {
    fn acquire(live: &Arc<Mutex<HashSet<ExecutionId>>>, execution_id: ExecutionId) -> Result<Self, WeaveError> {
        let mut ids = live
            .lock()
            .map_err(|_| WeaveError::Execution("live execution set is poisoned".to_string()))?;
        if !ids.insert(execution_id) {
            return Err(WeaveError::Execution(format!(
                "execution {execution_id} is already running"
            )));
        }
        Ok(Self {
            execution_id,
            live: live.clone(),
        })
    }
}

impl Drop for LiveClaim {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.live.lock() {
            ids.remove(&self.execution_id);
        }
    }
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        events: Arc<EventStream>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            events,
            checkpoints,
            config,
            live: Arc::default(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    /// Check structure and node types without running anything.
    pub fn validate(&self, workflow: &WorkflowGraph) -> Result<DependencyGraph, WeaveError> {
        let graph = DependencyGraph::build(workflow)?;
        self.registry.validate_types(workflow)?;
        Ok(graph)
    }

    /// Validate and launch a new execution.
    pub async fn start(
        &self,
        workflow: Arc<WorkflowGraph>,
        request: ExecutionRequest,
    ) -> Result<ExecutionHandle, WeaveError> {
        let graph = self.validate(&workflow)?;
        let execution_id = Uuid::new_v4();
        let claim = LiveClaim::acquire(&self.live, execution_id)?;
        let state = ExecutionState::new(
            execution_id,
            workflow.id,
            workflow.version,
            workflow.nodes.iter().map(|n| n.id.clone()),
        );
        Ok(self.launch(workflow, graph, state, 0, request, claim))
    }

    /// Start and wait for the report.
    pub async fn execute(
        &self,
        workflow: Arc<WorkflowGraph>,
        request: ExecutionRequest,
    ) -> Result<ExecutionReport, WeaveError> {
        self.start(workflow, request).await?.wait().await
    }

    /// Continue an execution from its checkpoint log. Completed nodes keep
    /// their outputs and are never run again. Fails while the execution is
    /// still being driven, by its original run or an earlier resume.
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        workflow: Arc<WorkflowGraph>,
        request: ExecutionRequest,
    ) -> Result<ExecutionHandle, WeaveError> {
        let graph = self.validate(&workflow)?;
        let claim = LiveClaim::acquire(&self.live, execution_id)?;
        let records = self.checkpoints.load(execution_id).await?;
        let restored = restore(&workflow, &records)?;
        let mut state = restored.state;
        if state.status.is_terminal() {
            return Err(WeaveError::Execution(format!(
                "execution {execution_id} already finished with status {}",
                state.status
            )));
        }
        // A paused run goes back to running through the state machine when
        // the loop starts; a crashed one is still `running`.
        state.reset_unfinished();
        tracing::info!(
            %execution_id,
            completed = state.count(NodeStatus::Completed),
            "Resuming execution from checkpoint"
        );
        Ok(self.launch(
            workflow,
            graph,
            state,
            restored.next_event_sequence,
            request,
            claim,
        ))
    }

    fn launch(
        &self,
        workflow: Arc<WorkflowGraph>,
        graph: DependencyGraph,
        state: ExecutionState,
        event_sequence: u64,
        request: ExecutionRequest,
        claim: LiveClaim,
    ) -> ExecutionHandle {
        let execution_id = state.execution_id;
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let publisher = self.events.publisher(
            execution_id,
            trace_id.clone(),
            Redactor::new(request.credentials.secret_values()),
        );
        publisher.resume_from(event_sequence);

        let cancel = CancellationToken::new();
        let pause = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());

        let limit = workflow
            .config
            .max_concurrency
            .min(self.config.max_concurrency)
            .max(1);
        let run = Run {
            workflow,
            graph,
            registry: self.registry.clone(),
            checkpoints: self.checkpoints.clone(),
            publisher,
            state,
            snapshot: snapshot_tx,
            request,
            config: self.config.clone(),
            limit,
            cancel: cancel.clone(),
            pause: pause.clone(),
            failures: Vec::new(),
            halted: false,
            failed: false,
        };

        let span = tracing::info_span!("execution", %execution_id, trace_id = %trace_id);
        let join = tokio::spawn(
            async move {
                let report = run.drive().await;
                drop(claim);
                report
            }
            .instrument(span),
        );

        ExecutionHandle {
            execution_id,
            trace_id,
            cancel,
            pause,
            snapshot: snapshot_rx,
            events: self.events.clone(),
            join,
        }
    }
}

type NodeResult = (u32, Result<JsonMap, NodeError>);
type Settled = (NodeId, Result<NodeResult, JoinError>);

/// Single owner of one execution's state for the duration of a run.
struct Run {
    workflow: Arc<WorkflowGraph>,
    graph: DependencyGraph,
    registry: Arc<NodeRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    publisher: EventPublisher,
    state: ExecutionState,
    snapshot: watch::Sender<ExecutionState>,
    request: ExecutionRequest,
    config: EngineConfig,
    limit: usize,
    cancel: CancellationToken,
    pause: CancellationToken,
    failures: Vec<NodeFailure>,
    /// A critical failure under `stop_workflow` ended dispatch.
    halted: bool,
    /// A critical node failed.
    failed: bool,
}

impl Run {
    async fn drive(mut self) -> Result<ExecutionReport, WeaveError> {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        match self.schedule().await {
            Ok(()) => Ok(self.report(started)),
            Err(e) => {
                tracing::error!("Execution aborted: {e}");
                // Whatever is still in flight must not outlive the run.
                cancel.cancel();
                Err(e)
            }
        }
    }

    async fn schedule(&mut self) -> Result<(), WeaveError> {
        self.mark_running().await?;
        tracing::info!(
            workflow_id = %self.workflow.id,
            nodes = self.graph.len(),
            max_concurrency = self.limit,
            "Starting workflow execution"
        );

        let mut running: FuturesUnordered<BoxFuture<'static, Settled>> = FuturesUnordered::new();
        let cancel = self.cancel.clone();
        let pause = self.pause.clone();
        let mut cancel_seen = false;
        let mut pause_seen = false;

        loop {
            if self.may_dispatch() {
                self.promote_ready().await?;
                for node_id in self.ids_with(NodeStatus::Ready) {
                    if running.len() >= self.limit || !self.may_dispatch() {
                        break;
                    }
                    let task = self.dispatch(&node_id).await?;
                    running.push(task);
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    tracing::info!(in_flight = running.len(), "Cancellation requested");
                }
                _ = pause.cancelled(), if !pause_seen => {
                    pause_seen = true;
                    tracing::info!(in_flight = running.len(), "Pause requested, draining in-flight nodes");
                }
                Some((node_id, joined)) = running.next() => {
                    self.settle(&node_id, joined).await?;
                }
            }
        }

        self.finish().await
    }

    fn may_dispatch(&self) -> bool {
        !self.halted && !self.cancel.is_cancelled() && !self.pause.is_cancelled()
    }

    fn ids_with(&self, status: NodeStatus) -> Vec<NodeId> {
        self.state
            .node_states
            .iter()
            .filter(|(_, n)| n.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pending nodes whose dependencies all completed become ready, in
    /// ascending id order.
    async fn promote_ready(&mut self) -> Result<(), WeaveError> {
        let ready: Vec<NodeId> = self
            .ids_with(NodeStatus::Pending)
            .into_iter()
            .filter(|id| {
                self.graph
                    .dependencies(id)
                    .iter()
                    .all(|dep| self.state.node_status(dep) == Some(NodeStatus::Completed))
            })
            .collect();
        for id in ready {
            self.transition(&id, NodeStatus::Ready, json!({"status": NodeStatus::Ready}))
                .await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, node_id: &str) -> Result<BoxFuture<'static, Settled>, WeaveError> {
        let spec = self
            .workflow
            .find_node(node_id)
            .cloned()
            .ok_or_else(|| WeaveError::Execution(format!("unknown node '{node_id}'")))?;
        let executor = self.registry.get(&spec.node_type)?;
        let input = self.build_input(&spec);
        let timeout = self.timeout_for(&spec);
        let policy = self.retry_for(&spec);

        let node = self.state.transition_node(node_id, NodeStatus::Running)?;
        node.input = Some(input.clone());
        self.publisher.update(
            Some(node_id),
            json!({"status": NodeStatus::Running, "node_type": spec.node_type}),
        );
        self.record_node(node_id).await?;
        tracing::debug!(node_id, node_type = %spec.node_type, "Dispatching node");

        let ctx = NodeContext {
            user_id: self.request.user_id.clone(),
            execution_id: self.state.execution_id,
            node_id: node_id.to_string(),
            trace_id: self.publisher.trace_id().to_string(),
            credentials: self.request.credentials.clone(),
            variables: Arc::new(self.request.variables.clone()),
            events: self.publisher.emitter(node_id),
            cancellation: self.cancel.child_token(),
        };
        let task = run_node(executor, input, ctx, timeout, policy, self.publisher.clone());
        let handle = tokio::spawn(task.in_current_span());
        let node_id = node_id.to_string();
        Ok(async move { (node_id, handle.await) }.boxed())
    }

    /// Node config, then execution inputs for roots, then upstream outputs.
    fn build_input(&self, spec: &NodeSpec) -> JsonMap {
        let mut input = spec.config.clone();
        if self.graph.dependencies(&spec.id).is_empty() {
            for (key, value) in &self.request.inputs {
                input.insert(key.clone(), value.clone());
            }
        }
        for edge in self.workflow.incoming_edges(&spec.id) {
            let Some(output) = self.state.node(&edge.source).and_then(|n| n.output.as_ref()) else {
                continue;
            };
            match (&edge.source_handle, &edge.target_handle) {
                (Some(source_key), target_key) => {
                    if let Some(value) = output.get(source_key) {
                        let key = target_key.clone().unwrap_or_else(|| source_key.clone());
                        input.insert(key, value.clone());
                    }
                }
                (None, Some(target_key)) => {
                    input.insert(target_key.clone(), Value::Object(output.clone()));
                }
                (None, None) => {
                    for (key, value) in output {
                        input.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        input
    }

    fn timeout_for(&self, spec: &NodeSpec) -> Option<Duration> {
        spec.timeout_ms
            .or(self.workflow.config.node_timeout_ms)
            .or(self.config.node_timeout_ms)
            .map(Duration::from_millis)
    }

    fn retry_for(&self, spec: &NodeSpec) -> RetryPolicy {
        match &spec.retry {
            Some(policy) => policy.clone(),
            None if self.workflow.config.retry.max_retries > 0 => self.workflow.config.retry.clone(),
            None => self.config.default_retry.clone(),
        }
    }

    async fn settle(&mut self, node_id: &str, joined: Result<NodeResult, JoinError>) -> Result<(), WeaveError> {
        let (attempts, result) = match joined {
            Ok(settled) => settled,
            Err(e) => (1, Err(NodeError::failed("PANIC", format!("node task aborted: {e}")))),
        };

        // Once cancellation is requested, nothing in flight may end up
        // completed or failed.
        if self.cancel.is_cancelled() {
            return self.cancel_node(node_id, attempts).await;
        }

        match result {
            Ok(output) => {
                let node = self.state.transition_node(node_id, NodeStatus::Completed)?;
                node.attempts = attempts;
                node.output = Some(output.clone());
                self.publisher.update(
                    Some(node_id),
                    json!({"status": NodeStatus::Completed, "output": output, "attempts": attempts}),
                );
                self.record_node(node_id).await?;
                tracing::info!(node_id, attempts, "Node completed");
                Ok(())
            }
            Err(NodeError::Cancelled) => self.cancel_node(node_id, attempts).await,
            Err(error) => self.fail_node(node_id, attempts, error).await,
        }
    }

    async fn cancel_node(&mut self, node_id: &str, attempts: u32) -> Result<(), WeaveError> {
        self.state.transition_node(node_id, NodeStatus::Cancelled)?.attempts = attempts;
        self.publisher
            .update(Some(node_id), json!({"status": NodeStatus::Cancelled}));
        self.record_node(node_id).await
    }

    async fn fail_node(&mut self, node_id: &str, attempts: u32, error: NodeError) -> Result<(), WeaveError> {
        let info = error.info();
        let node = self.state.transition_node(node_id, NodeStatus::Failed)?;
        node.attempts = attempts;
        node.error = Some(info.clone());

        let critical = self
            .workflow
            .find_node(node_id)
            .map(|n| n.critical)
            .unwrap_or(true);
        tracing::error!(node_id, attempts, code = %info.code, critical, "Node failed: {}", info.message);
        self.publisher.error(
            Some(node_id),
            json!({"status": NodeStatus::Failed, "error": info, "attempts": attempts, "critical": critical}),
        );
        self.record_node(node_id).await?;
        self.failures.push(NodeFailure {
            execution_id: self.state.execution_id,
            node_id: node_id.to_string(),
            trace_id: self.publisher.trace_id().to_string(),
            error: info,
        });

        let reason = format!("upstream node '{node_id}' failed");
        for descendant in self.graph.descendants(node_id) {
            self.skip(&descendant, &reason).await?;
        }

        if critical {
            self.failed = true;
            if self.workflow.config.on_error == ErrorHandling::StopWorkflow {
                self.halted = true;
            }
        }
        Ok(())
    }

    async fn skip(&mut self, node_id: &str, reason: &str) -> Result<(), WeaveError> {
        if !matches!(
            self.state.node_status(node_id),
            Some(NodeStatus::Pending | NodeStatus::Ready)
        ) {
            return Ok(());
        }
        self.transition(
            node_id,
            NodeStatus::Skipped,
            json!({"status": NodeStatus::Skipped, "reason": reason}),
        )
        .await?;
        tracing::debug!(node_id, reason, "Node skipped");
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), WeaveError> {
        let leftover: Vec<NodeId> = self
            .state
            .node_states
            .iter()
            .filter(|(_, n)| !n.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        let status = if self.cancel.is_cancelled() {
            for id in &leftover {
                self.transition(id, NodeStatus::Cancelled, json!({"status": NodeStatus::Cancelled}))
                    .await?;
            }
            ExecutionStatus::Cancelled
        } else if self.halted {
            for id in &leftover {
                self.skip(id, "workflow stopped after a failure").await?;
            }
            ExecutionStatus::Failed
        } else if self.pause.is_cancelled() && !leftover.is_empty() {
            ExecutionStatus::Paused
        } else if self.failed {
            ExecutionStatus::Failed
        } else if !leftover.is_empty() {
            return Err(WeaveError::Execution(format!(
                "scheduler stalled with unfinished nodes: {}",
                leftover.join(", ")
            )));
        } else {
            ExecutionStatus::Completed
        };

        self.state.set_status(status)?;
        let summary = json!({
            "status": status,
            "completed": self.state.count(NodeStatus::Completed),
            "failed": self.state.count(NodeStatus::Failed),
            "skipped": self.state.count(NodeStatus::Skipped),
            "cancelled": self.state.count(NodeStatus::Cancelled),
        });
        if status == ExecutionStatus::Paused {
            self.publisher.update(None, summary);
        } else {
            self.publisher.complete(summary);
        }
        self.write_checkpoint(CheckpointEntry::Execution { status }).await?;
        tracing::info!(%status, failures = self.failures.len(), "Workflow execution finished");
        Ok(())
    }

    /// Apply a transition, announce it, then persist it. Events go out
    /// before the checkpoint so a record's `event_sequence` covers them.
    async fn transition(&mut self, node_id: &str, next: NodeStatus, event: Value) -> Result<(), WeaveError> {
        self.state.transition_node(node_id, next)?;
        self.publisher.update(Some(node_id), event);
        self.record_node(node_id).await
    }

    async fn record_node(&mut self, node_id: &str) -> Result<(), WeaveError> {
        let node: NodeState = self
            .state
            .node(node_id)
            .cloned()
            .ok_or_else(|| WeaveError::Execution(format!("unknown node '{node_id}'")))?;
        let output = match node.status {
            NodeStatus::Completed => node.output,
            _ => None,
        };
        self.write_checkpoint(CheckpointEntry::Node {
            node_id: node_id.to_string(),
            status: node.status,
            output,
            error: node.error,
            attempts: node.attempts,
        })
        .await
    }

    async fn mark_running(&mut self) -> Result<(), WeaveError> {
        let status = ExecutionStatus::Running;
        if self.state.status != status {
            self.state.set_status(status)?;
        }
        self.publisher.update(None, json!({"status": status}));
        self.write_checkpoint(CheckpointEntry::Execution { status }).await
    }

    async fn write_checkpoint(&mut self, entry: CheckpointEntry) -> Result<(), WeaveError> {
        let record = Checkpoint {
            execution_id: self.state.execution_id,
            workflow_id: self.state.workflow_id,
            workflow_version: self.state.workflow_version,
            cursor: self.state.checkpoint_cursor,
            event_sequence: self.publisher.next_sequence(),
            recorded_at: Utc::now(),
            entry,
        };
        self.checkpoints.save(&record).await?;
        self.state.checkpoint_cursor += 1;
        self.snapshot.send_replace(self.state.clone());
        Ok(())
    }

    fn report(self, started: Instant) -> ExecutionReport {
        ExecutionReport {
            execution_id: self.state.execution_id,
            workflow_id: self.state.workflow_id,
            trace_id: self.publisher.trace_id().to_string(),
            status: self.state.status,
            outputs: self.state.outputs(),
            state: self.state,
            failures: self.failures,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// One node call with its retry loop. Retryable failures are retried per
/// `policy`; once retries run out the error is wrapped so it no longer
/// reads as retryable.
async fn run_node(
    executor: Arc<dyn NodeExecutor>,
    input: JsonMap,
    ctx: NodeContext,
    timeout: Option<Duration>,
    policy: RetryPolicy,
    publisher: EventPublisher,
) -> NodeResult {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let error = match executor.run(input.clone(), &ctx, timeout).await {
            Ok(output) => return (attempt, Ok(output)),
            Err(error) => error,
        };
        if !error.is_retryable() || ctx.is_cancelled() {
            return (attempt, Err(error));
        }
        if attempt > policy.max_retries {
            if policy.max_retries == 0 {
                return (attempt, Err(error));
            }
            return (
                attempt,
                Err(NodeError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                }),
            );
        }

        let delay = policy.delay_for(attempt - 1);
        tracing::warn!(
            node_id = %ctx.node_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retryable node failure: {error}"
        );
        publisher.update(
            Some(ctx.node_id.as_str()),
            json!({
                "status": "retrying",
                "attempt": attempt,
                "delay_ms": delay.as_millis() as u64,
                "error": error.info(),
            }),
        );
        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return (attempt, Err(NodeError::Cancelled)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
