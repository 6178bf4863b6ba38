use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::executor::{EngineConfig, ExecutionHandle, ExecutionReport, ExecutionRequest, WorkflowExecutor};
use crate::registry::NodeRegistry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use weavecore::{
    EventStream, ExecutionEvent, ExecutionId, WeaveError, WorkflowError, WorkflowGraph, WorkflowId,
};

/// Main runtime for executing workflows
pub struct WeaveRuntime {
    executor: WorkflowExecutor,
    checkpoints: Arc<dyn CheckpointStore>,
    workflows: RwLock<HashMap<WorkflowId, BTreeMap<u32, Arc<WorkflowGraph>>>>,
}

impl WeaveRuntime {
    /// In-memory checkpoints and default limits.
    pub fn new(registry: NodeRegistry) -> Self {
        Self::with_store(registry, Arc::new(MemoryCheckpointStore::new()), EngineConfig::default())
    }

    pub fn with_store(
        registry: NodeRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        let events = Arc::new(EventStream::new(config.event_buffer_size));
        let executor = WorkflowExecutor::new(Arc::new(registry), events, checkpoints.clone(), config);
        Self {
            executor,
            checkpoints,
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.executor.registry()
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Validate and store a workflow version. Versions only move forward;
    /// an existing version is never replaced.
    pub async fn register_workflow(&self, workflow: WorkflowGraph) -> Result<Arc<WorkflowGraph>, WeaveError> {
        self.executor.validate(&workflow)?;
        let mut workflows = self.workflows.write().await;
        let versions = workflows.entry(workflow.id).or_default();
        if let Some((&current, _)) = versions.last_key_value() {
            if workflow.version <= current {
                return Err(WorkflowError::VersionConflict {
                    id: workflow.id.to_string(),
                    version: workflow.version,
                    current,
                }
                .into());
            }
        }
        tracing::info!(workflow_id = %workflow.id, version = workflow.version, "Registered workflow");
        let workflow = Arc::new(workflow);
        versions.insert(workflow.version, workflow.clone());
        Ok(workflow)
    }

    /// A specific version, or the latest when `version` is `None`.
    pub async fn workflow(&self, id: WorkflowId, version: Option<u32>) -> Result<Arc<WorkflowGraph>, WeaveError> {
        let workflows = self.workflows.read().await;
        let versions = workflows.get(&id);
        let found = match version {
            Some(v) => versions.and_then(|all| all.get(&v)),
            None => versions.and_then(|all| all.last_key_value().map(|(_, wf)| wf)),
        };
        found.cloned().ok_or_else(|| {
            let label = match version {
                Some(v) => format!("{id} v{v}"),
                None => id.to_string(),
            };
            WorkflowError::NotFound(label).into()
        })
    }

    /// Start the latest version of a registered workflow.
    pub async fn start_workflow(
        &self,
        workflow_id: WorkflowId,
        request: ExecutionRequest,
    ) -> Result<ExecutionHandle, WeaveError> {
        let workflow = self.workflow(workflow_id, None).await?;
        self.executor.start(workflow, request).await
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        request: ExecutionRequest,
    ) -> Result<ExecutionReport, WeaveError> {
        self.start_workflow(workflow_id, request).await?.wait().await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(
        &self,
        workflow: WorkflowGraph,
        request: ExecutionRequest,
    ) -> Result<ExecutionReport, WeaveError> {
        self.executor.execute(Arc::new(workflow), request).await
    }

    /// Resume a checkpointed execution against the exact workflow version it
    /// started with, which must be registered.
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        request: ExecutionRequest,
    ) -> Result<ExecutionHandle, WeaveError> {
        let records = self.checkpoints.load(execution_id).await?;
        let first = records
            .first()
            .ok_or_else(|| WeaveError::Execution(format!("no checkpoints for {execution_id}")))?;
        let workflow = self
            .workflow(first.workflow_id, Some(first.workflow_version))
            .await?;
        self.executor.resume(execution_id, workflow, request).await
    }

    /// Executions with at least one checkpoint record.
    pub async fn list_executions(&self) -> Result<Vec<ExecutionId>, WeaveError> {
        Ok(self.checkpoints.list().await?)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.executor.events().subscribe()
    }

    pub fn events(&self) -> &Arc<EventStream> {
        self.executor.events()
    }
}
