//! Workflow execution runtime
//!
//! Schedules workflow graphs over a bounded pool of node tasks, records
//! every transition in a checkpoint log and resumes executions from it.

mod checkpoint;
mod executor;
mod graph;
mod registry;
mod runtime;
mod state;

pub use checkpoint::{
    restore, Checkpoint, CheckpointEntry, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore, Restored,
};
pub use executor::{
    EngineConfig, ExecutionHandle, ExecutionReport, ExecutionRequest, WorkflowExecutor,
};
pub use graph::DependencyGraph;
pub use registry::{NodeRegistry, NodeRegistryBuilder};
pub use runtime::WeaveRuntime;
pub use state::{ExecutionState, ExecutionStatus, NodeState, NodeStatus};
