//! Append-only checkpoint log and the stores that persist it.

use crate::state::{ExecutionState, ExecutionStatus, NodeStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use weavecore::{CheckpointError, ExecutionId, JsonMap, NodeErrorInfo, NodeId, WorkflowGraph, WorkflowId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointEntry {
    Node {
        node_id: NodeId,
        status: NodeStatus,
        /// Inline output of a completed node.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<JsonMap>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<NodeErrorInfo>,
        #[serde(default)]
        attempts: u32,
    },
    Execution {
        status: ExecutionStatus,
    },
}

/// One record of the log. Records are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub cursor: u64,
    /// Next event sequence number at the time of writing.
    pub event_sequence: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: CheckpointEntry,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// All records of one execution in write order.
    async fn load(&self, execution_id: ExecutionId) -> Result<Vec<Checkpoint>, CheckpointError>;

    async fn list(&self) -> Result<Vec<ExecutionId>, CheckpointError>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<ExecutionId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.records
            .write()
            .await
            .entry(checkpoint.execution_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.records
            .read()
            .await
            .get(&execution_id)
            .filter(|records| !records.is_empty())
            .cloned()
            .ok_or(CheckpointError::NotFound(execution_id))
    }

    async fn list(&self) -> Result<Vec<ExecutionId>, CheckpointError> {
        let mut ids: Vec<ExecutionId> = self.records.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON-lines file per execution under a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, execution_id: ExecutionId) -> PathBuf {
        self.dir.join(format!("{execution_id}.jsonl"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut line = serde_json::to_vec(checkpoint)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(checkpoint.execution_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let raw = match tokio::fs::read_to_string(self.path_for(execution_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(execution_id))
            }
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(record) => records.push(record),
                // A torn final line is what a crash mid-append leaves behind.
                Err(e) if i + 1 == lines.len() => {
                    tracing::warn!(%execution_id, "Ignoring truncated checkpoint record: {e}");
                }
                Err(e) => {
                    return Err(CheckpointError::Corrupt(format!("line {}: {e}", i + 1)));
                }
            }
        }
        if records.is_empty() {
            return Err(CheckpointError::NotFound(execution_id));
        }
        Ok(records)
    }

    async fn list(&self) -> Result<Vec<ExecutionId>, CheckpointError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".jsonl")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<ExecutionId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Result of replaying a checkpoint log.
#[derive(Debug, Clone)]
pub struct Restored {
    pub state: ExecutionState,
    pub next_event_sequence: u64,
}

/// Replay a log onto a fresh state for `workflow`. The log must belong to
/// the same workflow id and version.
pub fn restore(workflow: &WorkflowGraph, records: &[Checkpoint]) -> Result<Restored, CheckpointError> {
    let first = records
        .first()
        .ok_or_else(|| CheckpointError::Corrupt("empty checkpoint log".to_string()))?;
    if first.workflow_id != workflow.id || first.workflow_version != workflow.version {
        return Err(CheckpointError::Corrupt(format!(
            "log belongs to workflow {} v{}, not {} v{}",
            first.workflow_id, first.workflow_version, workflow.id, workflow.version
        )));
    }

    let mut state = ExecutionState::new(
        first.execution_id,
        workflow.id,
        workflow.version,
        workflow.nodes.iter().map(|n| n.id.clone()),
    );
    let mut next_event_sequence = 0;

    for record in records {
        match &record.entry {
            CheckpointEntry::Node {
                node_id,
                status,
                output,
                error,
                attempts,
            } => {
                let node = state.node_states.get_mut(node_id).ok_or_else(|| {
                    CheckpointError::Corrupt(format!("log mentions unknown node '{node_id}'"))
                })?;
                node.status = *status;
                node.attempts = *attempts;
                node.error = error.clone();
                if output.is_some() {
                    node.output = output.clone();
                }
                match status {
                    NodeStatus::Running => node.started_at = Some(record.recorded_at),
                    s if s.is_terminal() => node.completed_at = Some(record.recorded_at),
                    _ => {}
                }
            }
            CheckpointEntry::Execution { status } => state.status = *status,
        }
        state.checkpoint_cursor = record.cursor + 1;
        next_event_sequence = next_event_sequence.max(record.event_sequence);
    }

    Ok(Restored {
        state,
        next_event_sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weavecore::NodeSpec;

    fn record(wf: &WorkflowGraph, execution_id: ExecutionId, cursor: u64, entry: CheckpointEntry) -> Checkpoint {
        Checkpoint {
            execution_id,
            workflow_id: wf.id,
            workflow_version: wf.version,
            cursor,
            event_sequence: cursor * 2,
            recorded_at: Utc::now(),
            entry,
        }
    }

    #[test]
    fn replay_keeps_completed_outputs() {
        let mut wf = WorkflowGraph::new("replay");
        wf.add_node(NodeSpec::new("a", "debug.log"));
        wf.add_node(NodeSpec::new("b", "debug.log"));
        let id = Uuid::new_v4();
        let mut output = JsonMap::new();
        output.insert("value".into(), 1.into());

        let records = vec![
            record(&wf, id, 0, CheckpointEntry::Execution { status: ExecutionStatus::Running }),
            record(&wf, id, 1, CheckpointEntry::Node {
                node_id: "a".into(),
                status: NodeStatus::Completed,
                output: Some(output.clone()),
                error: None,
                attempts: 1,
            }),
            record(&wf, id, 2, CheckpointEntry::Node {
                node_id: "b".into(),
                status: NodeStatus::Running,
                output: None,
                error: None,
                attempts: 1,
            }),
        ];

        let restored = restore(&wf, &records).unwrap();
        assert_eq!(restored.state.status, ExecutionStatus::Running);
        assert_eq!(restored.state.node("a").unwrap().output, Some(output));
        assert_eq!(restored.state.node_status("b"), Some(NodeStatus::Running));
        assert_eq!(restored.state.checkpoint_cursor, 3);
        assert_eq!(restored.next_event_sequence, 4);
    }

    #[test]
    fn rejects_logs_from_another_version() {
        let wf = WorkflowGraph::new("v1");
        let mut newer = wf.clone();
        newer.version = 2;
        let records = vec![record(&wf, Uuid::new_v4(), 0, CheckpointEntry::Execution {
            status: ExecutionStatus::Running,
        })];
        assert!(matches!(restore(&newer, &records), Err(CheckpointError::Corrupt(_))));
    }
}
