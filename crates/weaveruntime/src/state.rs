use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use weavecore::{ExecutionId, JsonMap, NodeErrorInfo, NodeId, WeaveError, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Ready, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorInfo>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            input: None,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Progress of one execution. Only the engine loop mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub node_states: BTreeMap<NodeId, NodeState>,
    /// Number of checkpoint records written so far.
    pub checkpoint_cursor: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        workflow_version: u32,
        node_ids: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            workflow_version,
            status: ExecutionStatus::Pending,
            node_states: node_ids
                .into_iter()
                .map(|id| (id, NodeState::default()))
                .collect(),
            checkpoint_cursor: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.node_states.get(id)
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.node_states.get(id).map(|n| n.status)
    }

    pub fn set_status(&mut self, next: ExecutionStatus) -> Result<(), WeaveError> {
        if !self.status.can_transition_to(next) {
            return Err(WeaveError::InvalidTransition {
                entity: format!("execution {}", self.execution_id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Apply a node transition, stamping start/end times.
    pub fn transition_node(&mut self, id: &str, next: NodeStatus) -> Result<&mut NodeState, WeaveError> {
        let node = self
            .node_states
            .get_mut(id)
            .ok_or_else(|| WeaveError::Execution(format!("unknown node '{id}'")))?;
        if !node.status.can_transition_to(next) {
            return Err(WeaveError::InvalidTransition {
                entity: format!("node {id}"),
                from: node.status.to_string(),
                to: next.to_string(),
            });
        }
        node.status = next;
        match next {
            NodeStatus::Running => node.started_at = Some(Utc::now()),
            s if s.is_terminal() => node.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(node)
    }

    /// Prepare a restored state for another run: everything not completed
    /// goes back to pending.
    pub fn reset_unfinished(&mut self) {
        for node in self.node_states.values_mut() {
            if node.status != NodeStatus::Completed {
                *node = NodeState::default();
            }
        }
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.node_states.values().filter(|n| n.status == status).count()
    }

    pub fn outputs(&self) -> BTreeMap<NodeId, JsonMap> {
        self.node_states
            .iter()
            .filter_map(|(id, n)| n.output.clone().map(|o| (id.clone(), o)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn terminal_execution_status_is_final() {
        let mut state = ExecutionState::new(Uuid::new_v4(), Uuid::new_v4(), 1, vec!["a".to_string()]);
        state.set_status(ExecutionStatus::Running).unwrap();
        state.set_status(ExecutionStatus::Completed).unwrap();
        assert!(state.completed_at.is_some());
        assert!(state.set_status(ExecutionStatus::Running).is_err());
    }

    #[test]
    fn nodes_follow_their_state_machine() {
        let mut state = ExecutionState::new(Uuid::new_v4(), Uuid::new_v4(), 1, vec!["a".to_string()]);
        assert!(state.transition_node("a", NodeStatus::Running).is_err());
        state.transition_node("a", NodeStatus::Ready).unwrap();
        let node = state.transition_node("a", NodeStatus::Running).unwrap();
        assert!(node.started_at.is_some());
        state.transition_node("a", NodeStatus::Failed).unwrap();
        assert!(state.transition_node("a", NodeStatus::Completed).is_err());

        state.reset_unfinished();
        assert_eq!(state.node_status("a"), Some(NodeStatus::Pending));
    }
}
