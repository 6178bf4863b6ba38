use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use weavecore::{NodeId, WorkflowError, WorkflowGraph};

/// Validated dependency structure of a workflow together with its
/// deterministic topological order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeId>,
}

impl DependencyGraph {
    /// Check structure (unique ids, edge endpoints, acyclicity) and compute
    /// the schedule order. Nothing here has side effects.
    pub fn build(workflow: &WorkflowGraph) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &workflow.nodes {
            if index.contains_key(&node.id) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        for edge in &workflow.edges {
            let dangling = |missing: &str| WorkflowError::DanglingEdge {
                source_id: edge.source.clone(),
                target_id: edge.target.clone(),
                missing: missing.to_string(),
            };
            let from = index.get(&edge.source).ok_or_else(|| dangling(&edge.source))?;
            let to = index.get(&edge.target).ok_or_else(|| dangling(&edge.target))?;
            graph.add_edge(*from, *to, ());
        }

        let order = kahn(&graph)?;
        Ok(Self {
            graph,
            index,
            order,
        })
    }

    /// Every node exactly once, dependencies first; ties broken by ascending id.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn dependencies(&self, id: &str) -> BTreeSet<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn dependents(&self, id: &str) -> BTreeSet<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Every node reachable downstream of `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if seen.insert(self.graph[next].clone()) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    fn neighbors(&self, id: &str, direction: Direction) -> BTreeSet<&str> {
        match self.index.get(id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, direction)
                .map(|n| self.graph[n].as_str())
                .collect(),
            None => BTreeSet::new(),
        }
    }
}

/// Kahn's algorithm with an ordered frontier so equal-rank nodes come out in
/// ascending id order.
fn kahn(graph: &DiGraph<NodeId, ()>) -> Result<Vec<NodeId>, WorkflowError> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();

    let mut frontier: BTreeSet<(&str, NodeIndex)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| (graph[*idx].as_str(), *idx))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(entry) = frontier.pop_first() {
        let (id, idx) = entry;
        order.push(id.to_string());
        // Parallel edges show up once per edge, matching the in-degree count.
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    frontier.insert((graph[next].as_str(), next));
                }
            }
        }
    }

    if order.len() != graph.node_count() {
        let mut stuck: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(idx, _)| graph[idx].clone())
            .collect();
        stuck.sort();
        return Err(WorkflowError::CyclicDependency { nodes: stuck });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use weavecore::NodeSpec;

    fn workflow(nodes: &[&str], edges: &[(&str, &str)]) -> WorkflowGraph {
        let mut wf = WorkflowGraph::new("test");
        for id in nodes {
            wf.add_node(NodeSpec::new(*id, "debug.log"));
        }
        for (from, to) in edges {
            wf.connect(*from, *to);
        }
        wf
    }

    #[test]
    fn orders_diamond_with_ascending_tie_break() {
        let wf = workflow(&["d", "c", "b", "a"], &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        let graph = DependencyGraph::build(&wf).unwrap();
        assert_eq!(graph.topological_order(), &["a", "b", "c", "d"]);
        assert_eq!(graph.dependencies("d").into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(
            graph.descendants("a").into_iter().collect::<Vec<_>>(),
            vec!["b", "c", "d"]
        );
    }

    #[test]
    fn reports_every_node_on_a_cycle() {
        let wf = workflow(&["a", "b", "c", "z"], &[("a", "b"), ("b", "c"), ("c", "b"), ("c", "z")]);
        assert_eq!(
            DependencyGraph::build(&wf).unwrap_err(),
            WorkflowError::CyclicDependency {
                nodes: vec!["b".into(), "c".into(), "z".into()]
            }
        );
    }

    #[test]
    fn self_loops_are_cycles() {
        let wf = workflow(&["a"], &[("a", "a")]);
        assert!(matches!(
            DependencyGraph::build(&wf),
            Err(WorkflowError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn rejects_dangling_edges_and_duplicates() {
        let wf = workflow(&["a"], &[("a", "ghost")]);
        assert!(matches!(
            DependencyGraph::build(&wf),
            Err(WorkflowError::DanglingEdge { missing, .. }) if missing == "ghost"
        ));

        let wf = workflow(&["a", "a"], &[]);
        assert_eq!(
            DependencyGraph::build(&wf).unwrap_err(),
            WorkflowError::DuplicateNode("a".into())
        );
    }
}
