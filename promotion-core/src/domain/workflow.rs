//! Workflow graph domain types
//!
//! A workflow is a DAG of pipelines rooted at a single producer (CI or webhook).
//! Every other node is a CD pipeline deploying to exactly one environment.
//!
//! The graph is stored as an arena: nodes live in a `Vec` and edges are
//! adjacency lists of arena indices. Snapshots are immutable once built.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{AppId, EnvironmentId, PipelineId, WorkflowId};

/// Kind of a pipeline node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    #[serde(rename = "CI")]
    Ci,
    #[serde(rename = "WEBHOOK")]
    Webhook,
    #[serde(rename = "CD")]
    Cd,
}

impl PipelineKind {
    /// Parses the component type stored in the workflow mapping table
    pub fn from_mapping_type(value: &str) -> Option<Self> {
        match value {
            "CI_PIPELINE" => Some(PipelineKind::Ci),
            "WEBHOOK" => Some(PipelineKind::Webhook),
            "CD_PIPELINE" => Some(PipelineKind::Cd),
            _ => None,
        }
    }

    /// Whether this kind produces artifacts (CI or webhook)
    pub fn is_producer(self) -> bool {
        matches!(self, PipelineKind::Ci | PipelineKind::Webhook)
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Ci => write!(f, "CI"),
            PipelineKind::Webhook => write!(f, "WEBHOOK"),
            PipelineKind::Cd => write!(f, "CD"),
        }
    }
}

/// Environment a CD pipeline deploys to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub id: EnvironmentId,
    pub name: String,
}

/// A pipeline in a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineNode {
    pub id: PipelineId,
    pub kind: PipelineKind,
    /// Set for CD pipelines only
    pub environment: Option<EnvironmentRef>,
    pub workflow_id: WorkflowId,
}

impl PipelineNode {
    pub fn producer(id: PipelineId, kind: PipelineKind, workflow_id: WorkflowId) -> Self {
        Self {
            id,
            kind,
            environment: None,
            workflow_id,
        }
    }

    pub fn cd(
        id: PipelineId,
        environment_id: EnvironmentId,
        environment_name: impl Into<String>,
        workflow_id: WorkflowId,
    ) -> Self {
        Self {
            id,
            kind: PipelineKind::Cd,
            environment: Some(EnvironmentRef {
                id: environment_id,
                name: environment_name.into(),
            }),
            workflow_id,
        }
    }
}

/// Directed edge parent -> child as found in the flat mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub parent_id: PipelineId,
    pub parent_kind: PipelineKind,
    pub child_id: PipelineId,
    pub child_kind: PipelineKind,
}

/// Where a CD pipeline lives: its application, environment and workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlacement {
    pub pipeline_id: PipelineId,
    pub app_id: AppId,
    pub environment: EnvironmentRef,
    pub workflow_id: WorkflowId,
}

/// Arena index of a node inside one graph snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Reasons a set of nodes and edges does not form a valid workflow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow {0} has no nodes")]
    Empty(WorkflowId),

    #[error("workflow {workflow_id} has {count} source nodes, expected exactly one")]
    SourceCount { workflow_id: WorkflowId, count: usize },

    #[error("source node {0} of the workflow is not a CI or webhook pipeline")]
    SourceNotProducer(PipelineId),

    #[error("non-source node {0} must be a CD pipeline")]
    ProducerNotRoot(PipelineId),

    #[error("CD pipeline {0} has no environment")]
    MissingEnvironment(PipelineId),

    #[error("duplicate {kind} node {id}")]
    DuplicateNode { kind: PipelineKind, id: PipelineId },

    #[error("edge references unknown {kind} node {id}")]
    UnknownNode { kind: PipelineKind, id: PipelineId },

    #[error("edge into producer node {0}")]
    EdgeIntoProducer(PipelineId),

    #[error("workflow {0} contains a cycle")]
    Cycle(WorkflowId),
}

/// Immutable snapshot of one workflow DAG
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    workflow_id: WorkflowId,
    app_id: AppId,
    nodes: Vec<PipelineNode>,
    parents: Vec<Vec<NodeId>>,
    children: Vec<Vec<NodeId>>,
    cd_index: HashMap<PipelineId, NodeId>,
    root: NodeId,
}

impl WorkflowGraph {
    /// Builds a graph snapshot and checks the workflow invariants:
    /// a single producer root, CD everywhere else, and no cycles.
    pub fn build(
        workflow_id: WorkflowId,
        app_id: AppId,
        nodes: Vec<PipelineNode>,
        edges: &[WorkflowEdge],
    ) -> Result<Self, GraphError> {
        if nodes.is_empty() {
            return Err(GraphError::Empty(workflow_id));
        }

        let mut cd_index = HashMap::new();
        let mut producer_index = HashMap::new();
        for (position, node) in nodes.iter().enumerate() {
            let index = if node.kind == PipelineKind::Cd {
                if node.environment.is_none() {
                    return Err(GraphError::MissingEnvironment(node.id));
                }
                &mut cd_index
            } else {
                &mut producer_index
            };
            if index.insert(node.id, NodeId(position)).is_some() {
                return Err(GraphError::DuplicateNode {
                    kind: node.kind,
                    id: node.id,
                });
            }
        }

        let lookup = |kind: PipelineKind, id: PipelineId| -> Result<NodeId, GraphError> {
            let index = if kind == PipelineKind::Cd {
                &cd_index
            } else {
                &producer_index
            };
            index
                .get(&id)
                .copied()
                .ok_or(GraphError::UnknownNode { kind, id })
        };

        let mut parents = vec![Vec::new(); nodes.len()];
        let mut children = vec![Vec::new(); nodes.len()];
        for edge in edges {
            let parent = lookup(edge.parent_kind, edge.parent_id)?;
            let child = lookup(edge.child_kind, edge.child_id)?;
            if edge.child_kind.is_producer() {
                return Err(GraphError::EdgeIntoProducer(edge.child_id));
            }
            if !children[parent.0].contains(&child) {
                children[parent.0].push(child);
                parents[child.0].push(parent);
            }
        }

        let sources: Vec<NodeId> = (0..nodes.len())
            .filter(|&i| parents[i].is_empty())
            .map(NodeId)
            .collect();
        if sources.len() != 1 {
            return Err(GraphError::SourceCount {
                workflow_id,
                count: sources.len(),
            });
        }
        let root = sources[0];
        if !nodes[root.0].kind.is_producer() {
            return Err(GraphError::SourceNotProducer(nodes[root.0].id));
        }
        if let Some(stray) = nodes
            .iter()
            .enumerate()
            .find(|(i, n)| *i != root.0 && n.kind.is_producer())
        {
            return Err(GraphError::ProducerNotRoot(stray.1.id));
        }

        let graph = Self {
            workflow_id,
            app_id,
            nodes,
            parents,
            children,
            cd_index,
            root,
        };
        if graph.has_cycle() {
            return Err(GraphError::Cycle(workflow_id));
        }
        Ok(graph)
    }

    // Kahn's algorithm: a cycle leaves nodes with unresolved in-degree
    fn has_cycle(&self) -> bool {
        let mut in_degree: Vec<usize> = self.parents.iter().map(Vec::len).collect();
        let mut queue: VecDeque<NodeId> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .map(NodeId)
            .collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for child in &self.children[node.0] {
                in_degree[child.0] -= 1;
                if in_degree[child.0] == 0 {
                    queue.push_back(*child);
                }
            }
        }
        visited != self.nodes.len()
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    /// The producer node every path starts from
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &PipelineNode {
        &self.nodes[id.0]
    }

    pub fn node_kind(&self, id: NodeId) -> PipelineKind {
        self.nodes[id.0].kind
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        &self.children[id.0]
    }

    pub fn parents_of(&self, id: NodeId) -> &[NodeId] {
        &self.parents[id.0]
    }

    /// Looks up a node by pipeline id.
    ///
    /// CD pipelines and producers live in separate id spaces; CD nodes win,
    /// then the root producer is matched.
    pub fn node_by_pipeline_id(&self, pipeline_id: PipelineId) -> Option<NodeId> {
        self.cd_index.get(&pipeline_id).copied().or_else(|| {
            (self.nodes[self.root.0].id == pipeline_id).then_some(self.root)
        })
    }

    /// Finds the CD node deploying to the named environment
    pub fn cd_node_by_environment_name(&self, name: &str) -> Option<NodeId> {
        self.cd_nodes().find(|&id| {
            self.nodes[id.0]
                .environment
                .as_ref()
                .is_some_and(|env| env.name == name)
        })
    }

    /// Finds the CD node deploying to the given environment id
    pub fn cd_node_by_environment_id(&self, environment_id: EnvironmentId) -> Option<NodeId> {
        self.cd_nodes().find(|&id| {
            self.nodes[id.0]
                .environment
                .as_ref()
                .is_some_and(|env| env.id == environment_id)
        })
    }

    /// All CD nodes in insertion order
    pub fn cd_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.nodes[id.0].kind == PipelineKind::Cd)
    }

    /// Placements of every CD node, used by stores that index pipelines
    pub fn placements(&self) -> Vec<PipelinePlacement> {
        self.cd_nodes()
            .filter_map(|id| {
                let node = &self.nodes[id.0];
                node.environment.as_ref().map(|env| PipelinePlacement {
                    pipeline_id: node.id,
                    app_id: self.app_id,
                    environment: env.clone(),
                    workflow_id: self.workflow_id,
                })
            })
            .collect()
    }
}
