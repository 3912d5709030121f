//! Pipeline graph records.
//!
//! An [`ExecNode`] binds one operator type and configuration to an ordered
//! list of [`Parent`]s. Traversals do not care whether a graph member is an
//! execution node or a raw dataset, so both are wrapped in [`GraphNode`],
//! which exposes identity, tag, parents and done-ness uniformly.

use std::fmt::Display;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{DataType, Dataset, DatasetId, NodeId};

/// Where a parent's items come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentSource {
    /// Output slot `slot` of another execution node.
    Node { id: NodeId, slot: usize },
    /// A raw, standalone dataset.
    Dataset { id: DatasetId },
}

/// One input edge of an execution node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    /// Name of the operator input this parent feeds.
    pub role: String,
    #[serde(flatten)]
    pub source: ParentSource,
}

impl Parent {
    pub fn node(role: impl Into<String>, id: NodeId, slot: usize) -> Self {
        Self {
            role: role.into(),
            source: ParentSource::Node { id, slot },
        }
    }

    pub fn dataset(role: impl Into<String>, id: DatasetId) -> Self {
        Self {
            role: role.into(),
            source: ParentSource::Dataset { id },
        }
    }
}

/// A named, typed output slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub name: String,
    pub data_type: DataType,
}

impl ExecOutput {
    pub fn new(name: impl Into<String>, data_type: impl Into<DataType>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A pipeline stage bound to one operator type and configuration.
#[derive(Clone, Debug, Serialize)]
pub struct ExecNode {
    pub id: NodeId,
    pub name: String,
    /// Operator type name, looked up in the registry.
    pub op: String,
    /// Opaque configuration, interpreted only by the operator.
    pub config: String,
    pub parents: Vec<Parent>,
    pub outputs: Vec<ExecOutput>,
    pub workspace: String,
}

impl ExecNode {
    /// Decodes the JSON configuration blob.
    pub fn decode_config<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.config)
    }

    /// For each parent, its role and its position among parents sharing that
    /// role. This is how a parent index maps into `role -> per-dataset`
    /// matrices.
    pub fn parent_slots(&self) -> Vec<(&str, usize)> {
        let mut seen: Vec<(&str, usize)> = Vec::new();
        self.parents
            .iter()
            .map(|parent| {
                let role = parent.role.as_str();
                let index = match seen.iter_mut().find(|(r, _)| *r == role) {
                    Some((_, count)) => {
                        *count += 1;
                        *count - 1
                    }
                    None => {
                        seen.push((role, 1));
                        0
                    }
                };
                (role, index)
            })
            .collect()
    }
}

/// Request to create an execution node.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub op: String,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub parents: Vec<Parent>,
    #[serde(default)]
    pub outputs: Vec<ExecOutput>,
    #[serde(default)]
    pub workspace: String,
}

/// Partial update of an execution node; `None` fields are left untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub config: Option<String>,
    pub parents: Option<Vec<Parent>>,
    pub outputs: Option<Vec<ExecOutput>>,
}

impl NodeUpdate {
    /// Whether applying this update can change what the node produces.
    pub(crate) fn invalidates_outputs(&self) -> bool {
        self.config.is_some() || self.parents.is_some() || self.outputs.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphType {
    Exec,
    Dataset,
}

/// Graph-unique identity of a [`GraphNode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphId {
    Exec(NodeId),
    Dataset(DatasetId),
}

impl Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphId::Exec(id) => write!(f, "exec-{id}"),
            GraphId::Dataset(id) => write!(f, "dataset-{id}"),
        }
    }
}

/// Any member of the pipeline graph.
#[derive(Clone, Debug)]
pub enum GraphNode {
    Exec(Arc<ExecNode>),
    Dataset(Dataset),
}

impl GraphNode {
    pub fn id(&self) -> GraphId {
        match self {
            GraphNode::Exec(node) => GraphId::Exec(node.id),
            GraphNode::Dataset(dataset) => GraphId::Dataset(dataset.id),
        }
    }

    pub fn graph_type(&self) -> GraphType {
        match self {
            GraphNode::Exec(_) => GraphType::Exec,
            GraphNode::Dataset(_) => GraphType::Dataset,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            GraphNode::Exec(node) => &node.name,
            GraphNode::Dataset(dataset) => &dataset.name,
        }
    }

    pub fn as_exec(&self) -> Option<&Arc<ExecNode>> {
        match self {
            GraphNode::Exec(node) => Some(node),
            GraphNode::Dataset(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(parents: Vec<Parent>) -> ExecNode {
        ExecNode {
            id: NodeId(1),
            name: "n".into(),
            op: "op".into(),
            config: r#"{"fraction":"1/2"}"#.into(),
            parents,
            outputs: vec![],
            workspace: "default".into(),
        }
    }

    #[test]
    fn test_parent_slots() {
        let n = node(vec![
            Parent::dataset("images", DatasetId(1)),
            Parent::node("inputs", NodeId(2), 0),
            Parent::dataset("images", DatasetId(3)),
            Parent::node("inputs", NodeId(4), 1),
        ]);
        assert_eq!(
            n.parent_slots(),
            [("images", 0), ("inputs", 0), ("images", 1), ("inputs", 1)]
        );
    }

    #[test]
    fn test_decode_config() {
        #[derive(Deserialize)]
        struct Params {
            fraction: String,
        }

        let n = node(vec![]);
        let params: Params = n.decode_config().unwrap();
        assert_eq!(params.fraction, "1/2");

        let broken = ExecNode {
            config: "not json".into(),
            ..n
        };
        let err = broken.decode_config::<Params>().err().unwrap();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_parent_json() {
        let parent = Parent::node("inputs", NodeId(7), 1);
        let json = serde_json::to_string(&parent).unwrap();
        assert_eq!(json, r#"{"role":"inputs","type":"node","id":7,"slot":1}"#);
        let back: Parent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parent);
    }
}
