use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::{DatasetId, NodeId};
use crate::graph::{ExecNode, NodeSpec, NodeUpdate};

struct Record {
    node: Arc<ExecNode>,
    /// Output dataset of each output name, created lazily on first run.
    datasets: BTreeMap<String, DatasetId>,
}

/// In-memory execution node records.
#[derive(Default)]
pub struct Catalog {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    records: BTreeMap<NodeId, Record>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, spec: NodeSpec) -> Arc<ExecNode> {
        let mut inner = self.inner.write();
        inner.next_id += 1;

        let node = Arc::new(ExecNode {
            id: NodeId(inner.next_id),
            name: spec.name,
            op: spec.op,
            config: spec.config,
            parents: spec.parents,
            outputs: spec.outputs,
            workspace: spec.workspace,
        });

        inner.records.insert(
            node.id,
            Record {
                node: node.clone(),
                datasets: BTreeMap::new(),
            },
        );

        node
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<ExecNode>> {
        self.inner.read().records.get(&id).map(|r| r.node.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes ordered by id, optionally restricted to one workspace.
    pub fn list(&self, workspace: Option<&str>) -> Vec<Arc<ExecNode>> {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| workspace.is_none_or(|ws| r.node.workspace == ws))
            .map(|r| r.node.clone())
            .collect()
    }

    pub fn update(&self, id: NodeId, update: NodeUpdate) -> Option<Arc<ExecNode>> {
        let mut inner = self.inner.write();
        let record = inner.records.get_mut(&id)?;

        let mut node = ExecNode::clone(&record.node);
        if let Some(name) = update.name {
            node.name = name;
        }
        if let Some(config) = update.config {
            node.config = config;
        }
        if let Some(parents) = update.parents {
            node.parents = parents;
        }
        if let Some(outputs) = update.outputs {
            node.outputs = outputs;
        }

        record.node = Arc::new(node);
        Some(record.node.clone())
    }

    /// Removes a node, returning its output datasets.
    pub fn remove(&self, id: NodeId) -> Option<Vec<DatasetId>> {
        let record = self.inner.write().records.remove(&id)?;
        Some(record.datasets.into_values().collect())
    }

    pub fn dataset(&self, id: NodeId, output: &str) -> Option<DatasetId> {
        self.inner
            .read()
            .records
            .get(&id)?
            .datasets
            .get(output)
            .copied()
    }

    pub fn datasets(&self, id: NodeId) -> Vec<DatasetId> {
        self.inner
            .read()
            .records
            .get(&id)
            .map(|r| r.datasets.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn set_dataset(&self, id: NodeId, output: &str, dataset: DatasetId) {
        if let Some(record) = self.inner.write().records.get_mut(&id) {
            record.datasets.insert(output.to_string(), dataset);
        }
    }

    /// Forgets the datasets of every output not named in `outputs`,
    /// returning them.
    pub fn retain_datasets(&self, id: NodeId, outputs: &[&str]) -> Vec<DatasetId> {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(&id) else {
            return Vec::new();
        };

        let mut dropped = Vec::new();
        record.datasets.retain(|name, dataset| {
            let keep = outputs.contains(&name.as_str());
            if !keep {
                dropped.push(*dataset);
            }
            keep
        });
        dropped
    }
}
