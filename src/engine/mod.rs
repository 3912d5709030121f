//! The execution engine.
//!
//! [`Engine`] owns the node catalog and ties it to the operator registry and
//! the storage collaborator. It answers the control-surface calls (create,
//! fetch, update, delete, list), and runs nodes either in full through the
//! task runner, or incrementally through the planner.

mod planner;
mod runner;

#[cfg(test)]
mod fixtures;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::JoinHandle;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::catalog::Catalog;
use crate::core::{DataType, Dataset, DatasetId, Item, NodeId};
use crate::data::Codecs;
use crate::error::{ExecError, PlanError, StorageError};
use crate::graph::{ExecNode, ExecOutput, GraphId, GraphNode, NodeSpec, NodeUpdate, ParentSource};
use crate::operator::{Inputs, OperatorRegistry};
use crate::storage::Storage;

pub use planner::IncrementalReport;
pub use runner::RunReport;

/// Options of a single node run.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Run even when the outputs are already complete.
    pub force: bool,
    /// Only apply the tasks producing these output keys.
    pub limit: Option<BTreeSet<String>>,
}

impl RunOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            limit: None,
        }
    }

    pub fn limited(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            force: false,
            limit: Some(keys.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Settings {
    /// Upper bound on workers per node run, on top of the operator's wish.
    pub max_workers: Option<usize>,
    /// Pass cap for demand propagation.
    pub max_plan_passes: usize,
    /// Seed for key sampling, random when unset.
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: None,
            max_plan_passes: 1024,
            seed: None,
        }
    }
}

/// Builder for an [`Engine`].
pub struct Config {
    registry: OperatorRegistry,
    storage: Arc<dyn Storage>,
    codecs: Codecs,
    settings: Settings,
}

impl Config {
    pub fn codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.settings.max_workers = Some(workers.max(1));
        self
    }

    pub fn max_plan_passes(mut self, passes: usize) -> Self {
        self.settings.max_plan_passes = passes.max(1);
        self
    }

    /// Makes incremental key sampling reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.settings.seed = Some(seed);
        self
    }

    pub fn finish(self) -> Engine {
        Engine {
            registry: self.registry,
            storage: self.storage,
            codecs: self.codecs,
            catalog: Catalog::new(),
            settings: self.settings,
        }
    }
}

pub struct Engine {
    registry: OperatorRegistry,
    storage: Arc<dyn Storage>,
    codecs: Codecs,
    catalog: Catalog,
    settings: Settings,
}

impl Engine {
    pub fn config(registry: OperatorRegistry, storage: Arc<dyn Storage>) -> Config {
        Config {
            registry,
            storage,
            codecs: Codecs::default(),
            settings: Settings::default(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // Control surface

    pub fn list_nodes(&self, workspace: Option<&str>) -> Vec<Arc<ExecNode>> {
        self.catalog.list(workspace)
    }

    pub fn create_node(&self, spec: NodeSpec) -> Result<Arc<ExecNode>, ExecError> {
        self.registry.get(&spec.op)?;
        let node = self.catalog.insert(spec);
        tracing::debug!("created node {} ({}) as {}", node.name, node.op, node.id);
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> Result<Arc<ExecNode>, ExecError> {
        self.catalog.get(id).ok_or(ExecError::NodeNotFound(id))
    }

    /// Applies a partial update. Changing what the node computes marks its
    /// existing outputs as stale.
    pub fn update_node(&self, id: NodeId, update: NodeUpdate) -> Result<Arc<ExecNode>, ExecError> {
        let stale = update.invalidates_outputs();
        let node = self
            .catalog
            .update(id, update)
            .ok_or(ExecError::NodeNotFound(id))?;

        if stale {
            for dataset in self.catalog.datasets(id) {
                self.storage.set_done(dataset, false)?;
            }
        }

        Ok(node)
    }

    /// Removes a node together with its output datasets.
    pub fn delete_node(&self, id: NodeId) -> Result<(), ExecError> {
        let datasets = self.catalog.remove(id).ok_or(ExecError::NodeNotFound(id))?;
        for dataset in datasets {
            self.drop_dataset(dataset)?;
        }
        Ok(())
    }

    fn drop_dataset(&self, dataset: DatasetId) -> Result<(), ExecError> {
        match self.storage.delete_dataset(dataset) {
            Ok(()) | Err(StorageError::DatasetNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Output datasets created so far for a node.
    pub fn node_datasets(&self, id: NodeId) -> Result<Vec<Dataset>, ExecError> {
        self.node(id)?;
        self.catalog
            .datasets(id)
            .into_iter()
            .map(|ds| self.storage.dataset(ds).map_err(ExecError::from))
            .collect()
    }

    pub fn requirements(&self, id: NodeId) -> Result<BTreeMap<String, u32>, ExecError> {
        let node = self.node(id)?;
        Ok(self.registry.get(&node.op)?.requirements(&node))
    }

    /// Forced full run of a node on a background thread. Failures are logged.
    pub fn spawn_run(self: &Arc<Self>, id: NodeId) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            if let Err(e) = engine.run(id, RunOptions::forced()) {
                tracing::error!("run of node {id} failed: {e}");
            }
        })
    }

    /// Incremental run of a node on a background thread. Failures are logged.
    pub fn spawn_incremental(self: &Arc<Self>, id: NodeId, count: usize) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            if let Err(e) = engine.incremental(id, count) {
                tracing::error!("incremental run of node {id} failed: {e}");
            }
        })
    }

    // Execution

    /// Runs a single node from its parents' current outputs.
    pub fn run(&self, id: NodeId, options: RunOptions) -> Result<RunReport, ExecError> {
        let node = self.node(id)?;
        runner::run_node(self, &node, &options)
    }

    /// Produces up to `count` outputs at a node, computing upstream only what
    /// those outputs need.
    pub fn incremental(&self, id: NodeId, count: usize) -> Result<IncrementalReport, ExecError> {
        let node = self.node(id)?;
        planner::incremental(self, &node, count)
    }

    /// Runs every incomplete ancestor of a node and then the node itself.
    pub fn run_tree(&self, id: NodeId) -> Result<Vec<NodeId>, ExecError> {
        let node = self.node(id)?;
        self.run_graph(&GraphNode::Exec(node))
    }

    /// Orders the incomplete part of the graph above `root` and runs it,
    /// returning the nodes that were executed.
    pub(crate) fn run_graph(&self, root: &GraphNode) -> Result<Vec<NodeId>, ExecError> {
        let mut graph: DiGraph<GraphNode, ()> = DiGraph::new();
        let mut indices: BTreeMap<GraphId, NodeIndex> = BTreeMap::new();

        if self.is_done(root)? {
            return Ok(Vec::new());
        }

        let index = graph.add_node(root.clone());
        indices.insert(root.id(), index);
        let mut stack = vec![index];

        while let Some(index) = stack.pop() {
            let current = graph[index].clone();
            for parent in self.graph_parents(&current)? {
                if self.is_done(&parent)? {
                    continue;
                }
                let parent_index = match indices.get(&parent.id()) {
                    Some(&i) => i,
                    None => {
                        let i = graph.add_node(parent.clone());
                        indices.insert(parent.id(), i);
                        stack.push(i);
                        i
                    }
                };
                graph.update_edge(parent_index, index, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| PlanError::Cycle(graph[cycle.node_id()].id()))?;

        let mut ran = Vec::new();
        for index in order {
            if let Some(node) = graph[index].as_exec() {
                runner::run_node(self, node, &RunOptions::default())?;
                ran.push(node.id);
            }
        }

        Ok(ran)
    }

    // Graph queries

    /// Direct parents of a graph member. Raw datasets have none.
    pub(crate) fn graph_parents(&self, node: &GraphNode) -> Result<Vec<GraphNode>, ExecError> {
        let GraphNode::Exec(node) = node else {
            return Ok(Vec::new());
        };

        node.parents
            .iter()
            .enumerate()
            .map(|(i, parent)| match parent.source {
                ParentSource::Node { id, .. } => self
                    .catalog
                    .get(id)
                    .map(GraphNode::Exec)
                    .ok_or_else(|| ExecError::MissingDependency(node.name.clone(), i)),
                ParentSource::Dataset { id } => self
                    .storage
                    .dataset(id)
                    .map(GraphNode::Dataset)
                    .map_err(|_| ExecError::MissingDependency(node.name.clone(), i)),
            })
            .collect()
    }

    /// Raw datasets are always complete; a node is complete once every
    /// output dataset exists and is marked done.
    pub(crate) fn is_done(&self, node: &GraphNode) -> Result<bool, ExecError> {
        match node {
            GraphNode::Dataset(_) => Ok(true),
            GraphNode::Exec(node) => {
                let datasets = self.output_datasets(node, false)?;
                Ok(datasets.iter().all(|ds| ds.as_ref().is_some_and(|ds| ds.done)))
            }
        }
    }

    /// Outputs of a node, as computed by its operator from the parents' data
    /// types, or as declared on the node.
    pub(crate) fn effective_outputs(&self, node: &ExecNode) -> Result<Vec<ExecOutput>, ExecError> {
        self.effective_outputs_at(node, 0)
    }

    fn effective_outputs_at(&self, node: &ExecNode, depth: usize) -> Result<Vec<ExecOutput>, ExecError> {
        let operator = self.registry.get(&node.op)?;
        let input_types = self.input_types_at(node, depth)?;
        Ok(operator
            .get_outputs(node, &input_types)
            .unwrap_or_else(|| node.outputs.clone()))
    }

    /// Data type of every parent, in parent order.
    pub(crate) fn input_types(&self, node: &ExecNode) -> Result<Vec<DataType>, ExecError> {
        self.input_types_at(node, 0)
    }

    fn input_types_at(&self, node: &ExecNode, depth: usize) -> Result<Vec<DataType>, ExecError> {
        if depth > self.catalog.len() {
            return Err(PlanError::Cycle(GraphId::Exec(node.id)).into());
        }

        let mut types = Vec::with_capacity(node.parents.len());
        for (i, parent) in node.parents.iter().enumerate() {
            let missing = || ExecError::MissingDependency(node.name.clone(), i);
            let data_type = match parent.source {
                ParentSource::Dataset { id } => {
                    self.storage.dataset(id).map_err(|_| missing())?.data_type
                }
                ParentSource::Node { id, slot } => {
                    let parent = self.catalog.get(id).ok_or_else(missing)?;
                    self.effective_outputs_at(&parent, depth + 1)?
                        .get(slot)
                        .ok_or_else(missing)?
                        .data_type
                        .clone()
                }
            };
            types.push(data_type);
        }

        Ok(types)
    }

    /// Output dataset of every output slot. With `create`, missing datasets
    /// are created and datasets of the wrong type replaced.
    pub(crate) fn output_datasets(
        &self,
        node: &ExecNode,
        create: bool,
    ) -> Result<Vec<Option<Dataset>>, ExecError> {
        let outputs = self.effective_outputs(node)?;
        let mut datasets = Vec::with_capacity(outputs.len());

        for output in &outputs {
            let existing = match self.catalog.dataset(node.id, &output.name) {
                Some(id) => match self.storage.dataset(id) {
                    Ok(ds) => Some(ds),
                    Err(StorageError::DatasetNotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                },
                None => None,
            };

            let dataset = match existing {
                Some(ds) if ds.data_type == output.data_type || !create => Some(ds),
                stale if create => {
                    if let Some(ds) = stale {
                        self.storage.delete_dataset(ds.id)?;
                    }
                    let name = format!("{}.{}", node.name, output.name);
                    let ds = self.storage.create_dataset(&name, output.data_type.clone())?;
                    self.catalog.set_dataset(node.id, &output.name, ds.id);
                    Some(ds)
                }
                _ => None,
            };
            datasets.push(dataset);
        }

        if create {
            // outputs renamed or removed since the last run
            let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
            for dataset in self.catalog.retain_datasets(node.id, &names) {
                tracing::debug!("dropping dataset {dataset} of a removed output of {}", node.name);
                self.drop_dataset(dataset)?;
            }
        }

        Ok(datasets)
    }

    /// The dataset feeding parent `index` of a node.
    pub(crate) fn parent_dataset(&self, node: &ExecNode, index: usize) -> Result<DatasetId, ExecError> {
        let missing = || ExecError::MissingDependency(node.name.clone(), index);
        match node.parents.get(index).ok_or_else(missing)?.source {
            ParentSource::Dataset { id } => Ok(id),
            ParentSource::Node { id, slot } => {
                let parent = self.catalog.get(id).ok_or_else(missing)?;
                let outputs = self.effective_outputs(&parent)?;
                let output = outputs.get(slot).ok_or_else(missing)?;
                self.catalog.dataset(id, &output.name).ok_or_else(|| {
                    ExecError::MissingDependency(parent.name.clone(), slot)
                })
            }
        }
    }

    /// Current items of every parent, grouped by role in parent order.
    pub(crate) fn parent_items(&self, node: &ExecNode) -> Result<Inputs<Item>, ExecError> {
        let mut items = Inputs::new();
        for (i, (role, _)) in node.parent_slots().into_iter().enumerate() {
            let dataset = self.parent_dataset(node, i)?;
            let list = match self.storage.list_items(dataset) {
                Ok(list) => list,
                Err(StorageError::DatasetNotFound(_)) => {
                    return Err(ExecError::MissingDependency(node.name.clone(), i));
                }
                Err(e) => return Err(e.into()),
            };
            items.entry(role.to_string()).or_insert_with(Vec::new).push(list);
        }
        Ok(items)
    }

    /// Keys of the items currently stored behind parent `index`.
    pub(crate) fn parent_keys(&self, node: &ExecNode, index: usize) -> Result<Vec<String>, ExecError> {
        let dataset = self.parent_dataset(node, index)?;
        Ok(self
            .storage
            .list_items(dataset)?
            .into_iter()
            .map(|item| item.key)
            .collect())
    }
}
