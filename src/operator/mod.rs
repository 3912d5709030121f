//! Operators: the pluggable logic behind execution nodes.
//!
//! An operator type is described once by an [`Operator`] descriptor, kept in
//! an [`OperatorRegistry`] under its type name. For every run the descriptor
//! discovers [`Task`]s from the parents' items and instantiates an [`ExecOp`],
//! a stateful handle that applies tasks (possibly from many worker threads at
//! once) until it is closed.
//!
//! Operators that can also report which output keys they are able to produce,
//! and which input keys a given output subset needs, additionally implement
//! [`Incremental`]; only those take part in incremental execution.

mod registry;
mod simple;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::core::{DataType, Dataset, Item};
use crate::data::Codecs;
use crate::graph::{ExecNode, ExecOutput};
use crate::storage::Storage;

pub use registry::OperatorRegistry;
pub use simple::{SimpleExecOp, simple_needed_inputs, simple_output_keys, simple_tasks, tag_first};

/// Per-role matrix of values: `role -> parent dataset -> values`.
///
/// Within a role, datasets appear in the order their parents are listed on
/// the node.
pub type Inputs<T> = BTreeMap<String, Vec<Vec<T>>>;

/// One independently applicable unit of an operator's work.
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    /// For incremental operators, exactly the output key this task produces.
    pub key: String,
    pub items: Inputs<Item>,
    /// Free-form tag, e.g. to single out the task that also writes a summary.
    pub metadata: String,
}

impl Task {
    pub fn new(key: impl Into<String>, items: Inputs<Item>) -> Self {
        Self {
            key: key.into(),
            items,
            metadata: String::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// The first item of dataset `index` feeding `role`.
    pub fn item(&self, role: &str, index: usize) -> Option<&Item> {
        self.items.get(role)?.get(index)?.first()
    }
}

/// Everything an operator needs to instantiate itself for one run.
pub struct PrepareContext<'a> {
    pub node: &'a ExecNode,
    /// Output datasets, in output slot order.
    pub outputs: &'a [Dataset],
    /// Data type of every parent, in parent order.
    pub input_types: &'a [DataType],
    pub storage: &'a Arc<dyn Storage>,
    pub codecs: &'a Codecs,
}

/// A running operator instance bound to one node's output datasets.
pub trait ExecOp: Send + Sync {
    /// Desired number of concurrent workers.
    fn parallelism(&self) -> usize;

    fn apply(&self, task: &Task) -> anyhow::Result<()>;

    /// Releases the instance. Called exactly once, after the last apply.
    fn close(&self) {}
}

/// Static description of an operator type.
pub trait Operator: Send + Sync {
    /// Resource requirements of a node, e.g. `{"gpu": 1}`.
    fn requirements(&self, _node: &ExecNode) -> BTreeMap<String, u32> {
        BTreeMap::new()
    }

    /// Splits the parents' items into tasks.
    fn get_tasks(&self, _node: &ExecNode, items: &Inputs<Item>) -> anyhow::Result<Vec<Task>> {
        Ok(simple_tasks(items))
    }

    fn prepare(&self, ctx: &PrepareContext<'_>) -> anyhow::Result<Box<dyn ExecOp>>;

    /// Outputs derived from the current parents, when they are not fixed by
    /// the node's declaration.
    fn get_outputs(&self, _node: &ExecNode, _input_types: &[DataType]) -> Option<Vec<ExecOutput>> {
        None
    }

    fn incremental(&self) -> Option<&dyn Incremental> {
        None
    }
}

/// Key-level knowledge of an operator, required for incremental execution.
///
/// Both methods must be pure functions of their arguments.
pub trait Incremental: Send + Sync {
    /// Every output key the node would produce from the given input keys.
    fn output_keys(&self, node: &ExecNode, inputs: &Inputs<String>) -> Vec<String>;

    /// Input keys needed from each parent to produce `outputs`.
    fn needed_inputs(&self, node: &ExecNode, outputs: &[String]) -> Inputs<String>;
}
