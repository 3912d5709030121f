//! Operators and helpers shared by the engine tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::bail;
use ciborium::Value;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::core::{DataType, Dataset, DatasetId, Hash32, Item, NodeId};
use crate::data::Data;
use crate::engine::{Config, Engine};
use crate::graph::{ExecNode, ExecOutput, NodeSpec, Parent};
use crate::operator::{
    ExecOp, Incremental, Inputs, Operator, OperatorRegistry, PrepareContext, SimpleExecOp, Task,
    simple_needed_inputs, simple_output_keys,
};
use crate::storage::{MemoryStorage, Storage};

pub const COPY: &str = "copy";
pub const BATCH: &str = "batch";
pub const ECHO: &str = "echo";
pub const WINDOW: &str = "window";

/// Records every apply and close, per node name.
#[derive(Clone, Default)]
pub struct Log {
    applied: Arc<Mutex<Vec<(String, String)>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl Log {
    pub fn applied(&self, node: &str) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn closed(&self, node: &str) -> usize {
        self.closed.lock().iter().filter(|n| *n == node).count()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CopyParams {
    fail_on: Option<String>,
    parallelism: Option<usize>,
}

/// Copies the `input` item of every task to the first output.
struct CopyOperator {
    incremental: bool,
    log: Log,
}

struct CopyExec {
    node: String,
    output: DatasetId,
    storage: Arc<dyn Storage>,
    params: CopyParams,
    log: Log,
}

impl ExecOp for CopyExec {
    fn parallelism(&self) -> usize {
        self.params.parallelism.unwrap_or(8)
    }

    fn apply(&self, task: &Task) -> anyhow::Result<()> {
        self.log
            .applied
            .lock()
            .push((self.node.clone(), task.key.clone()));

        if self.params.fail_on.as_deref() == Some(task.key.as_str()) {
            bail!("refusing to copy {}", task.key);
        }

        let Some(item) = task.item("input", 0) else {
            bail!("task {} has no input", task.key);
        };
        let data = self.storage.load_data(item)?;
        self.storage.write_item(self.output, &task.key, &data)?;
        Ok(())
    }

    fn close(&self) {
        self.log.closed.lock().push(self.node.clone());
    }
}

impl Operator for CopyOperator {
    fn requirements(&self, _: &ExecNode) -> BTreeMap<String, u32> {
        BTreeMap::from([("cpu".to_string(), 1)])
    }

    fn prepare(&self, ctx: &PrepareContext<'_>) -> anyhow::Result<Box<dyn ExecOp>> {
        let params: CopyParams = match ctx.node.config.as_str() {
            "" => CopyParams::default(),
            _ => ctx.node.decode_config()?,
        };
        let Some(output) = ctx.outputs.first() else {
            bail!("copy needs an output");
        };

        Ok(Box::new(CopyExec {
            node: ctx.node.name.clone(),
            output: output.id,
            storage: ctx.storage.clone(),
            params,
            log: self.log.clone(),
        }))
    }

    fn incremental(&self) -> Option<&dyn Incremental> {
        self.incremental.then_some(self as &dyn Incremental)
    }
}

impl Incremental for CopyOperator {
    fn output_keys(&self, _: &ExecNode, inputs: &Inputs<String>) -> Vec<String> {
        simple_output_keys(inputs)
    }

    fn needed_inputs(&self, node: &ExecNode, outputs: &[String]) -> Inputs<String> {
        simple_needed_inputs(node, outputs)
    }
}

/// Output `k` counts the input items under `k` and the key before it.
struct WindowOperator {
    log: Log,
}

/// The int key preceding `key`, if any.
pub fn previous_key(key: &str) -> Option<String> {
    let n: usize = key.parse().ok()?;
    n.checked_sub(1).map(|p| format!("{p:04}"))
}

impl Operator for WindowOperator {
    fn get_tasks(&self, _: &ExecNode, items: &Inputs<Item>) -> anyhow::Result<Vec<Task>> {
        let Some(input) = items.get("input").and_then(|datasets| datasets.first()) else {
            return Ok(Vec::new());
        };
        let by_key: HashMap<&str, &Item> = input.iter().map(|item| (item.key.as_str(), item)).collect();

        let mut tasks: Vec<Task> = input
            .iter()
            .map(|item| {
                let mut window = vec![item.clone()];
                if let Some(prev) = previous_key(&item.key).and_then(|k| by_key.get(k.as_str()).copied()) {
                    window.push(prev.clone());
                }
                Task::new(item.key.clone(), Inputs::from([("input".to_string(), vec![window])]))
            })
            .collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tasks)
    }

    fn prepare(&self, ctx: &PrepareContext<'_>) -> anyhow::Result<Box<dyn ExecOp>> {
        let Some(output) = ctx.outputs.first() else {
            bail!("window needs an output");
        };
        let output = output.id;
        let node = ctx.node.name.clone();
        let storage = ctx.storage.clone();
        let log = self.log.clone();

        Ok(Box::new(
            SimpleExecOp::new(move |task| {
                log.applied.lock().push((node.clone(), task.key.clone()));
                let size = task.items.get("input").and_then(|d| d.first()).map_or(0, Vec::len);
                let data = Data::new(DataType::new("int"), vec![Value::Integer((size as i64).into())]);
                storage.write_item(output, &task.key, &data)?;
                Ok(())
            })
            .with_parallelism(2),
        ))
    }

    fn incremental(&self) -> Option<&dyn Incremental> {
        Some(self)
    }
}

impl Incremental for WindowOperator {
    fn output_keys(&self, _: &ExecNode, inputs: &Inputs<String>) -> Vec<String> {
        simple_output_keys(inputs)
    }

    fn needed_inputs(&self, _: &ExecNode, outputs: &[String]) -> Inputs<String> {
        let mut keys: BTreeSet<String> = outputs.iter().cloned().collect();
        keys.extend(outputs.iter().filter_map(|key| previous_key(key)));
        Inputs::from([("input".to_string(), vec![keys.into_iter().collect()])])
    }
}

/// One output per parent, named after its role and typed like it.
struct EchoOperator;

impl Operator for EchoOperator {
    fn prepare(&self, _: &PrepareContext<'_>) -> anyhow::Result<Box<dyn ExecOp>> {
        Ok(Box::new(SimpleExecOp::new(|_| Ok(()))))
    }

    fn get_outputs(&self, node: &ExecNode, input_types: &[DataType]) -> Option<Vec<ExecOutput>> {
        Some(
            node.parents
                .iter()
                .zip(input_types)
                .map(|(parent, data_type)| ExecOutput::new(parent.role.clone(), data_type.clone()))
                .collect(),
        )
    }
}

pub fn setup() -> (Engine, Arc<MemoryStorage>, Log) {
    setup_with(|config| config)
}

pub fn setup_with(configure: impl FnOnce(Config) -> Config) -> (Engine, Arc<MemoryStorage>, Log) {
    let log = Log::default();
    let storage = Arc::new(MemoryStorage::new());

    let mut registry = OperatorRegistry::new();
    registry
        .register(
            COPY,
            CopyOperator {
                incremental: true,
                log: log.clone(),
            },
        )
        .register(
            BATCH,
            CopyOperator {
                incremental: false,
                log: log.clone(),
            },
        )
        .register(ECHO, EchoOperator)
        .register(WINDOW, WindowOperator { log: log.clone() });

    let engine = configure(Engine::config(registry, storage.clone())).finish();
    (engine, storage, log)
}

pub fn int_keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{i:04}")).collect()
}

pub fn int_output() -> ExecOutput {
    ExecOutput::new("output", "int")
}

/// A complete raw dataset of `n` single-record int items.
pub fn seed_ints(storage: &MemoryStorage, name: &str, n: usize) -> Dataset {
    let items = int_keys(n).into_iter().enumerate().map(|(i, key)| {
        let record = Value::Integer((i as i64).into());
        (key, Data::new(DataType::new("int"), vec![record]))
    });
    storage.seed(name, DataType::new("int"), items).unwrap()
}

pub fn copy_node(engine: &Engine, name: &str, parent: Parent, workspace: &str) -> Arc<ExecNode> {
    engine
        .create_node(NodeSpec {
            name: name.into(),
            op: COPY.into(),
            parents: vec![parent],
            outputs: vec![int_output()],
            workspace: workspace.into(),
            ..Default::default()
        })
        .unwrap()
}

/// Keys stored in the first output of a node.
pub fn output_keys(engine: &Engine, id: NodeId) -> Vec<String> {
    output_hashes(engine, id).into_iter().map(|(key, _)| key).collect()
}

pub fn output_hashes(engine: &Engine, id: NodeId) -> Vec<(String, Option<Hash32>)> {
    let datasets = engine.node_datasets(id).unwrap();
    engine
        .storage()
        .list_items(datasets[0].id)
        .unwrap()
        .into_iter()
        .map(|item| (item.key, item.hash))
        .collect()
}
