use std::collections::HashMap;

use crate::core::Item;
use crate::graph::ExecNode;
use crate::operator::{ExecOp, Inputs, Task};

type ApplyFn = dyn Fn(&Task) -> anyhow::Result<()> + Send + Sync;

/// An [`ExecOp`] for operators that keep no state between tasks: just a
/// function and the parallelism it wants.
pub struct SimpleExecOp {
    apply: Box<ApplyFn>,
    parallelism: Option<usize>,
}

impl SimpleExecOp {
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&Task) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            apply: Box::new(apply),
            parallelism: None,
        }
    }

    /// Fixes the worker count instead of using one worker per core.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }
}

impl ExecOp for SimpleExecOp {
    fn parallelism(&self) -> usize {
        self.parallelism
            .unwrap_or_else(crate::utils::default_parallelism)
    }

    fn apply(&self, task: &Task) -> anyhow::Result<()> {
        (self.apply)(task)
    }
}

/// One task per key present in every input dataset, ordered by key.
///
/// Each task receives, for every role and dataset, the single item stored
/// under its key.
pub fn simple_tasks(items: &Inputs<Item>) -> Vec<Task> {
    let datasets: Vec<(&str, HashMap<&str, &Item>)> = items
        .iter()
        .flat_map(|(role, datasets)| {
            datasets.iter().map(move |items| {
                let by_key = items.iter().map(|item| (item.key.as_str(), item)).collect();
                (role.as_str(), by_key)
            })
        })
        .collect();

    let Some((_, first)) = datasets.first() else {
        return Vec::new();
    };

    let mut keys: Vec<&str> = first.keys().copied().collect();
    keys.sort_unstable();

    keys.into_iter()
        .filter(|key| datasets.iter().all(|(_, by_key)| by_key.contains_key(key)))
        .map(|key| {
            let mut inputs = Inputs::new();
            for (role, by_key) in &datasets {
                inputs
                    .entry(role.to_string())
                    .or_insert_with(Vec::new)
                    .push(vec![by_key[key].clone()]);
            }
            Task::new(key, inputs)
        })
        .collect()
}

/// Tags the first task, e.g. as the one that also writes a dataset-wide
/// artifact next to its own output.
pub fn tag_first(tasks: Vec<Task>, metadata: &str) -> Vec<Task> {
    tasks
        .into_iter()
        .enumerate()
        .map(|(i, task)| if i == 0 { task.with_metadata(metadata) } else { task })
        .collect()
}

/// Output keys of a one-output-per-shared-key operator: the keys present in
/// every input.
pub fn simple_output_keys(inputs: &Inputs<String>) -> Vec<String> {
    let mut lists = inputs.values().flatten();
    let Some(first) = lists.next() else {
        return Vec::new();
    };

    let rest: Vec<_> = lists.collect();
    let mut keys: Vec<String> = first
        .iter()
        .filter(|key| rest.iter().all(|list| list.contains(key)))
        .cloned()
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// Needed inputs of a one-output-per-shared-key operator: every parent must
/// supply exactly the wanted keys.
pub fn simple_needed_inputs(node: &ExecNode, outputs: &[String]) -> Inputs<String> {
    let mut needed = Inputs::new();
    for (role, _) in node.parent_slots() {
        needed
            .entry(role.to_string())
            .or_insert_with(Vec::new)
            .push(outputs.to_vec());
    }
    needed
}
