use parking_lot::Mutex;
use serde::Serialize;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Engine, RunOptions};
use crate::error::ExecError;
use crate::graph::ExecNode;
use crate::operator::{ExecOp, PrepareContext, Task};

/// Outcome of a single node run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// The outputs were already complete and nothing ran.
    pub skipped: bool,
    /// Tasks handed to the operator after limiting.
    pub tasks: usize,
    /// Size of the worker pool.
    pub workers: usize,
}

impl RunReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

pub(crate) fn run_node(
    engine: &Engine,
    node: &ExecNode,
    options: &RunOptions,
) -> Result<RunReport, ExecError> {
    let operator = engine.registry.get(&node.op)?;

    let datasets = engine.output_datasets(node, true)?;
    if !options.force && datasets.iter().all(|ds| ds.as_ref().is_some_and(|ds| ds.done)) {
        tracing::debug!("node {} is up to date", node.name);
        return Ok(RunReport::skipped());
    }

    let span = tracing::info_span!("run", node = %node.name);
    let _enter = span.enter();

    let outputs: Vec<_> = datasets.into_iter().flatten().collect();
    for dataset in &outputs {
        engine.storage.clear(dataset.id)?;
        engine.storage.set_done(dataset.id, false)?;
    }

    let items = engine.parent_items(node)?;
    let input_types = engine.input_types(node)?;

    let mut tasks = operator
        .get_tasks(node, &items)
        .map_err(|e| ExecError::Discover(node.name.clone(), e))?;

    if let Some(limit) = &options.limit {
        tasks.retain(|task| limit.contains(&task.key));
    }

    let ctx = PrepareContext {
        node,
        outputs: &outputs,
        input_types: &input_types,
        storage: &engine.storage,
        codecs: &engine.codecs,
    };

    let op = operator
        .prepare(&ctx)
        .map_err(|e| ExecError::Config(node.name.clone(), e))?;

    let workers = worker_count(op.as_ref(), tasks.len(), engine.settings.max_workers);
    let result = apply_all(node, op.as_ref(), &tasks, workers, &span);
    op.close();
    result?;

    if options.limit.is_none() {
        for dataset in &outputs {
            engine.storage.set_done(dataset.id, true)?;
        }
    }

    tracing::info!("node {} done", node.name);

    Ok(RunReport {
        skipped: false,
        tasks: tasks.len(),
        workers,
    })
}

fn worker_count(op: &dyn ExecOp, tasks: usize, max_workers: Option<usize>) -> usize {
    op.parallelism()
        .min(max_workers.unwrap_or(usize::MAX))
        .min(tasks)
        .max(1)
}

struct Dispatch {
    next: usize,
    failure: Option<ExecError>,
}

/// Applies every task on a pool of `workers` threads.
///
/// Workers pull the next task from a shared counter. The first failure is
/// kept and stops any further dispatch, while tasks that are already running
/// are left to finish.
fn apply_all(
    node: &ExecNode,
    op: &dyn ExecOp,
    tasks: &[Task],
    workers: usize,
    span: &Span,
) -> Result<(), ExecError> {
    if tasks.is_empty() {
        tracing::info!("node {} has no tasks", node.name);
        return Ok(());
    }

    tracing::info!("running {} tasks in {} threads", tasks.len(), workers);

    span.pb_set_style(crate::utils::style_run());
    span.pb_set_length(tasks.len() as u64);
    span.pb_set_message(&node.name);

    let dispatch = Mutex::new(Dispatch {
        next: 0,
        failure: None,
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("worker-{i}"))
        .build()?;

    pool.scope(|s| {
        for _ in 0..workers {
            s.spawn(|_| worker(node, op, tasks, &dispatch, span));
        }
    });

    match dispatch.into_inner().failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn worker(node: &ExecNode, op: &dyn ExecOp, tasks: &[Task], dispatch: &Mutex<Dispatch>, span: &Span) {
    loop {
        let task = {
            let mut dispatch = dispatch.lock();
            if dispatch.failure.is_some() || dispatch.next >= tasks.len() {
                return;
            }
            dispatch.next += 1;
            &tasks[dispatch.next - 1]
        };

        let task_span = tracing::info_span!(parent: span, "task", node = %node.name, key = %task.key);
        let _enter = task_span.enter();
        tracing::debug!("apply on {}", task.key);

        if let Err(e) = op.apply(task) {
            tracing::warn!("task {} failed", task.key);
            let mut dispatch = dispatch.lock();
            if dispatch.failure.is_none() {
                dispatch.failure = Some(ExecError::Task(task.key.clone(), e));
            }
            return;
        }

        span.pb_inc(1);
    }
}
