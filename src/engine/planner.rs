//! Incremental execution.
//!
//! Producing `n` outputs at a target node happens in five steps, all on the
//! calling thread:
//!
//! 1. Walk backwards from the target, stopping at complete nodes. Every
//!    member that cannot run incrementally is run in full right away; the
//!    remaining execution nodes form the incremental set.
//! 2. Resolve the output keys of incremental nodes in dependency order until
//!    the target's keys are known.
//! 3. Sample up to `n` of the target's keys at random.
//! 4. Push the demand for those keys back through the incremental set,
//!    consumers before producers, until no node needs any new key.
//! 5. Run each incremental node, parents first, limited to the keys it is
//!    needed for.
//!
//! Steps 2, 4 and 5 iterate to a fixed point. A pass that makes no progress,
//! or demand that keeps growing past the configured pass cap, is reported as
//! a [`PlanError`] instead of looping forever.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::core::NodeId;
use crate::engine::{Engine, RunOptions};
use crate::error::{ExecError, PlanError};
use crate::graph::{ExecNode, GraphId, GraphNode, ParentSource};
use crate::operator::{Incremental, Inputs};

/// Outcome of an incremental run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct IncrementalReport {
    /// Output keys sampled at the target.
    pub wanted: Vec<String>,
    /// Output keys each incremental node was asked to produce.
    pub needed: BTreeMap<NodeId, BTreeSet<String>>,
    /// Execution nodes that ran, in order, including those run in full.
    pub ran: Vec<NodeId>,
}

struct Member<'a> {
    node: Arc<ExecNode>,
    incremental: &'a dyn Incremental,
}

pub(crate) fn incremental(
    engine: &Engine,
    target: &Arc<ExecNode>,
    count: usize,
) -> Result<IncrementalReport, ExecError> {
    tracing::info!("[{}] begin incremental execution of {} outputs", target.name, count);

    let mut report = IncrementalReport::default();
    let root = GraphNode::Exec(target.clone());

    let target_incremental = engine.registry.get(&target.op)?.incremental().is_some();
    if !target_incremental || engine.is_done(&root)? {
        tracing::info!("[{}] cannot run incrementally, running in full", target.name);
        report.ran = engine.run_graph(&root)?;
        return Ok(report);
    }

    let members = classify(engine, &root, &mut report)?;
    let (keys, order) = discover_keys(engine, target, &members)?;

    let wanted = sample(engine, keys.get(&target.id).map(Vec::as_slice).unwrap_or_default(), count);
    tracing::info!("[{}] producing {} keys at this node", target.name, wanted.len());

    let needed = propagate(engine, target, &members, &order, &wanted)?;
    report.wanted = wanted.into_iter().collect();

    execute(engine, target, &members, &needed, &mut report)?;
    report.needed = needed;

    Ok(report)
}

/// Stage A: splits the incomplete ancestry of the target into incremental
/// members and everything else, and fully runs the latter.
fn classify<'a>(
    engine: &'a Engine,
    root: &GraphNode,
    report: &mut IncrementalReport,
) -> Result<BTreeMap<NodeId, Member<'a>>, ExecError> {
    let mut members = BTreeMap::new();
    let mut others = Vec::new();
    let mut seen: HashSet<GraphId> = HashSet::from([root.id()]);
    let mut stack = vec![root.clone()];

    while let Some(current) = stack.pop() {
        if engine.is_done(&current)? {
            continue;
        }

        let incremental = match &current {
            GraphNode::Exec(node) => engine.registry.get(&node.op)?.incremental(),
            GraphNode::Dataset(_) => None,
        };

        let (GraphNode::Exec(node), Some(incremental)) = (&current, incremental) else {
            others.push(current);
            continue;
        };

        for parent in engine.graph_parents(&current)? {
            if seen.insert(parent.id()) {
                stack.push(parent);
            }
        }

        members.insert(
            node.id,
            Member {
                node: node.clone(),
                incremental,
            },
        );
    }

    if !others.is_empty() {
        tracing::info!("running {} non-incremental ancestors", others.len());
        for other in &others {
            report.ran.extend(engine.run_graph(other)?);
        }
    }

    Ok(members)
}

/// Stage B: resolves output keys of incremental members until the target's
/// keys are known. Also returns the members in the order they resolved,
/// which puts every member after its incremental parents.
fn discover_keys(
    engine: &Engine,
    target: &ExecNode,
    members: &BTreeMap<NodeId, Member<'_>>,
) -> Result<(BTreeMap<NodeId, Vec<String>>, Vec<NodeId>), ExecError> {
    let mut keys: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();
    let mut order = Vec::with_capacity(members.len());

    while !keys.contains_key(&target.id) {
        let mut progress = false;

        for (id, member) in members {
            if keys.contains_key(id) {
                continue;
            }
            let Some(inputs) = input_keys(engine, &member.node, members, &keys)? else {
                continue;
            };
            let outputs = member.incremental.output_keys(&member.node, &inputs);
            tracing::debug!("[{}] {} output keys available", member.node.name, outputs.len());
            keys.insert(*id, outputs);
            order.push(*id);
            progress = true;
        }

        if !progress {
            return Err(PlanError::Stalled {
                stage: "key discovery",
                target: target.id,
            }
            .into());
        }
    }

    Ok((keys, order))
}

/// Keys available from each parent of a member, or `None` while some
/// incremental parent is still unresolved.
fn input_keys(
    engine: &Engine,
    node: &ExecNode,
    members: &BTreeMap<NodeId, Member<'_>>,
    resolved: &BTreeMap<NodeId, Vec<String>>,
) -> Result<Option<Inputs<String>>, ExecError> {
    let mut inputs = Inputs::new();

    for (i, (parent, (role, _))) in node.parents.iter().zip(node.parent_slots()).enumerate() {
        let keys = match parent.source {
            ParentSource::Node { id, .. } if members.contains_key(&id) => match resolved.get(&id) {
                Some(keys) => keys.clone(),
                None => return Ok(None),
            },
            _ => engine.parent_keys(node, i)?,
        };
        inputs.entry(role.to_string()).or_insert_with(Vec::new).push(keys);
    }

    Ok(Some(inputs))
}

/// Stage C: a uniform sample of `count` keys without replacement.
fn sample(engine: &Engine, keys: &[String], count: usize) -> BTreeSet<String> {
    let mut rng = match engine.settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut keys = keys.to_vec();
    keys.shuffle(&mut rng);
    keys.truncate(count);
    keys.into_iter().collect()
}

/// Stage D: pushes the wanted keys back through the incremental members.
///
/// Members are visited against `order`, so on an acyclic set every demand is
/// final after the first pass and the second one only confirms it.
fn propagate(
    engine: &Engine,
    target: &ExecNode,
    members: &BTreeMap<NodeId, Member<'_>>,
    order: &[NodeId],
    wanted: &BTreeSet<String>,
) -> Result<BTreeMap<NodeId, BTreeSet<String>>, ExecError> {
    let mut needed: BTreeMap<NodeId, BTreeSet<String>> =
        members.keys().map(|id| (*id, BTreeSet::new())).collect();
    needed.insert(target.id, wanted.clone());

    for _ in 0..engine.settings.max_plan_passes {
        let mut changed = false;

        for id in order.iter().rev() {
            let Some(member) = members.get(id) else {
                continue;
            };
            let outputs: Vec<String> = needed[id].iter().cloned().collect();
            let inputs = member.incremental.needed_inputs(&member.node, &outputs);

            for (parent, (role, index)) in member.node.parents.iter().zip(member.node.parent_slots()) {
                let ParentSource::Node { id: parent_id, .. } = parent.source else {
                    continue;
                };
                let Some(set) = needed.get_mut(&parent_id) else {
                    continue;
                };
                let keys = inputs.get(role).and_then(|d| d.get(index));
                for key in keys.into_iter().flatten() {
                    changed |= set.insert(key.clone());
                }
            }
        }

        if !changed {
            return Ok(needed);
        }
    }

    Err(PlanError::Diverged(engine.settings.max_plan_passes).into())
}

/// Stage E: runs members parents first, each limited to its demand.
fn execute(
    engine: &Engine,
    target: &ExecNode,
    members: &BTreeMap<NodeId, Member<'_>>,
    needed: &BTreeMap<NodeId, BTreeSet<String>>,
    report: &mut IncrementalReport,
) -> Result<(), ExecError> {
    let mut done: HashSet<NodeId> = HashSet::new();

    while !done.contains(&target.id) {
        let mut progress = false;

        for (id, member) in members {
            if done.contains(id) {
                continue;
            }

            let ready = member.node.parents.iter().all(|parent| match parent.source {
                ParentSource::Node { id, .. } => !members.contains_key(&id) || done.contains(&id),
                ParentSource::Dataset { .. } => true,
            });
            if !ready {
                continue;
            }

            let keys = needed.get(id).cloned().unwrap_or_default();
            tracing::info!(
                "[{}] computing {} output keys at node {}",
                target.name,
                keys.len(),
                member.node.name
            );

            let options = RunOptions {
                force: false,
                limit: Some(keys),
            };
            super::runner::run_node(engine, &member.node, &options)?;

            report.ran.push(*id);
            done.insert(*id);
            progress = true;
        }

        if !progress {
            return Err(PlanError::Stalled {
                stage: "forward execution",
                target: target.id,
            }
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::*;
    use crate::graph::{NodeSpec, NodeUpdate, Parent};
    use crate::storage::MemoryStorage;

    /// raw -> a -> b, both incremental copies
    fn chain(items: usize) -> (Engine, Arc<MemoryStorage>, Log, NodeId, NodeId) {
        let (engine, storage, log) = setup_with(|c| c.seed(7));
        let raw = seed_ints(&storage, "raw", items);
        let a = copy_node(&engine, "a", Parent::dataset("input", raw.id), "ws");
        let b = copy_node(&engine, "b", Parent::node("input", a.id, 0), "ws");
        (engine, storage, log, a.id, b.id)
    }

    #[test]
    fn test_chain_limits_root_to_wanted_keys() {
        let (engine, _, log, a, b) = chain(10);

        let report = engine.incremental(b, 3).unwrap();
        assert_eq!(report.wanted.len(), 3);
        assert_eq!(report.ran, [a, b]);

        let mut applied = log.applied("a");
        applied.sort();
        assert_eq!(applied, report.wanted);
        assert_eq!(output_keys(&engine, b), report.wanted);

        // limited runs leave the nodes incomplete
        assert!(!engine.node_datasets(a).unwrap()[0].done);
        assert!(!engine.node_datasets(b).unwrap()[0].done);
    }

    #[test]
    fn test_demand_reaches_every_member() {
        let (engine, _, _, a, b) = chain(6);

        let report = engine.incremental(b, 2).unwrap();
        let wanted: BTreeSet<String> = report.wanted.iter().cloned().collect();
        assert_eq!(report.needed[&b], wanted);
        assert_eq!(report.needed[&a], wanted);
    }

    #[test]
    fn test_count_above_available_yields_all() {
        let (engine, _, log, _, b) = chain(4);

        let report = engine.incremental(b, 100).unwrap();
        assert_eq!(report.wanted, int_keys(4));
        assert_eq!(output_keys(&engine, b), int_keys(4));
        assert_eq!(log.applied("b").len(), 4);
    }

    #[test]
    fn test_all_keys_match_full_run() {
        let (incremental, _, _, _, b) = chain(5);
        incremental.incremental(b, 5).unwrap();

        let (full, _, _, _, b_full) = chain(5);
        full.run_tree(b_full).unwrap();

        assert_eq!(output_hashes(&incremental, b), output_hashes(&full, b_full));
    }

    #[test]
    fn test_seed_makes_sampling_reproducible() {
        let (first, _, _, _, b) = chain(20);
        let (second, _, _, _, b2) = chain(20);

        let x = first.incremental(b, 5).unwrap().wanted;
        let y = second.incremental(b2, 5).unwrap().wanted;
        assert_eq!(x, y);
    }

    #[test]
    fn test_done_ancestors_are_read_not_rerun() {
        let (engine, _, log, a, b) = chain(8);
        engine.run(a, RunOptions::default()).unwrap();

        let report = engine.incremental(b, 2).unwrap();
        assert_eq!(report.ran, [b]);
        assert!(!report.needed.contains_key(&a));
        assert_eq!(log.applied("a").len(), 8);
        assert_eq!(log.applied("b").len(), 2);
    }

    #[test]
    fn test_non_incremental_ancestor_runs_in_full() {
        let (engine, storage, log) = setup_with(|c| c.seed(1));
        let raw = seed_ints(&storage, "raw", 6);
        let batch = engine
            .create_node(NodeSpec {
                name: "batch".into(),
                op: BATCH.into(),
                parents: vec![Parent::dataset("input", raw.id)],
                outputs: vec![int_output()],
                ..Default::default()
            })
            .unwrap();
        let top = copy_node(&engine, "top", Parent::node("input", batch.id, 0), "ws");

        let report = engine.incremental(top.id, 2).unwrap();
        assert_eq!(report.ran, [batch.id, top.id]);
        assert_eq!(log.applied("batch").len(), 6);
        assert_eq!(log.applied("top").len(), 2);
        assert!(engine.node_datasets(batch.id).unwrap()[0].done);
    }

    #[test]
    fn test_non_incremental_target_runs_tree() {
        let (engine, storage, log) = setup();
        let raw = seed_ints(&storage, "raw", 3);
        let a = copy_node(&engine, "a", Parent::dataset("input", raw.id), "ws");
        let batch = engine
            .create_node(NodeSpec {
                name: "batch".into(),
                op: BATCH.into(),
                parents: vec![Parent::node("input", a.id, 0)],
                outputs: vec![int_output()],
                ..Default::default()
            })
            .unwrap();

        let report = engine.incremental(batch.id, 1).unwrap();
        assert!(report.wanted.is_empty());
        assert_eq!(report.ran, [a.id, batch.id]);
        assert_eq!(log.applied("batch").len(), 3);
    }

    #[test]
    fn test_done_target_is_noop() {
        let (engine, _, log, _, b) = chain(3);
        engine.run_tree(b).unwrap();

        let report = engine.incremental(b, 2).unwrap();
        assert!(report.ran.is_empty());
        assert_eq!(log.applied("a").len(), 3);
    }

    #[test]
    fn test_deep_chain_settles_within_two_passes() {
        let (engine, storage, log) = setup_with(|c| c.max_plan_passes(2).seed(3));
        let raw = seed_ints(&storage, "raw", 4);
        let mut parent = Parent::dataset("input", raw.id);
        let mut chain = Vec::new();
        for name in ["a", "b", "c", "d", "e", "f"] {
            let node = copy_node(&engine, name, parent, "ws");
            parent = Parent::node("input", node.id, 0);
            chain.push(node.id);
        }

        let report = engine.incremental(chain[5], 1).unwrap();
        let wanted: BTreeSet<String> = report.wanted.iter().cloned().collect();
        assert_eq!(wanted.len(), 1);
        for id in &chain {
            assert_eq!(report.needed[id], wanted);
        }
        assert_eq!(report.ran, chain);
        assert_eq!(log.applied("a"), report.wanted);
    }

    fn with_previous(keys: &BTreeSet<String>) -> BTreeSet<String> {
        keys.iter()
            .cloned()
            .chain(keys.iter().filter_map(|key| previous_key(key)))
            .collect()
    }

    fn window_node(engine: &Engine, name: &str, parent: Parent) -> Arc<ExecNode> {
        engine
            .create_node(NodeSpec {
                name: name.into(),
                op: WINDOW.into(),
                parents: vec![parent],
                outputs: vec![int_output()],
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_demand_follows_key_mapping() {
        let (engine, storage, log) = setup_with(|c| c.seed(11));
        let raw = seed_ints(&storage, "raw", 10);
        let a = copy_node(&engine, "a", Parent::dataset("input", raw.id), "ws");
        let w = window_node(&engine, "w", Parent::node("input", a.id, 0));

        let report = engine.incremental(w.id, 3).unwrap();
        let wanted: BTreeSet<String> = report.wanted.iter().cloned().collect();
        assert_eq!(wanted.len(), 3);
        assert_eq!(report.needed[&w.id], wanted);
        assert_eq!(report.needed[&a.id], with_previous(&wanted));

        // upstream computes exactly the window of every wanted key
        let mut applied = log.applied("a");
        applied.sort();
        assert_eq!(applied, Vec::from_iter(with_previous(&wanted)));
        assert_eq!(output_keys(&engine, w.id), report.wanted);
    }

    #[test]
    fn test_diamond_unions_demand() {
        // raw -> a -> {b: copy, c: window} -> d
        let (engine, storage, log) = setup_with(|c| c.seed(5));
        let raw = seed_ints(&storage, "raw", 12);
        let a = copy_node(&engine, "a", Parent::dataset("input", raw.id), "ws");
        let b = copy_node(&engine, "b", Parent::node("input", a.id, 0), "ws");
        let c = window_node(&engine, "c", Parent::node("input", a.id, 0));
        let d = engine
            .create_node(NodeSpec {
                name: "d".into(),
                op: COPY.into(),
                parents: vec![Parent::node("input", b.id, 0), Parent::node("input", c.id, 0)],
                outputs: vec![int_output()],
                ..Default::default()
            })
            .unwrap();

        let report = engine.incremental(d.id, 2).unwrap();
        let wanted: BTreeSet<String> = report.wanted.iter().cloned().collect();
        assert_eq!(wanted.len(), 2);
        assert_eq!(report.needed[&d.id], wanted);
        assert_eq!(report.needed[&b.id], wanted);
        assert_eq!(report.needed[&c.id], wanted);
        assert_eq!(report.needed[&a.id], with_previous(&wanted));

        let sorted = |node: &str| {
            let mut keys = log.applied(node);
            keys.sort();
            keys
        };
        assert_eq!(sorted("a"), Vec::from_iter(with_previous(&wanted)));
        assert_eq!(sorted("b"), report.wanted);
        assert_eq!(sorted("c"), report.wanted);
        assert_eq!(sorted("d"), report.wanted);
        assert!(sorted("a").len() < 12);

        assert_eq!(report.ran.first(), Some(&a.id));
        assert_eq!(report.ran.last(), Some(&d.id));
        assert_eq!(output_keys(&engine, d.id), report.wanted);
    }

    #[test]
    fn test_cycle_is_a_plan_error() {
        let (engine, storage, _) = setup();
        let raw = seed_ints(&storage, "raw", 3);
        let a = copy_node(&engine, "a", Parent::dataset("input", raw.id), "ws");
        let b = copy_node(&engine, "b", Parent::node("input", a.id, 0), "ws");
        engine
            .update_node(
                a.id,
                NodeUpdate {
                    parents: Some(vec![Parent::node("input", b.id, 0)]),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = engine.incremental(b.id, 1).unwrap_err();
        assert!(matches!(err, ExecError::Plan(_)));
    }
}
