#![forbid(unsafe_code)]
//! Pipeline execution engine for dataset-transforming operators.
//!
//! A pipeline is a graph of execution nodes. Each node wraps an operator
//! that reads the items of its parent datasets and writes items to its own
//! output datasets. The [`Engine`] decides what has to run, splits a node's
//! work into independent [`Task`]s and applies them on a bounded worker pool.
//!
//! Besides full runs, nodes whose operators implement [`Incremental`] can be
//! asked for just a few outputs. The engine then samples the wanted output
//! keys, works out which input keys each upstream node needs for them and
//! computes only those.
//!
//! Operators may also live outside the process: [`SubprocessOperator`] starts
//! a worker command and multiplexes concurrent tasks to it over a single
//! [`Bridge`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use tributary::{Engine, MemoryStorage, OperatorRegistry, SubprocessOperator, WorkerCommand};
//!
//! let mut registry = OperatorRegistry::new();
//! registry.register("python", SubprocessOperator::new(WorkerCommand::new("python3").arg("run.py")));
//!
//! let engine = Engine::config(registry, Arc::new(MemoryStorage::new()))
//!     .max_workers(8)
//!     .finish();
//! ```

pub mod bridge;
mod catalog;
mod core;
pub mod data;
mod engine;
mod error;
mod graph;
pub mod operator;
mod storage;
mod utils;

pub use crate::bridge::{Bridge, SubprocessOperator, WorkerCommand};
pub use crate::core::{CopyMode, DataType, Dataset, DatasetId, Hash32, Item, ItemSpec, NodeId, Provider};
pub use crate::data::{Codec, Codecs, Data};
pub use crate::engine::{Config, Engine, IncrementalReport, RunOptions, RunReport};
pub use crate::error::*;
pub use crate::graph::{
    ExecNode, ExecOutput, GraphId, GraphNode, GraphType, NodeSpec, NodeUpdate, Parent, ParentSource,
};
pub use crate::operator::{ExecOp, Incremental, Inputs, Operator, OperatorRegistry, Task};
pub use crate::storage::{MemoryStorage, Storage, format_ext};
pub use crate::utils::{default_parallelism, init_logging};
