use std::sync::Arc;

use thiserror::Error;

use crate::core::{DatasetId, NodeId};
use crate::graph::GraphId;

/// Everything a node run, an incremental run, or a control-surface call can
/// fail with.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Operator '{0}' is not registered")]
    UnknownOperator(String),

    #[error("Exec node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Node '{0}' is not configured:\n{1}")]
    Config(String, anyhow::Error),

    #[error("Node '{0}' couldn't discover tasks:\n{1}")]
    Discover(String, anyhow::Error),

    #[error("Dataset for parent node {0}[{1}] is missing")]
    MissingDependency(String, usize),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Planning failed:\n{0}")]
    Plan(#[from] PlanError),

    #[error("Couldn't build worker pool:\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{stage} made no progress before node {target} resolved")]
    Stalled { stage: &'static str, target: NodeId },

    #[error("demand propagation still growing after {0} passes")]
    Diverged(usize),

    #[error("dependency cycle through {0}")]
    Cycle(GraphId),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Dataset {0} not found")]
    DatasetNotFound(DatasetId),

    #[error("Item '{1}' not found in dataset {0}")]
    ItemNotFound(DatasetId, String),

    #[error("Item '{1}' already exists in dataset {0}")]
    DuplicateKey(DatasetId, String),

    #[error("Couldn't load item data.\n{0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the subprocess bridge.
///
/// Inner errors are shared behind [`Arc`] so the first protocol failure can be
/// stored once and handed to every waiting and future caller.
#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    #[error("worker stream error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("malformed control packet: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("couldn't load task input: {0}")]
    Input(Arc<StorageError>),

    #[error("worker answered for unknown session '{0}'")]
    UnknownSession(String),

    #[error("session '{0}' is already in flight")]
    DuplicateSession(String),

    #[error("worker closed the stream")]
    Disconnected,

    #[error("closed")]
    Closed,
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Json(Arc::new(e))
    }
}

impl From<StorageError> for BridgeError {
    fn from(e: StorageError) -> Self {
        BridgeError::Input(Arc::new(e))
    }
}
