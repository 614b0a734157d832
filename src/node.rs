//! Execution on the node that hosts a workspace.
//!
//! A workspace may live on a machine other than the one driving the monitor.
//! Work against it is packaged as a [`FileCallable`] and handed to the
//! workspace's [`NodeChannel`], which runs it wherever the files actually are.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Work that runs against a path on the node hosting it.
pub trait FileCallable: Send + 'static {
    type Output: Send + 'static;

    fn invoke(self, root: &Path) -> io::Result<Self::Output>;
}

/// A type-erased unit of work shipped to a node.
pub type RemoteTask = Box<dyn FnOnce(&Path) + Send>;

/// Transport to the node that hosts a workspace.
///
/// `execute` blocks until the node has run `task` or the transport fails.
/// Implementations must call `task` at most once.
pub trait NodeChannel: Send + Sync {
    /// Human-readable node name for logs.
    fn name(&self) -> &str;

    fn execute(&self, root: &Path, task: RemoteTask) -> Result<(), NodeError>;
}

/// The node this process runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalNode;

impl NodeChannel for LocalNode {
    fn name(&self) -> &str {
        "local"
    }

    fn execute(&self, root: &Path, task: RemoteTask) -> Result<(), NodeError> {
        task(root);
        Ok(())
    }
}

/// Handle to a workspace directory on some node.
#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    channel: Arc<dyn NodeChannel>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, channel: Arc<dyn NodeChannel>) -> Self {
        Self {
            root: root.into(),
            channel,
        }
    }

    /// A workspace on the local filesystem.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(LocalNode))
    }

    /// Path of the workspace as seen by its node.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_name(&self) -> &str {
        self.channel.name()
    }

    /// Run `callable` against the workspace root on its node.
    ///
    /// The dispatch happens on tokio's blocking pool, so a slow node or a
    /// long walk never stalls the async workers.
    pub async fn act<C: FileCallable>(&self, callable: C) -> Result<C::Output, NodeError> {
        let channel = Arc::clone(&self.channel);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            channel.execute(
                &root,
                Box::new(move |path: &Path| {
                    let _ = tx.send(callable.invoke(path));
                }),
            )?;
            match rx.recv() {
                Ok(result) => result.map_err(NodeError::Io),
                Err(_) => Err(NodeError::NoReply {
                    node: channel.name().to_string(),
                }),
            }
        })
        .await
        .map_err(|e| NodeError::Join { source: e })?
    }

    /// Whether the workspace root exists on its node.
    pub async fn exists(&self) -> Result<bool, NodeError> {
        self.act(Exists).await
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("node", &self.channel.name())
            .finish()
    }
}

struct Exists;

impl FileCallable for Exists {
    type Output = bool;

    fn invoke(self, root: &Path) -> io::Result<bool> {
        root.try_exists()
    }
}

/// Errors from running work on a workspace's node.
#[derive(Debug)]
pub enum NodeError {
    /// The work itself failed on the node.
    Io(io::Error),
    /// The transport to the node failed.
    Channel { node: String, message: String },
    /// The node dropped the work without running it.
    NoReply { node: String },
    /// The blocking dispatch task panicked or was cancelled.
    Join { source: tokio::task::JoinError },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Io(e) => write!(f, "I/O error on node: {e}"),
            NodeError::Channel { node, message } => {
                write!(f, "channel to node {node} failed: {message}")
            }
            NodeError::NoReply { node } => write!(f, "node {node} dropped the request"),
            NodeError::Join { source } => write!(f, "node dispatch task failed: {source}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Io(e) => Some(e),
            NodeError::Join { source } => Some(source),
            NodeError::Channel { .. } | NodeError::NoReply { .. } => None,
        }
    }
}
