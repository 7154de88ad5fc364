//! Eventually-consistent export of Node and Deployment records
//!
//! The controller owns authoritative state in memory. Every change is
//! published on an unbounded channel and written by a background task, so a
//! slow or failing sink never stalls message ingress.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::deployment::Deployment;
use super::node::Node;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A record change to mirror
#[derive(Debug, Clone)]
pub enum MirrorRecord {
    Node(Box<Node>),
    Deployment(Box<Deployment>),
}

impl MirrorRecord {
    fn collection(&self) -> &'static str {
        match self {
            MirrorRecord::Node(_) => "nodes",
            MirrorRecord::Deployment(_) => "deployments",
        }
    }

    fn id(&self) -> &str {
        match self {
            MirrorRecord::Node(n) => &n.node_id,
            MirrorRecord::Deployment(d) => &d.deployment_id,
        }
    }
}

/// Destination for mirrored records
#[async_trait]
pub trait MirrorSink: Send + Sync {
    async fn write(&self, record: &MirrorRecord) -> Result<(), MirrorError>;
}

/// Discards everything
pub struct NullSink;

#[async_trait]
impl MirrorSink for NullSink {
    async fn write(&self, _record: &MirrorRecord) -> Result<(), MirrorError> {
        Ok(())
    }
}

/// Writes `nodes/<id>.json` and `deployments/<id>.json` under a root dir
pub struct JsonFileSink {
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, collection: &str, id: &str) -> PathBuf {
        self.root
            .join(collection)
            .join(format!("{}.json", sanitize(id)))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MirrorError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl MirrorSink for JsonFileSink {
    async fn write(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        let path = self.path_for(record.collection(), record.id());
        match record {
            MirrorRecord::Node(node) => write_json(&path, node).await,
            MirrorRecord::Deployment(deployment) => write_json(&path, deployment).await,
        }
    }
}

/// Cheap handle used by the controller to publish changes
#[derive(Clone)]
pub struct MirrorHandle {
    tx: Option<mpsc::UnboundedSender<MirrorRecord>>,
}

impl MirrorHandle {
    /// Handle that drops every record
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, record: MirrorRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(record).is_err() {
                debug!("Mirror task stopped, dropping record");
            }
        }
    }
}

/// Spawn the writer task; it ends when every handle is dropped
pub fn spawn_mirror(sink: Arc<dyn MirrorSink>) -> (MirrorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MirrorRecord>();

    let task = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(e) = sink.write(&record).await {
                error!(
                    "Failed to mirror {}/{}: {}",
                    record.collection(),
                    record.id(),
                    e
                );
            }
        }
        debug!("Mirror writer finished");
    });

    (MirrorHandle { tx: Some(tx) }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::tests::register_payload;
    use crate::cluster::scope::Ownership;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_ids() {
        assert_eq!(sanitize("gpu-01"), "gpu-01");
        assert_eq!(sanitize("../etc/passwd"), ".._etc_passwd");
    }

    #[tokio::test]
    async fn test_json_sink_writes_node() {
        let dir = TempDir::new().unwrap();
        let sink = JsonFileSink::new(dir.path());
        let node = Node::from_registration(
            "n1",
            &register_payload("n1"),
            Ownership::default(),
            Utc::now(),
        );

        sink.write(&MirrorRecord::Node(Box::new(node))).await.unwrap();

        let path = sink.path_for("nodes", "n1");
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["nodeId"], "n1");
        assert_eq!(value["status"], "online");
    }

    #[tokio::test]
    async fn test_spawned_mirror_drains() {
        let dir = TempDir::new().unwrap();
        let (handle, task) = spawn_mirror(Arc::new(JsonFileSink::new(dir.path())));
        let node = Node::from_registration(
            "n2",
            &register_payload("n2"),
            Ownership::default(),
            Utc::now(),
        );

        handle.publish(MirrorRecord::Node(Box::new(node)));
        drop(handle);
        task.await.unwrap();

        assert!(dir.path().join("nodes").join("n2.json").exists());
    }

    #[test]
    fn test_disabled_handle_is_noop() {
        let handle = MirrorHandle::disabled();
        let node = Node::from_registration(
            "n3",
            &register_payload("n3"),
            Ownership::default(),
            Utc::now(),
        );
        handle.publish(MirrorRecord::Node(Box::new(node)));
    }
}
