//! In-process cluster.
//!
//! A [`MemoryHub`] connects any number of [`MemoryCluster`] nodes living in the
//! same process. A hub with a single node is the standalone deployment: that
//! node has no peers and is always the leader.

use super::{Cluster, ClusterMember, ClusterMessage, INBOX_CAPACITY};
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

struct HubNode {
    inbox: mpsc::Sender<ClusterMessage>,
    channels: HashSet<String>,
    joined_at: DateTime<Utc>,
}

/// Shared switchboard of in-process nodes.
#[derive(Default)]
pub struct MemoryHub {
    nodes: RwLock<BTreeMap<String, HubNode>>,
    leader_override: RwLock<Option<String>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node named `name` and return its handle and inbox.
    pub fn join(
        self: &Arc<Self>,
        name: impl Into<String>,
    ) -> (Arc<MemoryCluster>, mpsc::Receiver<ClusterMessage>) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.nodes.write().insert(
            name.clone(),
            HubNode {
                inbox: tx,
                channels: HashSet::new(),
                joined_at: Utc::now(),
            },
        );
        debug!("[Cluster] {} joined the in-process hub", name);

        let node = Arc::new(MemoryCluster {
            name,
            hub: Arc::clone(self),
        });
        (node, rx)
    }

    pub fn leave(&self, name: &str) {
        self.nodes.write().remove(name);
    }

    /// Force leadership onto `leader`, or restore the default rule with `None`.
    pub fn set_leader(&self, leader: Option<String>) {
        *self.leader_override.write() = leader;
    }

    /// Current leader: the override, else the smallest node id.
    pub fn leader(&self) -> Option<String> {
        if let Some(leader) = self.leader_override.read().clone() {
            return Some(leader);
        }
        self.nodes.read().keys().next().cloned()
    }

    async fn deliver(&self, inbox: mpsc::Sender<ClusterMessage>, target: &str, message: ClusterMessage) {
        if inbox.send(message).await.is_err() {
            warn!("[Cluster] Inbox of {} is closed", target);
        }
    }
}

/// Handle of one node on a [`MemoryHub`].
pub struct MemoryCluster {
    name: String,
    hub: Arc<MemoryHub>,
}

impl MemoryCluster {
    /// Single-node cluster for standalone deployments.
    pub fn standalone(
        name: impl Into<String>,
    ) -> (Arc<MemoryCluster>, mpsc::Receiver<ClusterMessage>) {
        MemoryHub::new().join(name)
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        if let Some(node) = self.hub.nodes.write().get_mut(&self.name) {
            node.channels.insert(channel.to_string());
        }
        Ok(())
    }

    fn members(&self) -> HashMap<String, ClusterMember> {
        self.hub
            .nodes
            .read()
            .iter()
            .filter(|(id, _)| **id != self.name)
            .map(|(id, node)| {
                (
                    id.clone(),
                    ClusterMember {
                        channels: node.channels.clone(),
                        last_seen: Some(node.joined_at),
                    },
                )
            })
            .collect()
    }

    async fn send_to(&self, channel: &str, payload: serde_json::Value, target: &str) -> Result<()> {
        let inbox = self
            .hub
            .nodes
            .read()
            .get(target)
            .map(|node| node.inbox.clone())
            .ok_or_else(|| CoordinatorError::Cluster(format!("unknown member '{}'", target)))?;

        let message = ClusterMessage {
            channel: channel.to_string(),
            origin: self.name.clone(),
            payload,
        };
        self.hub.deliver(inbox, target, message).await;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        let recipients: Vec<(String, mpsc::Sender<ClusterMessage>)> = self
            .hub
            .nodes
            .read()
            .iter()
            .filter(|(id, node)| **id != self.name && node.channels.contains(channel))
            .map(|(id, node)| (id.clone(), node.inbox.clone()))
            .collect();

        for (target, inbox) in recipients {
            let message = ClusterMessage {
                channel: channel.to_string(),
                origin: self.name.clone(),
                payload: payload.clone(),
            };
            self.hub.deliver(inbox, &target, message).await;
        }
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.hub.leader().as_deref() == Some(self.name.as_str())
    }
}
