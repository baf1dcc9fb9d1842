//! Heartbeat-based membership and leader election over MQTT topics.
//!
//! Every node publishes a retained heartbeat on `{prefix}/members/{id}`.
//! A node counts as a member while its latest heartbeat is younger than
//! three heartbeat intervals. The leader is the smallest id among the live
//! members and the local node.

use crate::cluster::ClusterMember;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Heartbeats missed before a member is considered gone.
const MISSED_HEARTBEATS: i32 = 3;

/// Retained payload announcing a node and its channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub channels: HashSet<String>,
    pub last_seen: DateTime<Utc>,
}

/// Topic layout under a common prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

/// Classified incoming topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Member(String),
    Broadcast(String),
    Directed { channel: String, target: String },
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn member(&self, id: &str) -> String {
        format!("{}/members/{}", self.prefix, id)
    }

    pub fn all_members(&self) -> String {
        format!("{}/members/+", self.prefix)
    }

    pub fn broadcast(&self, channel: &str) -> String {
        format!("{}/channel/{}", self.prefix, channel)
    }

    pub fn directed(&self, channel: &str, target: &str) -> String {
        format!("{}/channel/{}/{}", self.prefix, channel, target)
    }

    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;

        if let Some(id) = rest.strip_prefix("members/") {
            return (!id.is_empty() && !id.contains('/')).then(|| TopicKind::Member(id.to_string()));
        }

        let rest = rest.strip_prefix("channel/")?;
        match rest.split('/').collect::<Vec<_>>().as_slice() {
            [channel] if !channel.is_empty() => Some(TopicKind::Broadcast(channel.to_string())),
            [channel, target] if !channel.is_empty() && !target.is_empty() => {
                Some(TopicKind::Directed {
                    channel: channel.to_string(),
                    target: target.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Latest heartbeat per peer.
#[derive(Debug)]
pub struct MembershipTable {
    stale_after: Duration,
    members: HashMap<String, ClusterMember>,
}

impl MembershipTable {
    pub fn new(heartbeat_interval: std::time::Duration) -> Self {
        let interval = Duration::from_std(heartbeat_interval).unwrap_or(Duration::seconds(5));
        Self {
            stale_after: interval * MISSED_HEARTBEATS,
            members: HashMap::new(),
        }
    }

    /// Record a heartbeat of `id` received at `received_at`.
    ///
    /// The earlier of send and receive time counts, so retained heartbeats of
    /// dead nodes do not look fresh.
    pub fn record(&mut self, id: &str, heartbeat: Heartbeat, received_at: DateTime<Utc>) {
        let last_seen = heartbeat.last_seen.min(received_at);
        self.members.insert(
            id.to_string(),
            ClusterMember {
                channels: heartbeat.channels,
                last_seen: Some(last_seen),
            },
        );
    }

    pub fn remove(&mut self, id: &str) {
        self.members.remove(id);
    }

    pub fn live_members(&self, now: DateTime<Utc>) -> HashMap<String, ClusterMember> {
        self.members
            .iter()
            .filter(|(_, member)| {
                member
                    .last_seen
                    .is_some_and(|seen| now.signed_duration_since(seen) <= self.stale_after)
            })
            .map(|(id, member)| (id.clone(), member.clone()))
            .collect()
    }

    pub fn leader(&self, local: &str, now: DateTime<Utc>) -> String {
        self.live_members(now)
            .into_keys()
            .chain(std::iter::once(local.to_string()))
            .min()
            .unwrap_or_else(|| local.to_string())
    }
}
