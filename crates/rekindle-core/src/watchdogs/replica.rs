// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replica membership and watchdog work partitioning.
//!
//! Each process registers itself as a replica and bumps its heartbeat on every
//! check. Peers whose heartbeat stops advancing are struck out. The rank of
//! this replica among the alive ones (its offset) and the replica count decide
//! which function instances its watchdogs scan:
//!
//! ```text
//!   shard(function_id) mod count == offset
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::run_loop;
use crate::error::Result;
use crate::settings::Settings;
use crate::sink::{Component, ExceptionSink};
use crate::store::FunctionStore;
use crate::types::{FunctionId, ReplicaId};

/// Stable shard of a function id, identical on every replica and platform.
pub fn shard(function_id: &FunctionId) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(function_id.type_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(function_id.instance_id.as_str().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// This replica's slice of the function space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaAssignment {
    /// Rank of this replica among the alive replicas.
    pub offset: usize,
    /// Number of alive replicas.
    pub count: usize,
}

impl Default for ReplicaAssignment {
    fn default() -> Self {
        Self {
            offset: 0,
            count: 1,
        }
    }
}

impl ReplicaAssignment {
    /// Whether the replica with this assignment is responsible for `function_id`.
    pub fn owns(&self, function_id: &FunctionId) -> bool {
        self.count <= 1 || shard(function_id) % self.count as u64 == self.offset as u64
    }
}

struct PeerObservation {
    heartbeat: i64,
    strikes: u32,
}

/// Heartbeats this replica and strikes out silent peers.
pub struct ReplicaWatchdog {
    replica_id: ReplicaId,
    functions: Arc<dyn FunctionStore>,
    frequency: Duration,
    strike_threshold: u32,
    sink: ExceptionSink,
    assignment: watch::Sender<ReplicaAssignment>,
    peers: Mutex<HashMap<ReplicaId, PeerObservation>>,
}

impl std::fmt::Debug for ReplicaWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaWatchdog")
            .field("replica_id", &self.replica_id)
            .field("assignment", &*self.assignment.borrow())
            .finish_non_exhaustive()
    }
}

impl ReplicaWatchdog {
    /// Create a watchdog for `replica_id`. Call [`initialize`](Self::initialize)
    /// before the first check.
    pub fn new(
        replica_id: ReplicaId,
        functions: Arc<dyn FunctionStore>,
        settings: &Settings,
        sink: ExceptionSink,
    ) -> Self {
        let (assignment, _) = watch::channel(ReplicaAssignment::default());
        Self {
            replica_id,
            functions,
            frequency: settings.replica_check_frequency,
            strike_threshold: settings.replica_strike_threshold,
            sink,
            assignment,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// This replica's id.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Current assignment.
    pub fn assignment(&self) -> ReplicaAssignment {
        *self.assignment.borrow()
    }

    /// Receiver notified whenever the assignment changes.
    pub fn subscribe(&self) -> watch::Receiver<ReplicaAssignment> {
        self.assignment.subscribe()
    }

    /// Register this replica and publish the initial assignment.
    pub async fn initialize(&self) -> Result<()> {
        self.functions.register_replica(self.replica_id).await?;
        let replicas = self.functions.get_replicas().await?;
        self.publish(replicas.iter().map(|r| r.replica_id).collect());
        info!(replica_id = %self.replica_id, assignment = ?self.assignment(), "Replica registered");
        Ok(())
    }

    /// Remove this replica from the membership list.
    pub async fn deregister(&self) -> Result<()> {
        self.functions.delete_replica(self.replica_id).await?;
        Ok(())
    }

    /// One membership round: heartbeat self, strike silent peers, recompute
    /// the assignment from a single snapshot.
    pub async fn check(&self) -> Result<()> {
        if !self
            .functions
            .update_replica_heartbeat(self.replica_id)
            .await?
        {
            warn!(replica_id = %self.replica_id, "Replica was struck out, re-registering");
            self.functions.register_replica(self.replica_id).await?;
        }

        let replicas = self.functions.get_replicas().await?;
        let struck_out = {
            let mut peers = self.peers.lock().await;
            peers.retain(|id, _| replicas.iter().any(|r| &r.replica_id == id));

            let mut struck_out = Vec::new();
            for replica in replicas.iter().filter(|r| r.replica_id != self.replica_id) {
                match peers.get_mut(&replica.replica_id) {
                    Some(peer) if peer.heartbeat == replica.heartbeat => {
                        peer.strikes += 1;
                        debug!(
                            peer = %replica.replica_id,
                            strikes = peer.strikes,
                            "Peer heartbeat unchanged"
                        );
                        if peer.strikes >= self.strike_threshold {
                            struck_out.push(replica.replica_id);
                        }
                    }
                    Some(peer) => {
                        peer.heartbeat = replica.heartbeat;
                        peer.strikes = 0;
                    }
                    None => {
                        peers.insert(
                            replica.replica_id,
                            PeerObservation {
                                heartbeat: replica.heartbeat,
                                strikes: 0,
                            },
                        );
                    }
                }
            }
            for id in &struck_out {
                peers.remove(id);
            }
            struck_out
        };

        let alive = if struck_out.is_empty() {
            replicas.into_iter().map(|r| r.replica_id).collect()
        } else {
            for id in &struck_out {
                if self.functions.delete_replica(*id).await? {
                    info!(replica_id = %self.replica_id, peer = %id, "Peer replica struck out");
                }
            }
            self.functions
                .get_replicas()
                .await?
                .into_iter()
                .map(|r| r.replica_id)
                .collect()
        };
        self.publish(alive);
        Ok(())
    }

    fn publish(&self, mut alive: Vec<ReplicaId>) {
        if !alive.contains(&self.replica_id) {
            alive.push(self.replica_id);
        }
        alive.sort();

        let offset = alive
            .iter()
            .position(|id| *id == self.replica_id)
            .unwrap_or_default();
        let next = ReplicaAssignment {
            offset,
            count: alive.len(),
        };
        let previous = self.assignment.send_replace(next);
        if previous != next {
            info!(
                replica_id = %self.replica_id,
                offset = next.offset,
                count = next.count,
                "Replica assignment changed"
            );
        }
    }

    /// Run checks until `shutdown` fires.
    pub async fn run(self: Arc<Self>, delay_startup: Duration, shutdown: CancellationToken) {
        run_loop(
            Component::ReplicaWatchdog,
            None,
            self.frequency,
            delay_startup,
            shutdown,
            self.sink.clone(),
            || self.check(),
        )
        .await;
    }
}
