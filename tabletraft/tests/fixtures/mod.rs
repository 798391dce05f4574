//! Fixtures for testing the consensus core.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use memstore::MemLog;
use memstore::MemMetaStore;
use memstore::MemTabletFactory;
use tabletraft::async_trait::async_trait;
use tabletraft::AppendEntriesRequest;
use tabletraft::AppendEntriesResponse;
use tabletraft::ConsensusBootstrapInfo;
use tabletraft::ConsensusOptions;
use tabletraft::Messenger;
use tabletraft::OpId;
use tabletraft::RaftConfig;
use tabletraft::RaftConsensus;
use tabletraft::RaftPeer;
use tabletraft::RaftRole;
use tabletraft::ReplicateMsg;
use tabletraft::ReplicatePayload;
use tabletraft::Round;
use tabletraft::RunLeaderElectionRequest;
use tabletraft::VoteRequest;
use tabletraft::VoteResponse;
use tokio::sync::oneshot;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Cluster-test options: fast heartbeats, short elections.
pub fn fast_options() -> ConsensusOptions {
    ConsensusOptions::build()
        .heartbeat_interval(50)
        .max_missed_heartbeats(3)
        .rpc_timeout(250)
        .validate()
        .expect("valid test options")
}

/// Direct-drive options: the failure detector stays quiet for ~10s so a test
/// can feed RPCs by hand without a background election interfering.
pub fn quiet_options() -> ConsensusOptions {
    ConsensusOptions::build()
        .heartbeat_interval(1000)
        .max_missed_heartbeats(10)
        .backoff_cap(60_000)
        .validate()
        .expect("valid test options")
}

/// A three-voter config over the given uuids.
pub fn config_of(uuids: &[&str]) -> RaftConfig {
    RaftConfig::bootstrap(uuids.iter().map(|u| peer_of(u)).collect())
}

pub fn peer_of(uuid: &str) -> RaftPeer {
    RaftPeer::new_voter(uuid, format!("host-{}", uuid), 7050)
}

/// Everything belonging to one in-process node.
pub struct NodeHandles {
    pub consensus: RaftConsensus,
    pub log: Arc<MemLog>,
    pub meta: Arc<MemMetaStore>,
    pub factory: Arc<MemTabletFactory>,
}

/// A type which emulates a network transport between in-process consensus
/// instances, with support for isolating nodes.
pub struct RaftRouter {
    options: ConsensusOptions,
    routing_table: RwLock<BTreeMap<String, NodeHandles>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<String>>,
}

impl RaftRouter {
    pub fn new(options: ConsensusOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
        })
    }

    /// Create and register a node. It participates once `start_node` runs.
    pub async fn add_node(self: &Arc<Self>, uuid: &str, initial_config: RaftConfig) -> Result<()> {
        let log = Arc::new(MemLog::new());
        let meta = Arc::new(MemMetaStore::new());
        let factory = Arc::new(MemTabletFactory::new());
        let messenger: Arc<dyn Messenger> = self.clone();
        let consensus = RaftConsensus::new(
            "tablet-1".to_string(),
            peer_of(uuid),
            self.options.clone(),
            initial_config,
            log.clone(),
            meta.clone(),
            messenger,
            factory.clone(),
            Box::new(|_reason| {}),
        )
        .await
        .map_err(anyhow::Error::new)?;
        let mut rt = self.routing_table.write().await;
        rt.insert(
            uuid.to_string(),
            NodeHandles {
                consensus,
                log,
                meta,
                factory,
            },
        );
        Ok(())
    }

    pub async fn start_node(&self, uuid: &str) -> Result<()> {
        self.consensus(uuid)
            .await?
            .start(ConsensusBootstrapInfo::default())
            .await
            .map_err(anyhow::Error::new)
    }

    pub async fn consensus(&self, uuid: &str) -> Result<RaftConsensus> {
        let rt = self.routing_table.read().await;
        rt.get(uuid)
            .map(|n| n.consensus.clone())
            .ok_or_else(|| anyhow!("node {} not found in routing table", uuid))
    }

    pub async fn log(&self, uuid: &str) -> Result<Arc<MemLog>> {
        let rt = self.routing_table.read().await;
        rt.get(uuid)
            .map(|n| n.log.clone())
            .ok_or_else(|| anyhow!("node {} not found in routing table", uuid))
    }

    pub async fn meta(&self, uuid: &str) -> Result<Arc<MemMetaStore>> {
        let rt = self.routing_table.read().await;
        rt.get(uuid)
            .map(|n| n.meta.clone())
            .ok_or_else(|| anyhow!("node {} not found in routing table", uuid))
    }

    pub async fn factory(&self, uuid: &str) -> Result<Arc<MemTabletFactory>> {
        let rt = self.routing_table.read().await;
        rt.get(uuid)
            .map(|n| n.factory.clone())
            .ok_or_else(|| anyhow!("node {} not found in routing table", uuid))
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, uuid: &str) {
        tracing::info!(node = uuid, "isolating node");
        self.isolated_nodes.write().await.insert(uuid.to_string());
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, uuid: &str) {
        tracing::info!(node = uuid, "restoring node");
        self.isolated_nodes.write().await.remove(uuid);
    }

    /// The uuid of the current leader among reachable nodes. When stale
    /// leaders linger, the one with the highest term wins.
    pub async fn leader(&self) -> Option<String> {
        let isolated = self.isolated_nodes.read().await;
        let rt = self.routing_table.read().await;
        rt.iter()
            .filter(|(uuid, node)| {
                !isolated.contains(*uuid) && node.consensus.role() == RaftRole::Leader
            })
            .max_by_key(|(_, node)| node.consensus.current_term())
            .map(|(uuid, _)| uuid.clone())
    }

    /// Wait for a reachable leader to emerge.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no leader emerged within {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait for a reachable leader other than `not` to emerge.
    pub async fn wait_for_new_leader(&self, not: &str, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                if leader != not {
                    return Ok(leader);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no new leader emerged within {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until `pred` holds for the node's consensus state.
    pub async fn wait_for_state<F>(&self, uuid: &str, timeout: Duration, msg: &str, pred: F) -> Result<()>
    where F: Fn(&tabletraft::ConsensusState) -> bool {
        let consensus = self.consensus(uuid).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&consensus.consensus_state()) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "node {} did not reach the expected state within {:?}: {}",
                    uuid,
                    timeout,
                    msg
                ));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until every listed node's committed index reaches `index`.
    pub async fn wait_for_commit(&self, uuids: &[&str], index: i64, timeout: Duration) -> Result<()> {
        for uuid in uuids {
            self.wait_for_state(uuid, timeout, &format!("committed_index >= {}", index), |s| {
                s.committed_index >= index
            })
            .await?;
        }
        Ok(())
    }

    /// Submit a write through the leader and wait for its replicated
    /// callback. Returns the OpId the operation was assigned.
    pub async fn client_write(&self, leader: &str, payload: &[u8]) -> Result<OpId> {
        let consensus = self.consensus(leader).await?;
        let (tx, rx) = oneshot::channel();
        let round = Round::new(
            ReplicateMsg::new(ReplicatePayload::Write(payload.to_vec())),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        consensus
            .check_leadership_and_bind_term(&round)
            .map_err(anyhow::Error::new)?;
        consensus.replicate(round.clone()).await.map_err(anyhow::Error::new)?;
        let result = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .map_err(|_| anyhow!("write did not commit within 10s"))?
            .map_err(|_| anyhow!("round was dropped without notification"))?;
        result.map_err(anyhow::Error::new)?;
        Ok(round.id())
    }

    /// Assert that the listed nodes' logs contain exactly the same OpIds.
    pub async fn assert_logs_equal(&self, uuids: &[&str]) -> Result<Vec<OpId>> {
        let mut reference: Option<(String, Vec<OpId>)> = None;
        for uuid in uuids {
            let opids = self.log(uuid).await?.opids();
            match &reference {
                None => reference = Some((uuid.to_string(), opids)),
                Some((ref_uuid, ref_opids)) => {
                    if &opids != ref_opids {
                        return Err(anyhow!(
                            "log mismatch: {} has {:?} but {} has {:?}",
                            uuid,
                            opids,
                            ref_uuid,
                            ref_opids
                        ));
                    }
                }
            }
        }
        Ok(reference.map(|(_, opids)| opids).unwrap_or_default())
    }

    async fn check_reachable(&self, from: &str, to: &str) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(from) {
            return Err(anyhow!("node {} is isolated", from));
        }
        if isolated.contains(to) {
            return Err(anyhow!("node {} is isolated", to));
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for RaftRouter {
    async fn append_entries(&self, target: &RaftPeer, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.check_reachable(&req.leader_uuid, &target.uuid).await?;
        let node = self.consensus(&target.uuid).await?;
        node.update(req).await.map_err(anyhow::Error::new)
    }

    async fn request_vote(&self, target: &RaftPeer, req: VoteRequest) -> Result<VoteResponse> {
        self.check_reachable(&req.candidate_uuid, &target.uuid).await?;
        let node = self.consensus(&target.uuid).await?;
        node.request_vote(req).await.map_err(anyhow::Error::new)
    }

    async fn run_leader_election(&self, target: &RaftPeer, req: RunLeaderElectionRequest) -> Result<()> {
        {
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target.uuid) {
                return Err(anyhow!("node {} is isolated", target.uuid));
            }
        }
        let node = self.consensus(&target.uuid).await?;
        node.handle_run_leader_election(req).await.map_err(anyhow::Error::new)
    }
}

/// A messenger for single-node direct-drive tests: every peer is unreachable.
pub struct UnreachableMessenger;

#[async_trait]
impl Messenger for UnreachableMessenger {
    async fn append_entries(&self, target: &RaftPeer, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        Err(anyhow!("peer {} is unreachable", target.uuid))
    }

    async fn request_vote(&self, target: &RaftPeer, _req: VoteRequest) -> Result<VoteResponse> {
        Err(anyhow!("peer {} is unreachable", target.uuid))
    }

    async fn run_leader_election(&self, target: &RaftPeer, _req: RunLeaderElectionRequest) -> Result<()> {
        Err(anyhow!("peer {} is unreachable", target.uuid))
    }
}

/// Build a standalone node (not attached to a router) for direct-drive tests.
pub async fn standalone_node(uuid: &str, config: RaftConfig, options: ConsensusOptions) -> Result<NodeHandles> {
    let log = Arc::new(MemLog::new());
    let meta = Arc::new(MemMetaStore::new());
    let factory = Arc::new(MemTabletFactory::new());
    let consensus = RaftConsensus::new(
        "tablet-1".to_string(),
        peer_of(uuid),
        options,
        config,
        log.clone(),
        meta.clone(),
        Arc::new(UnreachableMessenger),
        factory.clone(),
        Box::new(|_reason| {}),
    )
    .await
    .map_err(anyhow::Error::new)?;
    consensus
        .start(ConsensusBootstrapInfo::default())
        .await
        .map_err(anyhow::Error::new)?;
    Ok(NodeHandles {
        consensus,
        log,
        meta,
        factory,
    })
}

/// A write message with a pre-assigned OpId, as a leader would send it.
pub fn write_msg(term: i64, index: i64, data: &[u8]) -> ReplicateMsg {
    let mut msg = ReplicateMsg::new(ReplicatePayload::Write(data.to_vec()));
    msg.id = OpId::new(term, index);
    msg
}

/// An AppendEntries request as a remote leader would build it.
pub fn append_req(
    leader: &str,
    term: i64,
    preceding: OpId,
    committed_index: i64,
    ops: Vec<ReplicateMsg>,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        tablet_id: "tablet-1".to_string(),
        leader_uuid: leader.to_string(),
        term,
        preceding_opid: preceding,
        committed_index,
        ops,
    }
}
