//! The peer manager: one outbound worker per remote peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use futures::future::AbortHandle;
use futures::future::Abortable;
use tokio::sync::Notify;
use tracing_futures::Instrument;

use crate::config::ConsensusOptions;
use crate::network::Messenger;
use crate::queue::PeerMessageQueue;
use crate::raft_types::RaftPeer;
use crate::ReplicaId;

struct RemotePeer {
    wakeup: Arc<Notify>,
    abort: AbortHandle,
}

/// Owns one worker task per remote peer while this replica leads.
///
/// Each worker drains AppendEntries requests from the message queue, falls
/// back to heartbeats when idle, and retries transport failures with capped
/// exponential backoff. Workers exit when the queue leaves leader mode or the
/// manager closes.
pub(crate) struct PeerManager {
    tablet_id: String,
    local_uuid: ReplicaId,
    options: Arc<ConsensusOptions>,
    messenger: Arc<dyn Messenger>,
    queue: Arc<PeerMessageQueue>,
    peers: Mutex<HashMap<ReplicaId, RemotePeer>>,
}

impl PeerManager {
    pub fn new(
        tablet_id: String,
        local_uuid: ReplicaId,
        options: Arc<ConsensusOptions>,
        messenger: Arc<dyn Messenger>,
        queue: Arc<PeerMessageQueue>,
    ) -> Self {
        Self {
            tablet_id,
            local_uuid,
            options,
            messenger,
            queue,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Start workers for every remote member. Called on becoming leader.
    pub fn start_peers(&self, members: &[RaftPeer]) {
        let mut peers = self.peers.lock().unwrap();
        for member in members {
            if member.uuid == self.local_uuid {
                continue;
            }
            peers
                .entry(member.uuid.clone())
                .or_insert_with(|| self.spawn_peer(member));
        }
    }

    /// Reconcile workers with a changed membership.
    pub fn update_peers(&self, members: &[RaftPeer]) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|uuid, remote| {
            let keep = members.iter().any(|m| &m.uuid == uuid);
            if !keep {
                remote.abort.abort();
            }
            keep
        });
        for member in members {
            if member.uuid == self.local_uuid {
                continue;
            }
            peers
                .entry(member.uuid.clone())
                .or_insert_with(|| self.spawn_peer(member));
        }
    }

    /// Wake every worker; called after the leader enqueues an operation.
    pub fn signal_request_all(&self) {
        let peers = self.peers.lock().unwrap();
        for remote in peers.values() {
            remote.wakeup.notify_one();
        }
    }

    /// Stop all workers. Called on step-down and shutdown. Idempotent.
    pub fn close(&self) {
        let mut peers = self.peers.lock().unwrap();
        for (_, remote) in peers.drain() {
            remote.abort.abort();
        }
    }

    fn spawn_peer(&self, member: &RaftPeer) -> RemotePeer {
        let wakeup = Arc::new(Notify::new());
        let (abort, registration) = AbortHandle::new_pair();
        let span = tracing::debug_span!(
            "peer",
            tablet = %self.tablet_id,
            local = %self.local_uuid,
            remote = %member.uuid,
        );
        let task = drive_peer(
            member.uuid.clone(),
            self.options.clone(),
            self.messenger.clone(),
            self.queue.clone(),
            wakeup.clone(),
        );
        let task = Abortable::new(task.instrument(span), registration);
        tokio::spawn(async move {
            let _ = task.await;
        });
        RemotePeer { wakeup, abort }
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// The send loop for one remote peer.
async fn drive_peer(
    uuid: ReplicaId,
    options: Arc<ConsensusOptions>,
    messenger: Arc<dyn Messenger>,
    queue: Arc<PeerMessageQueue>,
    wakeup: Arc<Notify>,
) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let (peer, request) = match queue.request_for_peer(&uuid) {
            Ok(pair) => pair,
            // The peer is no longer tracked: leadership was lost or the
            // member was removed.
            Err(_) => return,
        };

        let outcome = tokio::time::timeout(options.rpc_timeout(), messenger.append_entries(&peer, request)).await;
        match outcome {
            Ok(Ok(resp)) => {
                consecutive_failures = 0;
                if queue.response_from_peer(&uuid, &resp) {
                    // More operations are waiting; keep draining.
                    continue;
                }
            }
            Ok(Err(error)) => {
                consecutive_failures += 1;
                queue.peer_communication_failed(&uuid);
                tracing::warn!(peer = %uuid, %error, "error sending AppendEntries to peer");
            }
            Err(_elapsed) => {
                consecutive_failures += 1;
                queue.peer_communication_failed(&uuid);
                tracing::warn!(peer = %uuid, timeout = ?options.rpc_timeout(), "AppendEntries to peer timed out");
            }
        }

        let pause = if consecutive_failures == 0 {
            options.heartbeat_period()
        } else {
            let exp = consecutive_failures.min(6);
            std::time::Duration::from_millis(
                (options.heartbeat_interval << exp).min(options.backoff_cap),
            )
        };
        tokio::select! {
            _ = wakeup.notified() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
