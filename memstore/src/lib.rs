//! An in-memory implementation of the `tabletraft` collaborator traits, for
//! demo and testing purposes.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use anyhow::anyhow;
use anyhow::Result;
use tabletraft::async_trait::async_trait;
use tabletraft::Log;
use tabletraft::MetaStore;
use tabletraft::OpId;
use tabletraft::PersistentState;
use tabletraft::ReplicaTransactionFactory;
use tabletraft::ReplicateMsg;
use tabletraft::ReplicatePayload;
use tabletraft::Round;

/// An in-memory write-ahead log.
pub struct MemLog {
    log: RwLock<BTreeMap<i64, ReplicateMsg>>,
    syncs: AtomicU64,
}

impl MemLog {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(BTreeMap::new()),
            syncs: AtomicU64::new(0),
        }
    }

    /// All entries currently in the log, in index order.
    pub fn entries(&self) -> Vec<ReplicateMsg> {
        self.log.read().unwrap().values().cloned().collect()
    }

    /// The OpIds currently in the log, in index order.
    pub fn opids(&self) -> Vec<OpId> {
        self.log.read().unwrap().values().map(|m| m.id).collect()
    }

    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Log for MemLog {
    async fn append(&self, ops: &[ReplicateMsg]) -> Result<OpId> {
        let mut log = self.log.write().unwrap();
        let mut last = match log.values().next_back() {
            Some(msg) => msg.id,
            None => OpId::MIN,
        };
        for op in ops {
            if op.id.index != last.index + 1 {
                return Err(anyhow!(
                    "op {}.{} does not follow the log tail {}.{}",
                    op.id.term,
                    op.id.index,
                    last.term,
                    last.index
                ));
            }
            log.insert(op.id.index, op.clone());
            last = op.id;
        }
        Ok(last)
    }

    async fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn truncate_after(&self, index: i64) -> Result<()> {
        let mut log = self.log.write().unwrap();
        log.split_off(&(index + 1));
        Ok(())
    }

    fn last_opid(&self) -> OpId {
        self.log
            .read()
            .unwrap()
            .values()
            .next_back()
            .map(|m| m.id)
            .unwrap_or(OpId::MIN)
    }
}

/// In-memory storage for the persistent consensus metadata record.
pub struct MemMetaStore {
    state: RwLock<Option<PersistentState>>,
    flushes: AtomicU64,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            flushes: AtomicU64::new(0),
        }
    }

    /// The number of flushes observed; durability-ordering tests use this.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// The record as last flushed.
    pub fn stored(&self) -> Option<PersistentState> {
        self.state.read().unwrap().clone()
    }
}

impl Default for MemMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn load(&self) -> Result<Option<PersistentState>> {
        Ok(self.state.read().unwrap().clone())
    }

    async fn flush(&self, state: &PersistentState) -> Result<()> {
        *self.state.write().unwrap() = Some(state.clone());
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FactoryInner {
    /// The replica state machine: committed writes in apply order.
    applied: Mutex<Vec<(OpId, Vec<u8>)>>,
}

/// A replica transaction factory that applies committed writes to an
/// in-memory state machine.
///
/// Prepare is a no-op; Apply happens inside the replicated callback, which
/// the consensus core invokes in index order, so applies are serialised per
/// tablet for free.
pub struct MemTabletFactory {
    inner: Arc<FactoryInner>,
}

impl MemTabletFactory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                applied: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Applied writes, in apply order.
    pub fn applied(&self) -> Vec<(OpId, Vec<u8>)> {
        self.inner.applied.lock().unwrap().clone()
    }

    pub fn applied_opids(&self) -> Vec<OpId> {
        self.inner.applied.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

impl Default for MemTabletFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicaTransactionFactory for MemTabletFactory {
    async fn start_replica_transaction(&self, round: Arc<Round>) -> Result<()> {
        let inner = self.inner.clone();
        let msg = round.replicate_msg();
        round.set_replicated_callback(Box::new(move |result| {
            if result.is_err() {
                tracing::debug!(op = %msg.id, "replica transaction aborted");
                return;
            }
            if let ReplicatePayload::Write(data) = msg.payload {
                inner.applied.lock().unwrap().push((msg.id, data));
            }
        }));
        Ok(())
    }
}
