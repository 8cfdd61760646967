//! Data nodes and the directory that tracks their reachability.
//!
//! A node holds one [`StoredPart`] per chunk it replicates. Banning a node
//! makes it unreachable for reads, writes and cell peers without dropping its
//! data, so unbanning restores whatever it still holds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::{ChunkId, Medium, NodeId};

/// One encoded record as persisted on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Length of the record before erasure encoding.
    pub original_len: u32,
    pub checksum: u32,
    pub bytes: Vec<u8>,
}

impl Fragment {
    pub fn new(original_len: usize, bytes: Vec<u8>) -> Self {
        Self {
            original_len: original_len as u32,
            checksum: crc32fast::hash(&bytes),
            bytes,
        }
    }

    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.bytes) == self.checksum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Writing,
    Sealed,
}

/// A node's copy of one chunk: a full replica, or erasure part `part_index`.
#[derive(Debug, Clone)]
pub struct StoredPart {
    pub part_index: usize,
    pub state: ReplicaState,
    pub fragments: Vec<Fragment>,
}

impl StoredPart {
    pub fn row_count(&self) -> u64 {
        self.fragments.len() as u64
    }

    pub fn is_intact(&self) -> bool {
        self.fragments.iter().all(Fragment::verify)
    }
}

pub struct DataNode {
    pub id: NodeId,
    pub address: String,
    pub medium: Medium,
    banned: AtomicBool,
    latency_ms: AtomicU64,
    blocks: DashMap<ChunkId, StoredPart>,
}

impl DataNode {
    fn new(id: NodeId, address: String, medium: Medium) -> Self {
        Self {
            id,
            address,
            medium,
            banned: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            blocks: DashMap::new(),
        }
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::SeqCst)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    /// Simulate one request round-trip. Returns `false` when the node is
    /// banned or would not answer within `timeout`.
    pub fn round_trip(&self, timeout: Duration) -> bool {
        if self.is_banned() {
            return false;
        }
        let latency = self.latency();
        if latency > timeout {
            return false;
        }
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        !self.is_banned()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn has_block(&self, chunk: ChunkId) -> bool {
        self.blocks.contains_key(&chunk)
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.blocks.iter().map(|e| *e.key()).collect()
    }

    pub(crate) fn put_block(&self, chunk: ChunkId, part: StoredPart) {
        self.blocks.insert(chunk, part);
    }

    pub(crate) fn remove_block(&self, chunk: ChunkId) -> Option<StoredPart> {
        self.blocks.remove(&chunk).map(|(_, p)| p)
    }

    pub(crate) fn read_block(&self, chunk: ChunkId) -> Option<StoredPart> {
        self.blocks.get(&chunk).map(|p| p.clone())
    }

    pub(crate) fn with_block_mut<R>(
        &self,
        chunk: ChunkId,
        f: impl FnOnce(&mut StoredPart) -> R,
    ) -> Option<R> {
        self.blocks.get_mut(&chunk).map(|mut p| f(&mut p))
    }

    /// Flip a byte of the first fragment of `chunk` (fault injection).
    pub fn corrupt_block(&self, chunk: ChunkId) -> bool {
        self.with_block_mut(chunk, |part| {
            if let Some(frag) = part.fragments.first_mut() {
                if let Some(b) = frag.bytes.first_mut() {
                    *b ^= 0xff;
                    return true;
                }
            }
            false
        })
        .unwrap_or(false)
    }
}

impl std::fmt::Debug for DataNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataNode")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("medium", &self.medium)
            .field("banned", &self.is_banned())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// Registry of data nodes, shared by the chunk layer and cell supervision.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: RwLock<Vec<Arc<DataNode>>>,
    next_id: AtomicU64,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: impl Into<String>, medium: Medium) -> TabulaResult<NodeId> {
        let address = address.into();
        let mut nodes = self.nodes.write();
        if nodes.iter().any(|n| n.address == address) {
            return Err(TabulaError::argument(format!("node {address} already registered")));
        }
        let id = NodeId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        tracing::info!(node = %id, address = %address, medium = %medium, "node registered");
        nodes.push(Arc::new(DataNode::new(id, address, medium)));
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<DataNode>> {
        self.nodes.read().iter().find(|n| n.id == id).cloned()
    }

    pub fn by_address(&self, address: &str) -> Option<Arc<DataNode>> {
        self.nodes.read().iter().find(|n| n.address == address).cloned()
    }

    pub fn all(&self) -> Vec<Arc<DataNode>> {
        self.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn is_reachable(&self, id: NodeId) -> bool {
        self.get(id).map_or(false, |n| !n.is_banned())
    }

    pub fn reachable(&self) -> Vec<Arc<DataNode>> {
        self.nodes
            .read()
            .iter()
            .filter(|n| !n.is_banned())
            .cloned()
            .collect()
    }

    pub fn set_banned(&self, address: &str, banned: bool) -> TabulaResult<()> {
        let node = self
            .by_address(address)
            .ok_or_else(|| TabulaError::not_found(format!("node {address}")))?;
        node.banned.store(banned, Ordering::SeqCst);
        tracing::info!(node = %node.id, address, banned, "node ban state changed");
        Ok(())
    }

    pub fn set_latency(&self, address: &str, latency: Duration) -> TabulaResult<()> {
        let node = self
            .by_address(address)
            .ok_or_else(|| TabulaError::not_found(format!("node {address}")))?;
        node.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_and_unban() {
        let dir = NodeDirectory::new();
        let a = dir.add_node("n1:9012", Medium::default()).unwrap();
        let b = dir.add_node("n2:9012", Medium::default()).unwrap();
        assert_ne!(a, b);
        assert!(dir.add_node("n1:9012", Medium::default()).is_err());

        dir.set_banned("n1:9012", true).unwrap();
        assert!(!dir.is_reachable(a));
        assert_eq!(dir.reachable().len(), 1);
        dir.set_banned("n1:9012", false).unwrap();
        assert!(dir.is_reachable(a));
        assert!(dir.set_banned("missing", true).is_err());
    }

    #[test]
    fn test_latency_beyond_timeout_fails_round_trip() {
        let dir = NodeDirectory::new();
        dir.add_node("n1", Medium::default()).unwrap();
        dir.set_latency("n1", Duration::from_millis(50)).unwrap();
        let node = dir.by_address("n1").unwrap();
        assert!(!node.round_trip(Duration::from_millis(10)));
        assert!(node.round_trip(Duration::from_millis(100)));
    }

    #[test]
    fn test_fragment_checksum() {
        let mut f = Fragment::new(3, vec![1, 2, 3]);
        assert!(f.verify());
        f.bytes[0] = 9;
        assert!(!f.verify());
    }
}
