//! Chunk & replica layer: data nodes, erasure coding, quorum-replicated
//! chunks with sealing and repair, and the ref-counted chunk tree that tables
//! and snapshot holders share.

pub mod chunk;
pub mod chunk_tree;
pub mod erasure;
pub mod manager;
pub mod node;

pub use chunk::{ChunkKind, ChunkMeta, ChunkReplica, ChunkStatus, ReplicationParams};
pub use chunk_tree::{ChunkListId, ChunkTree, ChunkTreeChild};
pub use erasure::ErasureCodec;
pub use manager::{ChunkManager, ChunkMetricsSnapshot, ChunkStore, RepairOutcome};
pub use node::{DataNode, NodeDirectory, ReplicaState};
