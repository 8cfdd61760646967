use std::fmt;

use serde::{Deserialize, Serialize};

use tabula_common::error::{TabulaError, TabulaResult, ValidationError};
use tabula_common::{ChunkId, Key, Medium, NodeId};

use crate::erasure::ErasureCodec;
use crate::node::ReplicaState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Versioned rows of a dynamic table store.
    Table,
    /// Plain rows of a static table.
    Static,
    /// Opaque journal rows.
    Journal,
}

/// Replication parameters shared by chunk creation and journal attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationParams {
    pub replication_factor: usize,
    pub read_quorum: usize,
    pub write_quorum: usize,
    pub erasure_codec: ErasureCodec,
    pub medium: Medium,
}

impl Default for ReplicationParams {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            read_quorum: 2,
            write_quorum: 2,
            erasure_codec: ErasureCodec::None,
            medium: Medium::default(),
        }
    }
}

impl ReplicationParams {
    pub fn replicated(replication_factor: usize, read_quorum: usize, write_quorum: usize) -> Self {
        Self {
            replication_factor,
            read_quorum,
            write_quorum,
            ..Self::default()
        }
    }

    /// Erasure parameters where every part must be written.
    pub fn erasure(codec: ErasureCodec) -> Self {
        Self {
            replication_factor: 1,
            read_quorum: codec.total_parts() - codec.guaranteed_tolerated_losses(),
            write_quorum: codec.total_parts(),
            erasure_codec: codec,
            medium: Medium::default(),
        }
    }

    /// Number of stored replicas (or parts) a healthy chunk has.
    pub fn replica_count(&self) -> usize {
        if self.erasure_codec.is_erasure() {
            self.erasure_codec.total_parts()
        } else {
            self.replication_factor
        }
    }

    pub fn validate(&self) -> TabulaResult<()> {
        let fail = |msg: String| Err(TabulaError::Validation(ValidationError::Argument(msg)));
        let (rf, rq, wq) = (self.replication_factor, self.read_quorum, self.write_quorum);
        if rq == 0 || wq == 0 {
            return fail("quorums must be positive".into());
        }
        if self.erasure_codec.is_erasure() {
            let total = self.erasure_codec.total_parts();
            // Any read set must share a decodable subset with any write set.
            let decodable = total - self.erasure_codec.guaranteed_tolerated_losses();
            if rf != 1 {
                return fail(format!(
                    "replication_factor must be 1 with erasure codec {}, got {rf}",
                    self.erasure_codec
                ));
            }
            if rq > total || wq > total || rq + wq < total + decodable {
                return fail(format!(
                    "quorums rq={rq} wq={wq} are invalid for {} ({total} parts)",
                    self.erasure_codec
                ));
            }
        } else if rf == 0 || rq > rf || wq > rf || rq + wq <= rf {
            return fail(format!("quorums rf={rf} rq={rq} wq={wq} do not intersect"));
        }
        Ok(())
    }
}

/// Placement of one stored replica or erasure part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReplica {
    pub node: NodeId,
    pub part_index: usize,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Healthy,
    /// Readable, but some replicas or parts are unreachable.
    Underreplicated,
    QuorumMissing,
    Lost,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkStatus::Healthy => "healthy",
            ChunkStatus::Underreplicated => "underreplicated",
            ChunkStatus::QuorumMissing => "quorum_missing",
            ChunkStatus::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Master-side chunk record.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub id: ChunkId,
    pub kind: ChunkKind,
    pub params: ReplicationParams,
    pub stored_replicas: Vec<ChunkReplica>,
    pub sealed: bool,
    /// Final row count; meaningful once sealed.
    pub row_count: u64,
    pub data_size: u64,
    /// Smallest and largest key of a table chunk.
    pub boundary_keys: Option<(Key, Key)>,
    /// Writer closed but sealing has not succeeded yet.
    pub seal_requested: bool,
}

impl ChunkMeta {
    pub fn replica_on(&self, node: NodeId) -> Option<&ChunkReplica> {
        self.stored_replicas.iter().find(|r| r.node == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicated_quorum_validation() {
        assert!(ReplicationParams::replicated(3, 2, 2).validate().is_ok());
        assert!(ReplicationParams::replicated(1, 2, 2).validate().is_err());
        assert!(ReplicationParams::replicated(3, 4, 2).validate().is_err());
        assert!(ReplicationParams::replicated(3, 2, 4).validate().is_err());
        assert!(ReplicationParams::replicated(4, 2, 2).validate().is_err());
        assert!(ReplicationParams::replicated(1, 1, 1).validate().is_ok());
    }

    #[test]
    fn test_erasure_quorum_validation() {
        let mut p = ReplicationParams::erasure(ErasureCodec::IsaLrc12_2_2);
        p.read_quorum = 14;
        p.write_quorum = 15;
        assert!(p.validate().is_ok());

        for (rf, rq, wq) in [(2, 14, 15), (1, 17, 15), (1, 14, 17), (1, 14, 14)] {
            p.replication_factor = rf;
            p.read_quorum = rq;
            p.write_quorum = wq;
            assert!(p.validate().is_err(), "rf={rf} rq={rq} wq={wq}");
        }

        assert!(ReplicationParams::erasure(ErasureCodec::ReedSolomon6_3)
            .validate()
            .is_ok());
        let mut rs = ReplicationParams::erasure(ErasureCodec::ReedSolomon3_3);
        rs.read_quorum = 4;
        rs.write_quorum = 5;
        assert!(rs.validate().is_ok());
    }
}
