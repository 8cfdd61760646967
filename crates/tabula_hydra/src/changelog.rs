//! Cell persistence: the changelog of committed mutations and the snapshots
//! that let it be compacted.

use serde::de::DeserializeOwned;
use serde::Serialize;

use tabula_common::error::{TabulaError, TabulaResult};

#[derive(Debug, Clone)]
pub struct ChangelogRecord {
    pub index: u64,
    pub epoch: u64,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl ChangelogRecord {
    pub fn encode<M: Serialize>(index: u64, epoch: u64, mutation: &M) -> TabulaResult<Self> {
        let payload = bincode::serialize(mutation)?;
        Ok(Self {
            index,
            epoch,
            checksum: crc32fast::hash(&payload),
            payload,
        })
    }

    pub fn decode<M: DeserializeOwned>(&self) -> TabulaResult<M> {
        if crc32fast::hash(&self.payload) != self.checksum {
            return Err(TabulaError::internal(format!(
                "changelog record {} failed checksum",
                self.index
            )));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Last changelog index reflected in `data`.
    pub index: u64,
    pub checksum: u32,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(index: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            checksum: crc32fast::hash(&data),
            data,
        }
    }

    pub fn verify(&self) -> TabulaResult<&[u8]> {
        if crc32fast::hash(&self.data) != self.checksum {
            return Err(TabulaError::internal(format!(
                "snapshot at {} failed checksum",
                self.index
            )));
        }
        Ok(&self.data)
    }
}

/// Durable storage of one cell. Records older than the latest snapshot are
/// dropped on compaction.
#[derive(Debug, Default)]
pub struct CellStore {
    records: Vec<ChangelogRecord>,
    snapshots: Vec<Snapshot>,
    last_index: u64,
}

impl CellStore {
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn append(&mut self, record: ChangelogRecord) {
        self.last_index = record.index;
        self.records.push(record);
    }

    /// Records with index greater than `index`.
    pub fn records_after(&self, index: u64) -> &[ChangelogRecord] {
        let start = self.records.partition_point(|r| r.index <= index);
        &self.records[start..]
    }

    /// Lowest index a peer can resume from without a snapshot.
    pub fn first_replayable_index(&self) -> u64 {
        self.records.first().map_or(self.last_index + 1, |r| r.index)
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) {
        let index = snapshot.index;
        self.snapshots.push(snapshot);
        self.records.retain(|r| r.index > index);
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Forget everything; used when the cell is torn down.
    pub fn clear(&mut self) {
        self.records.clear();
        self.snapshots.clear();
        self.last_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_checksum() {
        let mut record = ChangelogRecord::encode(1, 1, &("insert".to_string(), 42u64)).unwrap();
        let decoded: (String, u64) = record.decode().unwrap();
        assert_eq!(decoded, ("insert".to_string(), 42));
        record.payload[0] ^= 1;
        assert!(record.decode::<(String, u64)>().is_err());
    }

    #[test]
    fn test_snapshot_compacts_changelog() {
        let mut store = CellStore::default();
        for i in 1..=5u64 {
            store.append(ChangelogRecord::encode(i, 1, &i).unwrap());
        }
        assert_eq!(store.records_after(3).len(), 2);
        store.add_snapshot(Snapshot::new(3, vec![1, 2, 3]));
        assert_eq!(store.record_count(), 2);
        assert_eq!(store.first_replayable_index(), 4);
        assert_eq!(store.last_index(), 5);
        assert_eq!(store.latest_snapshot().unwrap().verify().unwrap(), &[1, 2, 3]);
    }
}
