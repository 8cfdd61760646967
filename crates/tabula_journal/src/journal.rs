//! One journal: an ordered sequence of chunks, the last of which may still be
//! open for appends.

use serde::{Deserialize, Serialize};

use tabula_chunk::ReplicationParams;
use tabula_common::config::JournalConfig;
use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::{ChunkId, JournalId};

/// Attributes a journal is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalAttributes {
    pub params: ReplicationParams,
    /// Journals store rows as written; any codec here is rejected.
    pub compression_codec: Option<String>,
}

impl JournalAttributes {
    pub fn validate(&self) -> TabulaResult<()> {
        if let Some(codec) = &self.compression_codec {
            return Err(TabulaError::argument(format!(
                "compression_codec {codec:?} is not supported for journals"
            )));
        }
        self.params.validate()
    }
}

/// Per-write knobs. Unset bounds fall back to [`JournalConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalWriterOptions {
    pub max_chunk_row_count: Option<usize>,
    pub max_chunk_data_size: Option<usize>,
    /// Keep the last chunk open after the write; the journal stays unsealed
    /// until a later write closes it.
    pub dont_close: bool,
}

impl JournalWriterOptions {
    pub fn with_max_chunk_row_count(mut self, rows: usize) -> Self {
        self.max_chunk_row_count = Some(rows);
        self
    }

    pub fn dont_close(mut self) -> Self {
        self.dont_close = true;
        self
    }

    /// Effective (rows, bytes) bounds of one chunk.
    pub(crate) fn bounds(&self, config: &JournalConfig) -> (usize, usize) {
        (
            self.max_chunk_row_count
                .unwrap_or(config.max_chunk_row_count)
                .max(1),
            self.max_chunk_data_size
                .unwrap_or(config.max_chunk_data_size)
                .max(1),
        )
    }
}

/// The chunk currently accepting appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenChunk {
    pub id: ChunkId,
    pub rows: usize,
    pub bytes: usize,
}

impl OpenChunk {
    pub fn new(id: ChunkId) -> Self {
        Self { id, rows: 0, bytes: 0 }
    }

    pub fn is_full(&self, max_rows: usize, max_bytes: usize) -> bool {
        self.rows >= max_rows || self.bytes >= max_bytes
    }

    /// How many of `records` go into this chunk before it fills up. Always at
    /// least one for a chunk that is not full.
    pub fn fitting(&self, records: &[Vec<u8>], max_rows: usize, max_bytes: usize) -> usize {
        let mut bytes = self.bytes;
        let mut take = 0;
        while take < records.len() && self.rows + take < max_rows && bytes < max_bytes {
            bytes += records[take].len();
            take += 1;
        }
        take
    }
}

#[derive(Debug)]
pub struct Journal {
    pub id: JournalId,
    pub path: String,
    pub attributes: JournalAttributes,
    pub(crate) chunks: Vec<ChunkId>,
    pub(crate) open: Option<OpenChunk>,
}

impl Journal {
    pub(crate) fn new(id: JournalId, path: String, attributes: JournalAttributes) -> Self {
        Self {
            id,
            path,
            attributes,
            chunks: Vec::new(),
            open: None,
        }
    }

    pub fn chunk_ids(&self) -> &[ChunkId] {
        &self.chunks
    }

    pub fn has_open_writer(&self) -> bool {
        self.open.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_bounds_fall_back_to_config() {
        let config = JournalConfig {
            max_chunk_row_count: 100,
            max_chunk_data_size: 1000,
        };
        assert_eq!(JournalWriterOptions::default().bounds(&config), (100, 1000));
        let options = JournalWriterOptions::default().with_max_chunk_row_count(0);
        assert_eq!(options.bounds(&config), (1, 1000));
    }

    #[test]
    fn test_open_chunk_fitting() {
        let records = vec![vec![0u8; 10]; 5];
        let mut open = OpenChunk::new(ChunkId(1));
        assert_eq!(open.fitting(&records, 3, 1000), 3);
        assert_eq!(open.fitting(&records, 100, 25), 3);
        open.rows = 2;
        open.bytes = 20;
        assert_eq!(open.fitting(&records, 3, 1000), 1);
        assert!(!open.is_full(3, 1000));
        open.rows = 3;
        assert!(open.is_full(3, 1000));
    }

    #[test]
    fn test_compression_codec_is_rejected() {
        let attributes = JournalAttributes {
            compression_codec: Some("lz4".into()),
            ..Default::default()
        };
        assert!(attributes.validate().is_err());
        assert!(JournalAttributes::default().validate().is_ok());
    }
}
