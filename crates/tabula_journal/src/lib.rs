//! Journal engine: append-only row sequences stored in quorum-replicated
//! chunks. Writers rotate chunks at row/byte bounds; a journal is sealed once
//! no writer is open and every chunk is sealed, and only sealed journals can
//! be truncated.

pub mod journal;
pub mod manager;

pub use journal::{Journal, JournalAttributes, JournalWriterOptions};
pub use manager::{JournalManager, JournalMetricsSnapshot};
