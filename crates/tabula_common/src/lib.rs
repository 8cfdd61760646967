//! Shared vocabulary of the tabula storage engine: identifiers, typed values
//! and keys, table schemas with computed/aggregate columns, the expression
//! language, the error taxonomy, configuration and access control.

pub mod config;
pub mod datum;
pub mod error;
pub mod expression;
pub mod schema;
pub mod security;
pub mod shutdown;
pub mod types;

pub use datum::{Key, NamedRow, Value};
pub use error::{ErrorKind, TabulaError, TabulaResult};
pub use types::{
    ActionId, Atomicity, CellId, ChunkId, InMemoryMode, JournalId, Medium, NodeId, OptimizedFor,
    ReadFrom, StoreId, TableId, TabletId, Timestamp, TxnId,
};
