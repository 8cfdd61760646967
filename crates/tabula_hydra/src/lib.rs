//! Replicated cells: a deterministic automaton hosted by a group of peers,
//! driven by a checksummed changelog with periodic snapshots.
//!
//! Peers live on data nodes from the shared [`tabula_chunk::NodeDirectory`];
//! banning a node stops its peer, and the cell supervisor elects new leaders
//! and revokes peers onto healthy nodes.

pub mod automaton;
pub mod cell;
pub mod changelog;
pub mod peer;
pub mod supervisor;

pub use automaton::Automaton;
pub use cell::{AutomatonFactory, Cell, CellHealth, CellMetricsSnapshot, PeerHandle, PeerInfo};
pub use changelog::{CellStore, ChangelogRecord, Snapshot};
pub use peer::PeerState;
pub use supervisor::{Supervised, Supervisor, SupervisorConfig, SupervisorHandle};
