//! Cluster facade of the tabula storage engine.
//!
//! A [`Cluster`] owns the data nodes, the chunk layer, the tablet cells and
//! every table and journal. All user operations go through it: table
//! lifecycle (create, mount, freeze, reshard, alter), row reads and writes,
//! transactions with snapshot locks, journals, cells and bundles. The
//! [`ClusterBalancerContext`] plugs the cluster into the tablet balancer.

pub mod balancing;
pub mod cluster;
pub mod journals;
pub mod options;
pub mod reader;
pub mod rows;
pub mod table;
pub mod tables;
pub mod transaction;

pub use balancing::{tablet_balancer, ClusterBalancerContext};
pub use cluster::{Cluster, TickReport, DEFAULT_BUNDLE};
pub use options::{
    MountOptions, ReadOptions, ReshardOptions, SelectQuery, TableAttributes, TableOptions, TabletRange,
    WriteOptions,
};
pub use table::{PerformanceCounters, TabletInfo};
pub use transaction::LockMode;
