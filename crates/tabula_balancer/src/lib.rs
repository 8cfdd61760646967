//! Tablet balancer: keeps tablet sizes inside configured bounds by resharding
//! and spreads load across tablet cells by moving tablets.
//!
//! Each iteration walks every bundle, parses its `tablet_balancer_config`,
//! groups tables by balancing group and plans actions from per-tablet
//! metrics. Planning is pure ([`planner`]); execution goes through a
//! [`BalancerContext`] supplied by the cluster.

pub mod action;
pub mod balancer;
pub mod config;
pub mod metric;
pub mod planner;

pub use action::{ActionRegistry, ActionState, TabletAction};
pub use balancer::{
    BalancerContext, BalancerMetricsSnapshot, BalancerRunner, BalancerRunnerHandle, BundleError,
    IterationReport, TabletBalancer,
};
pub use config::{BundleBalancerConfig, GroupConfig, TableBalancerConfig, DEFAULT_GROUP};
pub use metric::{Metric, MetricConfig, TabletMetrics, METRIC_VARIABLES};
pub use planner::{ActionKind, BundleInfo, TableInfo, TabletInfo};
