//! Tablet balancer wiring: bundle snapshots built from cluster state, and
//! balancer actions executed as cluster operations.

use std::sync::Arc;

use tabula_balancer::{ActionKind, BalancerContext, BundleInfo, TableInfo, TabletBalancer, TabletInfo, TabletMetrics};
use tabula_common::config::ConfigHandle;
use tabula_common::error::TabulaResult;
use tabula_common::security::ROOT_USER;
use tabula_common::{Key, Timestamp};
use tabula_tablet::{TabletState, TabletStatistics};

use crate::cluster::{Cluster, ClusterState};
use crate::options::{ReshardOptions, TabletRange};
use crate::table::TableRecord;

const MAX_SAMPLE_KEYS: usize = 1000;

pub struct ClusterBalancerContext {
    cluster: Arc<Cluster>,
}

impl ClusterBalancerContext {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }
}

/// A balancer driving `cluster` with the configured balancer settings.
pub fn tablet_balancer(cluster: &Arc<Cluster>) -> TabletBalancer {
    TabletBalancer::new(
        ConfigHandle::new(cluster.config().balancer.clone()),
        Arc::new(ClusterBalancerContext::new(cluster.clone())),
    )
}

fn tablet_infos(state: &ClusterState, table: &TableRecord) -> Vec<TabletInfo> {
    let width = table.schema.key_column_count();
    table
        .tablets
        .iter()
        .map(|record| {
            let hosted = record.cell.and_then(|cell| state.cells.get(&cell));
            let (statistics, sample_keys) = hosted
                .and_then(|host| {
                    host.cell()
                        .with_leader(|slot| {
                            let tablet = slot.tablet(record.id)?;
                            let (rows, _) = tablet.scan(Timestamp::MAX, None, slot.chunks())?;
                            let step = rows.len().div_ceil(MAX_SAMPLE_KEYS).max(1);
                            let keys: Vec<Key> = rows
                                .iter()
                                .step_by(step)
                                .map(|values| Key::new(values[..width.min(values.len())].to_vec()))
                                .collect();
                            TabulaResult::Ok((tablet.statistics(), keys))
                        })
                        .ok()?
                        .ok()
                })
                .unwrap_or_else(|| (TabletStatistics::default(), Vec::new()));
            let counters = record.counters.snapshot();
            TabletInfo {
                id: record.id,
                cell: record.cell,
                pivot_key: record.pivot_key.clone(),
                metrics: TabletMetrics {
                    uncompressed_data_size: statistics.uncompressed_data_size,
                    unmerged_row_count: statistics.unmerged_row_count,
                    dynamic_row_write_count: counters.dynamic_row_write_count,
                    dynamic_row_read_count: counters.dynamic_row_read_count,
                    dynamic_row_lookup_count: counters.dynamic_row_lookup_count,
                    static_chunk_row_read_count: counters.static_chunk_row_read_count,
                    static_chunk_row_lookup_count: counters.static_chunk_row_lookup_count,
                },
                sample_keys,
            }
        })
        .collect()
}

impl Cluster {
    /// Bundles with their cells and dynamic tables, as the balancer sees them.
    pub fn balancer_snapshot(&self) -> Vec<BundleInfo> {
        let state = self.state.read();
        state
            .bundles
            .iter()
            .map(|(name, bundle)| BundleInfo {
                name: name.clone(),
                cells: state
                    .cells
                    .iter()
                    .filter(|(_, host)| host.cell().bundle() == name)
                    .map(|(id, _)| *id)
                    .collect(),
                config: bundle.balancer_config.clone(),
                tables: state
                    .tables
                    .values()
                    .filter(|t| t.dynamic && t.bundle == *name)
                    .map(|table| TableInfo {
                        path: table.path.clone(),
                        mounted: !table.tablets.is_empty() && table.all_in_state(TabletState::Mounted),
                        config: table.attributes.tablet_balancer_config.clone(),
                        tablets: tablet_infos(&state, table),
                    })
                    .collect(),
            })
            .collect()
    }
}

impl BalancerContext for ClusterBalancerContext {
    fn bundles(&self) -> TabulaResult<Vec<BundleInfo>> {
        Ok(self.cluster.balancer_snapshot())
    }

    fn execute(&self, action: &ActionKind) -> TabulaResult<()> {
        match action {
            ActionKind::Reshard {
                path,
                first_tablet,
                last_tablet,
                pivot_keys,
                tablet_count,
            } => {
                let options = ReshardOptions {
                    range: TabletRange::new(*first_tablet, *last_tablet),
                    pivot_keys: pivot_keys.clone(),
                    tablet_count: if pivot_keys.is_some() { None } else { Some(*tablet_count) },
                    enable_slicing: true,
                };
                self.cluster.reshard_table(ROOT_USER, path, &options)
            }
            ActionKind::Move { path, tablet, cell } => self.cluster.move_tablet(ROOT_USER, path, *tablet, *cell),
        }
    }
}
