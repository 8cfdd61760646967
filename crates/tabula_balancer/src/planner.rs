//! Pure planning: given tablet metrics, propose reshard and move actions.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use tabula_common::{CellId, Key, TabletId};

use crate::config::TableBalancerConfig;
use crate::metric::{Metric, TabletMetrics};

// ── Inputs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TabletInfo {
    pub id: TabletId,
    pub cell: Option<CellId>,
    pub pivot_key: Key,
    pub metrics: TabletMetrics,
    /// Sorted sample of the tablet's keys; split pivots are picked from it.
    pub sample_keys: Vec<Key>,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub path: String,
    pub mounted: bool,
    pub config: TableBalancerConfig,
    pub tablets: Vec<TabletInfo>,
}

#[derive(Debug, Clone)]
pub struct BundleInfo {
    pub name: String,
    pub cells: Vec<CellId>,
    /// Raw `tablet_balancer_config`; parsed on every iteration.
    pub config: serde_json::Value,
    pub tables: Vec<TableInfo>,
}

// ── Actions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Replace tablets `first_tablet..=last_tablet` with `tablet_count`
    /// tablets. Without explicit pivots the executor picks them.
    Reshard {
        path: String,
        first_tablet: usize,
        last_tablet: usize,
        pivot_keys: Option<Vec<Key>>,
        tablet_count: usize,
    },
    Move {
        path: String,
        tablet: TabletId,
        cell: CellId,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Reshard { .. } => "reshard",
            ActionKind::Move { .. } => "move",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ActionKind::Reshard { path, .. } | ActionKind::Move { path, .. } => path,
        }
    }
}

fn tablet_sizes(table: &TableInfo, metric: &Metric) -> Vec<f64> {
    table
        .tablets
        .iter()
        .map(|t| match metric.evaluate(&t.metrics) {
            Ok(v) => v.max(0.0),
            Err(e) => {
                tracing::warn!(path = %table.path, tablet = %t.id, error = %e, "metric evaluation failed");
                0.0
            }
        })
        .collect()
}

/// Evenly spaced keys from the tablet's sample, strictly above its pivot.
fn pick_pivot_keys(tablet: &TabletInfo, pieces: usize) -> Vec<Key> {
    let sample = &tablet.sample_keys;
    let mut pivots = vec![tablet.pivot_key.clone()];
    for k in 1..pieces {
        let Some(key) = sample.get(k * sample.len() / pieces) else {
            continue;
        };
        if pivots.last().map_or(true, |last| key > last) {
            pivots.push(key.clone());
        }
    }
    pivots
}

// ── Reshard ──────────────────────────────────────────────────────────

/// Split tablets above `max` into pieces of about `desired`; merge runs of
/// adjacent tablets starting below `min` as long as the result stays within
/// `desired`. Actions come out ordered by first tablet index.
pub fn plan_reshards(
    table: &TableInfo,
    metric: &Metric,
    (min, desired, max): (u64, u64, u64),
    pick_pivots: bool,
) -> Vec<ActionKind> {
    let sizes = tablet_sizes(table, metric);
    let (min, desired, max) = (min as f64, desired.max(1) as f64, max as f64);
    let n = sizes.len();
    let mut actions = Vec::new();
    // First index not yet claimed by an action.
    let mut free = 0;
    let mut i = 0;
    while i < n {
        let size = sizes[i];
        if size > max {
            let pieces = ((size / desired).ceil() as usize).max(2);
            let pivot_keys = if pick_pivots {
                let keys = pick_pivot_keys(&table.tablets[i], pieces);
                if keys.len() < 2 {
                    i += 1;
                    continue;
                }
                Some(keys)
            } else {
                None
            };
            let tablet_count = pivot_keys.as_ref().map_or(pieces, Vec::len);
            actions.push(ActionKind::Reshard {
                path: table.path.clone(),
                first_tablet: i,
                last_tablet: i,
                pivot_keys,
                tablet_count,
            });
            i += 1;
            free = i;
            continue;
        }
        if size < min && n > 1 {
            let mut total = size;
            let mut last = i;
            while last + 1 < n && sizes[last + 1] <= max && total + sizes[last + 1] <= desired {
                total += sizes[last + 1];
                last += 1;
            }
            let mut first = i;
            if last == i && i > free && i > 0 && sizes[i - 1] + size <= desired {
                first = i - 1;
            }
            if last > first {
                actions.push(ActionKind::Reshard {
                    path: table.path.clone(),
                    first_tablet: first,
                    last_tablet: last,
                    pivot_keys: Some(vec![table.tablets[first].pivot_key.clone()]),
                    tablet_count: 1,
                });
                i = last + 1;
                free = i;
                continue;
            }
        }
        i += 1;
    }
    actions
}

// ── Move ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MoveCandidate {
    pub path: String,
    pub tablet: TabletId,
    pub cell: CellId,
    pub load: f64,
}

pub fn move_candidates(table: &TableInfo, metric: &Metric) -> Vec<MoveCandidate> {
    tablet_sizes(table, metric)
        .into_iter()
        .zip(&table.tablets)
        .filter_map(|(load, t)| {
            Some(MoveCandidate {
                path: table.path.clone(),
                tablet: t.id,
                cell: t.cell?,
                load,
            })
        })
        .collect()
}

fn extreme(loads: &BTreeMap<CellId, f64>, highest: bool) -> Option<(CellId, f64)> {
    let cmp = |a: &(&CellId, &f64), b: &(&CellId, &f64)| a.1.total_cmp(b.1).then(b.0.cmp(a.0));
    let found = if highest {
        loads.iter().max_by(cmp)
    } else {
        loads.iter().min_by(cmp)
    };
    found.map(|(c, l)| (*c, *l))
}

/// Move tablets from the most to the least loaded cell while the spread
/// relative to the mean exceeds `threshold`. Every move strictly shrinks the
/// gap between the two cells involved; each tablet moves at most once.
pub fn plan_moves(
    mut candidates: Vec<MoveCandidate>,
    cells: &[CellId],
    threshold: f64,
    limit: usize,
) -> Vec<ActionKind> {
    let mut loads: BTreeMap<CellId, f64> = cells.iter().map(|c| (*c, 0.0)).collect();
    candidates.retain(|c| loads.contains_key(&c.cell));
    for c in &candidates {
        if let Some(load) = loads.get_mut(&c.cell) {
            *load += c.load;
        }
    }
    let total: f64 = loads.values().sum();
    let mean = total / loads.len().max(1) as f64;
    let mut moved = HashSet::new();
    let mut actions = Vec::new();
    while actions.len() < limit && mean > 0.0 {
        let (Some((hi_cell, hi)), Some((lo_cell, lo))) = (extreme(&loads, true), extreme(&loads, false)) else {
            break;
        };
        let gap = hi - lo;
        if hi_cell == lo_cell || gap / mean <= threshold {
            break;
        }
        let best = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.cell == hi_cell && c.load > 0.0 && c.load < gap && !moved.contains(&c.tablet))
            .min_by(|(_, a), (_, b)| (gap - 2.0 * a.load).abs().total_cmp(&(gap - 2.0 * b.load).abs()))
            .map(|(i, _)| i);
        let Some(index) = best else {
            break;
        };
        let candidate = &mut candidates[index];
        moved.insert(candidate.tablet);
        *loads.entry(hi_cell).or_default() -= candidate.load;
        *loads.entry(lo_cell).or_default() += candidate.load;
        candidate.cell = lo_cell;
        actions.push(ActionKind::Move {
            path: candidate.path.clone(),
            tablet: candidate.tablet,
            cell: lo_cell,
        });
    }
    actions
}

#[cfg(test)]
mod tests {
    use crate::metric::MetricConfig;

    use super::*;

    fn table(sizes: &[u64]) -> TableInfo {
        TableInfo {
            path: "//t".into(),
            mounted: true,
            config: TableBalancerConfig::default(),
            tablets: sizes
                .iter()
                .enumerate()
                .map(|(i, size)| TabletInfo {
                    id: TabletId(i as u64 + 1),
                    cell: Some(CellId(1)),
                    pivot_key: if i == 0 { Key::empty() } else { Key::from(vec![i as i64]) },
                    metrics: TabletMetrics {
                        uncompressed_data_size: *size,
                        ..Default::default()
                    },
                    sample_keys: (0..10).map(|k| Key::from(vec![i as i64 * 100 + k])).collect(),
                })
                .collect(),
        }
    }

    fn data_size() -> Metric {
        Metric::compile(&MetricConfig::DataSize).unwrap()
    }

    fn ranges(actions: &[ActionKind]) -> Vec<(usize, usize, usize)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ActionKind::Reshard {
                    first_tablet,
                    last_tablet,
                    tablet_count,
                    ..
                } => Some((*first_tablet, *last_tablet, *tablet_count)),
                ActionKind::Move { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_small_tablets_merge_pairwise_within_desired() {
        let t = table(&[260, 260, 260, 260]);
        let actions = plan_reshards(&t, &data_size(), (500, 750, 1000), false);
        assert_eq!(ranges(&actions), vec![(0, 1, 1), (2, 3, 1)]);
        // A merged tablet is above min and is left alone.
        let t = table(&[520, 260, 260]);
        let actions = plan_reshards(&t, &data_size(), (500, 750, 1000), false);
        assert_eq!(ranges(&actions), vec![(1, 2, 1)]);
        let t = table(&[520, 520]);
        assert!(plan_reshards(&t, &data_size(), (500, 750, 1000), false).is_empty());
    }

    #[test]
    fn test_last_small_tablet_merges_left() {
        let t = table(&[600, 100]);
        let actions = plan_reshards(&t, &data_size(), (200, 750, 1000), false);
        assert_eq!(ranges(&actions), vec![(0, 1, 1)]);
    }

    #[test]
    fn test_large_tablet_splits() {
        let t = table(&[2500]);
        let actions = plan_reshards(&t, &data_size(), (100, 1000, 2000), false);
        assert_eq!(ranges(&actions), vec![(0, 0, 3)]);

        let actions = plan_reshards(&t, &data_size(), (100, 1000, 2000), true);
        let ActionKind::Reshard { pivot_keys: Some(pivots), .. } = &actions[0] else {
            panic!("expected picked pivots");
        };
        assert_eq!(pivots[0], Key::empty());
        assert_eq!(pivots.len(), 3);
        assert!(pivots.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_split_pieces_do_not_qualify_for_merge() {
        let t = table(&[2001]);
        let actions = plan_reshards(&t, &data_size(), (500, 1000, 2000), false);
        let (_, _, pieces) = ranges(&actions)[0];
        assert!(2001.0 / pieces as f64 >= 500.0);
    }

    #[test]
    fn test_moves_balance_cells() {
        let candidates: Vec<MoveCandidate> = (0..4)
            .map(|i| MoveCandidate {
                path: "//t".into(),
                tablet: TabletId(i),
                cell: CellId(1),
                load: 100.0,
            })
            .collect();
        let actions = plan_moves(candidates.clone(), &[CellId(1), CellId(2)], 0.1, 10);
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|a| matches!(a, ActionKind::Move { cell, .. } if *cell == CellId(2))));

        assert_eq!(plan_moves(candidates.clone(), &[CellId(1), CellId(2)], 0.1, 1).len(), 1);
        // A single tablet cannot reduce the spread.
        assert!(plan_moves(candidates[..1].to_vec(), &[CellId(1), CellId(2)], 0.1, 10).is_empty());
    }

    #[test]
    fn test_moves_are_stable_once_balanced() {
        let candidates = vec![
            MoveCandidate { path: "//t".into(), tablet: TabletId(1), cell: CellId(1), load: 100.0 },
            MoveCandidate { path: "//t".into(), tablet: TabletId(2), cell: CellId(2), load: 90.0 },
        ];
        assert!(plan_moves(candidates, &[CellId(1), CellId(2)], 0.2, 10).is_empty());
    }
}
