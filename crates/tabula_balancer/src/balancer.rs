//! The balancer loop: snapshot bundles, plan per group, execute, record.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use tabula_common::config::{BalancerConfig, ConfigHandle};
use tabula_common::shutdown::StopSignal;
use tabula_common::{TabulaError, TabulaResult};

use crate::action::{ActionRegistry, TabletAction};
use crate::config::{BundleBalancerConfig, GroupConfig};
use crate::metric::Metric;
use crate::planner::{move_candidates, plan_moves, plan_reshards, ActionKind, BundleInfo, TableInfo};

/// What the balancer needs from the cluster.
pub trait BalancerContext: Send + Sync {
    /// Snapshot of every bundle with its cells and tables.
    fn bundles(&self) -> TabulaResult<Vec<BundleInfo>>;
    fn execute(&self, action: &ActionKind) -> TabulaResult<()>;
}

/// A bundle whose config failed to parse; retried every iteration.
#[derive(Debug, Clone, Serialize)]
pub struct BundleError {
    pub bundle: String,
    pub error: String,
    #[serde(skip)]
    pub at: Instant,
}

#[derive(Debug, Default)]
struct BalancerMetrics {
    iterations: AtomicU64,
    reshards: AtomicU64,
    moves: AtomicU64,
    failed_actions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BalancerMetricsSnapshot {
    pub iterations: u64,
    pub reshards: u64,
    pub moves: u64,
    pub failed_actions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub bundles: usize,
    pub executed: usize,
    pub failed: usize,
}

pub struct TabletBalancer {
    config: ConfigHandle<BalancerConfig>,
    context: Arc<dyn BalancerContext>,
    actions: ActionRegistry,
    bundle_errors: Mutex<Vec<BundleError>>,
    last_iteration_start: Mutex<Option<SystemTime>>,
    running: AtomicBool,
    metrics: BalancerMetrics,
}

struct PlannedAction {
    group: String,
    kind: ActionKind,
}

impl TabletBalancer {
    pub fn new(config: ConfigHandle<BalancerConfig>, context: Arc<dyn BalancerContext>) -> Self {
        Self {
            config,
            context,
            actions: ActionRegistry::new(),
            bundle_errors: Mutex::new(Vec::new()),
            last_iteration_start: Mutex::new(None),
            running: AtomicBool::new(false),
            metrics: BalancerMetrics::default(),
        }
    }

    pub fn config(&self) -> &ConfigHandle<BalancerConfig> {
        &self.config
    }

    pub fn iteration_count(&self) -> u64 {
        self.metrics.iterations.load(Ordering::Relaxed)
    }

    pub fn last_iteration_start(&self) -> Option<SystemTime> {
        *self.last_iteration_start.lock()
    }

    pub fn actions(&self) -> Vec<TabletAction> {
        self.actions.list()
    }

    pub fn retryable_bundle_errors(&self) -> Vec<BundleError> {
        self.bundle_errors.lock().clone()
    }

    pub fn metrics(&self) -> BalancerMetricsSnapshot {
        BalancerMetricsSnapshot {
            iterations: self.metrics.iterations.load(Ordering::Relaxed),
            reshards: self.metrics.reshards.load(Ordering::Relaxed),
            moves: self.metrics.moves.load(Ordering::Relaxed),
            failed_actions: self.metrics.failed_actions.load(Ordering::Relaxed),
        }
    }

    /// Introspection tree: config, iteration state, errors and action log.
    pub fn orchid(&self) -> serde_json::Value {
        let last_start_ms = self
            .last_iteration_start()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        serde_json::json!({
            "config": &*self.config.get(),
            "iteration_count": self.iteration_count(),
            "last_iteration_start_time": last_start_ms,
            "retryable_bundle_errors": self.retryable_bundle_errors(),
            "tablet_actions": self.actions(),
        })
    }

    fn record_bundle_error(&self, bundle: &str, error: &TabulaError) {
        let mut errors = self.bundle_errors.lock();
        errors.retain(|e| e.bundle != bundle);
        errors.push(BundleError {
            bundle: bundle.to_string(),
            error: error.to_string(),
            at: Instant::now(),
        });
    }

    fn clear_bundle_error(&self, bundle: &str) {
        self.bundle_errors.lock().retain(|e| e.bundle != bundle);
    }

    /// One full pass over every bundle. Skipped when disabled or when
    /// another pass is already running.
    pub fn run_iteration(&self) -> IterationReport {
        let config = self.config.get();
        if !config.enable {
            return IterationReport::default();
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("balancer iteration already running");
            return IterationReport::default();
        }
        let report = self.iterate(&config);
        self.running.store(false, Ordering::Release);
        report
    }

    fn iterate(&self, config: &BalancerConfig) -> IterationReport {
        *self.last_iteration_start.lock() = Some(SystemTime::now());
        let started = Instant::now();
        let iteration = self.metrics.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        self.actions.expire(config.action_ttl());
        let errors_ttl = config.bundle_errors_ttl();
        self.bundle_errors.lock().retain(|e| e.at.elapsed() < errors_ttl);

        let bundles = match self.context.bundles() {
            Ok(bundles) => bundles,
            Err(e) => {
                tracing::warn!(error = %e, "balancer cannot list bundles");
                return IterationReport::default();
            }
        };

        let mut report = IterationReport::default();
        for bundle in &bundles {
            let parsed = match BundleBalancerConfig::parse(&bundle.config) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(bundle = %bundle.name, error = %e, "invalid tablet balancer config");
                    self.record_bundle_error(&bundle.name, &e);
                    continue;
                }
            };
            self.clear_bundle_error(&bundle.name);
            report.bundles += 1;
            for planned in self.plan_bundle(bundle, &parsed, config.pick_reshard_pivot_keys) {
                let id = self.actions.register(&bundle.name, &planned.group, planned.kind.clone());
                self.actions.start(id);
                match self.context.execute(&planned.kind) {
                    Ok(()) => {
                        report.executed += 1;
                        let counter = match planned.kind {
                            ActionKind::Reshard { .. } => &self.metrics.reshards,
                            ActionKind::Move { .. } => &self.metrics.moves,
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                        self.actions.finish(id, None);
                    }
                    Err(e) => {
                        report.failed += 1;
                        self.metrics.failed_actions.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            bundle = %bundle.name,
                            action = planned.kind.name(),
                            path = planned.kind.path(),
                            error = %e,
                            "balancer action failed"
                        );
                        self.actions.finish(id, Some(e.to_string()));
                    }
                }
            }
        }
        tracing::info!(
            iteration,
            bundles = report.bundles,
            executed = report.executed,
            failed = report.failed,
            "balancer iteration finished"
        );
        tabula_observability::record_balancer_iteration(
            report.executed,
            report.failed,
            started.elapsed().as_micros() as u64,
        );
        report
    }

    fn plan_bundle(&self, bundle: &BundleInfo, config: &BundleBalancerConfig, pick_pivots: bool) -> Vec<PlannedAction> {
        let mut groups: BTreeMap<&str, Vec<&TableInfo>> = BTreeMap::new();
        for table in bundle.tables.iter().filter(|t| t.mounted) {
            let group = table.config.group_name();
            if config.group(group).is_none() {
                tracing::debug!(bundle = %bundle.name, path = %table.path, group, "table refers to unknown group");
                continue;
            }
            groups.entry(group).or_default().push(table);
        }

        let mut planned = Vec::new();
        for (name, tables) in groups {
            let Some(group) = config.group(name) else {
                continue;
            };
            planned.extend(self.plan_group(bundle, config, name, group, &tables, pick_pivots));
        }
        planned
    }

    fn plan_group(
        &self,
        bundle: &BundleInfo,
        config: &BundleBalancerConfig,
        name: &str,
        group: &GroupConfig,
        tables: &[&TableInfo],
        pick_pivots: bool,
    ) -> Vec<PlannedAction> {
        let metric = match Metric::compile(&group.metric) {
            Ok(metric) => metric,
            Err(e) => {
                tracing::warn!(bundle = %bundle.name, group = name, error = %e, "cannot compile metric");
                return Vec::new();
            }
        };
        let mut budget = group
            .max_concurrent_actions
            .saturating_sub(self.actions.active_count(&bundle.name, name));
        let mut planned = Vec::new();
        let mut resharded = HashSet::new();

        if config.enable_reshard && group.enable_reshard {
            for table in tables.iter().filter(|t| t.config.reshard_enabled()) {
                if budget == 0 {
                    break;
                }
                let sizes = match table.config.effective_sizes(group) {
                    Ok(sizes) => sizes,
                    Err(e) => {
                        tracing::warn!(path = %table.path, error = %e, "invalid table balancer sizes");
                        continue;
                    }
                };
                let mut actions = plan_reshards(table, &metric, sizes, pick_pivots);
                actions.truncate(budget);
                if actions.is_empty() {
                    continue;
                }
                budget -= actions.len();
                resharded.insert(table.path.as_str());
                // Later ranges first so earlier tablet indexes stay valid.
                planned.extend(actions.into_iter().rev().map(|kind| PlannedAction {
                    group: name.to_string(),
                    kind,
                }));
            }
        }

        if config.enable_move && group.enable_move && budget > 0 {
            let candidates = tables
                .iter()
                .filter(|t| t.config.move_enabled() && !resharded.contains(t.path.as_str()))
                .flat_map(|t| move_candidates(t, &metric))
                .collect();
            let moves = plan_moves(candidates, &bundle.cells, group.move_deviation_threshold, budget);
            planned.extend(moves.into_iter().map(|kind| PlannedAction {
                group: name.to_string(),
                kind,
            }));
        }
        planned
    }
}

// ── Runner ───────────────────────────────────────────────────────────

/// Handle returned by [`BalancerRunner::start`]. Dropping it stops the runner.
pub struct BalancerRunnerHandle {
    signal: StopSignal,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl BalancerRunnerHandle {
    pub fn stop(&self) {
        self.signal.stop();
    }

    pub fn stop_and_join(mut self) {
        self.signal.stop();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.signal.is_stopped()
    }
}

impl Drop for BalancerRunnerHandle {
    fn drop(&mut self) {
        self.signal.stop();
    }
}

pub struct BalancerRunner;

impl BalancerRunner {
    /// Run iterations every `period` until stopped; the period is re-read
    /// from config before each wait.
    pub fn start(balancer: Arc<TabletBalancer>) -> TabulaResult<BalancerRunnerHandle> {
        let signal = StopSignal::new();
        let thread_signal = signal.clone();
        let join_handle = std::thread::Builder::new()
            .name("tabula-balancer".to_string())
            .spawn(move || {
                tracing::info!("tablet balancer started");
                while !thread_signal.wait_timeout(balancer.config().get().period()) {
                    balancer.run_iteration();
                }
                tracing::info!("tablet balancer stopped");
            })
            .map_err(|e| {
                tracing::error!(component = "balancer", error = %e, "failed to spawn balancer thread");
                TabulaError::internal(format!("failed to spawn balancer thread: {e}"))
            })?;
        Ok(BalancerRunnerHandle {
            signal,
            join_handle: Some(join_handle),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use tabula_common::{CellId, Key, TabletId};

    use crate::config::TableBalancerConfig;
    use crate::metric::TabletMetrics;
    use crate::planner::TabletInfo;

    use super::*;

    /// In-memory bundle: tablet sizes per table, reshards and moves applied
    /// to the snapshot as they execute.
    struct FakeContext {
        config: Mutex<serde_json::Value>,
        table_config: TableBalancerConfig,
        tablets: Mutex<Vec<(u64, CellId)>>,
        executed: Mutex<Vec<ActionKind>>,
    }

    impl FakeContext {
        fn new(config: serde_json::Value, table_config: TableBalancerConfig, tablets: Vec<(u64, CellId)>) -> Arc<Self> {
            Arc::new(Self {
                config: Mutex::new(config),
                table_config,
                tablets: Mutex::new(tablets),
                executed: Mutex::new(Vec::new()),
            })
        }
    }

    impl BalancerContext for FakeContext {
        fn bundles(&self) -> TabulaResult<Vec<BundleInfo>> {
            let tablets = self
                .tablets
                .lock()
                .iter()
                .enumerate()
                .map(|(i, (size, cell))| TabletInfo {
                    id: TabletId(i as u64),
                    cell: Some(*cell),
                    pivot_key: if i == 0 { Key::empty() } else { Key::from(vec![i as i64]) },
                    metrics: TabletMetrics {
                        uncompressed_data_size: *size,
                        ..Default::default()
                    },
                    sample_keys: Vec::new(),
                })
                .collect();
            Ok(vec![BundleInfo {
                name: "default".into(),
                cells: vec![CellId(1), CellId(2)],
                config: self.config.lock().clone(),
                tables: vec![TableInfo {
                    path: "//t".into(),
                    mounted: true,
                    config: self.table_config.clone(),
                    tablets,
                }],
            }])
        }

        fn execute(&self, action: &ActionKind) -> TabulaResult<()> {
            let mut tablets = self.tablets.lock();
            match action {
                ActionKind::Reshard {
                    first_tablet,
                    last_tablet,
                    tablet_count,
                    ..
                } => {
                    let merged: Vec<(u64, CellId)> = tablets.drain(*first_tablet..=*last_tablet).collect();
                    let total: u64 = merged.iter().map(|(s, _)| s).sum();
                    let cell = merged[0].1;
                    let piece = total / *tablet_count as u64;
                    for k in 0..*tablet_count {
                        tablets.insert(first_tablet + k, (piece, cell));
                    }
                }
                ActionKind::Move { tablet, cell, .. } => {
                    tablets[tablet.0 as usize].1 = *cell;
                }
            }
            self.executed.lock().push(action.clone());
            Ok(())
        }
    }

    fn balancer(context: Arc<FakeContext>) -> TabletBalancer {
        TabletBalancer::new(
            ConfigHandle::new(BalancerConfig {
                pick_reshard_pivot_keys: false,
                ..Default::default()
            }),
            context,
        )
    }

    fn sized_table() -> TableBalancerConfig {
        TableBalancerConfig {
            enable_auto_tablet_move: Some(false),
            min_tablet_size: Some(500),
            desired_tablet_size: Some(750),
            max_tablet_size: Some(1000),
            ..Default::default()
        }
    }

    #[test]
    fn test_concurrency_cap_limits_actions_per_iteration() {
        let context = FakeContext::new(
            json!({"groups": {"default": {"max_concurrent_actions": 1}}}),
            sized_table(),
            vec![(260, CellId(1)); 4],
        );
        let balancer = balancer(context.clone());
        assert_eq!(balancer.run_iteration().executed, 1);
        assert_eq!(context.tablets.lock().len(), 3);
        balancer.run_iteration();
        assert_eq!(context.tablets.lock().len(), 2);
        assert_eq!(balancer.run_iteration().executed, 0);
        assert_eq!(balancer.iteration_count(), 3);
        assert_eq!(balancer.metrics().reshards, 2);
    }

    #[test]
    fn test_uncapped_merges_execute_back_to_front() {
        let context = FakeContext::new(json!({}), sized_table(), vec![(260, CellId(1)); 4]);
        let balancer = balancer(context.clone());
        assert_eq!(balancer.run_iteration().executed, 2);
        let executed = context.executed.lock();
        assert!(matches!(executed[0], ActionKind::Reshard { first_tablet: 2, .. }));
        assert!(matches!(executed[1], ActionKind::Reshard { first_tablet: 0, .. }));
        assert_eq!(context.tablets.lock().len(), 2);
    }

    #[test]
    fn test_moves_even_out_cells() {
        let table = TableBalancerConfig {
            enable_auto_reshard: Some(false),
            ..Default::default()
        };
        let context = FakeContext::new(json!({}), table, vec![(100, CellId(1)); 4]);
        let balancer = balancer(context.clone());
        assert_eq!(balancer.run_iteration().executed, 2);
        let on_second = context.tablets.lock().iter().filter(|(_, c)| *c == CellId(2)).count();
        assert_eq!(on_second, 2);
        assert_eq!(balancer.run_iteration().executed, 0);
    }

    #[test]
    fn test_invalid_bundle_config_is_recorded_and_cleared() {
        let context = FakeContext::new(json!({"enable_everything": true}), sized_table(), vec![(260, CellId(1)); 4]);
        let balancer = balancer(context.clone());
        assert_eq!(balancer.run_iteration().bundles, 0);
        let errors = balancer.retryable_bundle_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].bundle, "default");

        *context.config.lock() = json!({});
        assert_eq!(balancer.run_iteration().bundles, 1);
        assert!(balancer.retryable_bundle_errors().is_empty());
    }

    #[test]
    fn test_unknown_group_is_skipped() {
        let table = TableBalancerConfig {
            group: Some("missing".into()),
            ..sized_table()
        };
        let context = FakeContext::new(json!({}), table, vec![(260, CellId(1)); 4]);
        let balancer = balancer(context.clone());
        assert_eq!(balancer.run_iteration().executed, 0);
        assert!(context.executed.lock().is_empty());
    }

    #[test]
    fn test_disabled_balancer_does_nothing() {
        let context = FakeContext::new(json!({}), sized_table(), vec![(260, CellId(1)); 4]);
        let balancer = balancer(context.clone());
        balancer.config().update(|c| c.enable = false);
        assert_eq!(balancer.run_iteration(), IterationReport::default());
        assert_eq!(balancer.iteration_count(), 0);
        assert!(balancer.last_iteration_start().is_none());
    }

    #[test]
    fn test_orchid_lists_actions() {
        let context = FakeContext::new(json!({}), sized_table(), vec![(260, CellId(1)); 4]);
        let balancer = balancer(context);
        balancer.run_iteration();
        let orchid = balancer.orchid();
        assert_eq!(orchid["iteration_count"], 1);
        assert_eq!(orchid["tablet_actions"].as_array().unwrap().len(), 2);
        assert_eq!(orchid["tablet_actions"][0]["state"], "completed");
        assert!(orchid["last_iteration_start_time"].is_u64());
    }

    #[test]
    fn test_runner_iterates_until_stopped() {
        let context = FakeContext::new(json!({}), sized_table(), vec![(260, CellId(1)); 4]);
        let balancer = Arc::new(balancer(context));
        balancer.config().update(|c| c.period_ms = 5);
        let handle = BalancerRunner::start(balancer.clone()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while balancer.iteration_count() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_running());
        handle.stop_and_join();
        assert!(balancer.iteration_count() >= 2);
    }
}
