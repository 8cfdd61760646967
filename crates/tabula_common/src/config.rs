use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{TabulaError, TabulaResult, ValidationError};
use crate::security::Permission;

/// Top-level configuration, loaded from `tabula.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TabulaConfig {
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub tablet_manager: TabletManagerConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub tablet: TabletConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl TabulaConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> TabulaResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> TabulaResult<Self> {
        let config: TabulaConfig =
            toml::from_str(text).map_err(|e| ValidationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TabulaResult<()> {
        let fail = |msg: String| Err(TabulaError::Validation(ValidationError::Config(msg)));
        if self.tablet_manager.peer_count == 0 {
            return fail("tablet_manager.peer_count must be positive".into());
        }
        if self.cluster.node_count < self.tablet_manager.peer_count {
            return fail(format!(
                "cluster.node_count {} is smaller than tablet_manager.peer_count {}",
                self.cluster.node_count, self.tablet_manager.peer_count
            ));
        }
        let c = &self.chunk;
        if c.read_quorum > c.replication_factor
            || c.write_quorum > c.replication_factor
            || c.read_quorum + c.write_quorum <= c.replication_factor
        {
            return fail(format!(
                "chunk quorums rf={} rq={} wq={} do not intersect",
                c.replication_factor, c.read_quorum, c.write_quorum
            ));
        }
        if self.tablet.max_dynamic_store_row_count == 0 {
            return fail("tablet.max_dynamic_store_row_count must be positive".into());
        }
        if self.journal.max_chunk_row_count == 0 {
            return fail("journal.max_chunk_row_count must be positive".into());
        }
        if self.balancer.period_ms == 0 {
            return fail("balancer.period_ms must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Number of data nodes started by the server.
    pub node_count: usize,
    /// Cells created in the default bundle at startup.
    pub cell_count: usize,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            node_count: 5,
            cell_count: 1,
        }
    }
}

/// Cell supervision parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletManagerConfig {
    /// Peers per newly created cell.
    pub peer_count: usize,
    /// How long a leader may stay unreachable before re-election.
    pub leader_reassignment_timeout_ms: u64,
    /// How long a peer may stay unreachable before it is moved to another node.
    pub peer_revocation_timeout_ms: u64,
    /// Supervisor tick interval.
    pub supervisor_interval_ms: u64,
}

impl Default for TabletManagerConfig {
    fn default() -> Self {
        Self {
            peer_count: 1,
            leader_reassignment_timeout_ms: 5_000,
            peer_revocation_timeout_ms: 10_000,
            supervisor_interval_ms: 500,
        }
    }
}

impl TabletManagerConfig {
    pub fn leader_reassignment_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_reassignment_timeout_ms)
    }

    pub fn peer_revocation_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_revocation_timeout_ms)
    }
}

/// Defaults for table chunks and replica reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub replication_factor: usize,
    pub read_quorum: usize,
    pub write_quorum: usize,
    /// Upper bound on a single replica round-trip.
    pub operation_timeout_ms: u64,
    /// Delay before a backup request races the primary read (0 = disabled).
    pub backup_request_delay_ms: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            read_quorum: 2,
            write_quorum: 2,
            operation_timeout_ms: 5_000,
            backup_request_delay_ms: 0,
        }
    }
}

impl ChunkConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Defaults applied to tablets unless the table overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletConfig {
    /// Key count at which the active dynamic store is rotated.
    pub max_dynamic_store_row_count: usize,
    /// Approximate byte size at which the active dynamic store is rotated.
    pub max_dynamic_store_byte_size: usize,
    /// Rows per partition before compaction splits it.
    pub max_partition_row_count: usize,
    /// Static stores per partition that trigger compaction.
    pub max_partition_store_count: usize,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            max_dynamic_store_row_count: 1_000_000,
            max_dynamic_store_byte_size: 64 * 1024 * 1024,
            max_partition_row_count: 1_000_000,
            max_partition_store_count: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub max_chunk_row_count: usize,
    pub max_chunk_data_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_chunk_row_count: 1_000_000,
            max_chunk_data_size: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Permissions granted to every user when no ACL entry matches.
    pub default_permissions: Vec<Permission>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_permissions: vec![Permission::Read, Permission::Write],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub enable: bool,
    /// Interval between balancer iterations.
    pub period_ms: u64,
    /// How long a retryable bundle error stays listed.
    pub bundle_errors_ttl_ms: u64,
    /// How long finished tablet actions stay in the action log.
    pub action_ttl_ms: u64,
    /// Pick split pivots from sampled keys instead of splitting by count.
    pub pick_reshard_pivot_keys: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            period_ms: 60_000,
            bundle_errors_ttl_ms: 60_000,
            action_ttl_ms: 60_000,
            pick_reshard_pivot_keys: true,
        }
    }
}

impl BalancerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn bundle_errors_ttl(&self) -> Duration {
        Duration::from_millis(self.bundle_errors_ttl_ms)
    }

    pub fn action_ttl(&self) -> Duration {
        Duration::from_millis(self.action_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Prometheus exporter address; empty disables the exporter.
    pub metrics_listen_addr: String,
}

// ── Versioned runtime configuration ───────────────────────────────────

#[derive(Debug)]
struct Versioned<T> {
    version: u64,
    value: Arc<T>,
}

/// Shared handle to runtime-mutable configuration. Every update bumps the
/// version so consumers can cheaply detect changes.
#[derive(Debug)]
pub struct ConfigHandle<T> {
    inner: Arc<RwLock<Versioned<T>>>,
}

impl<T> Clone for ConfigHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> ConfigHandle<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 1,
                value: Arc::new(value),
            })),
        }
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner.read().value)
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Current value and its version, read atomically.
    pub fn snapshot(&self) -> (u64, Arc<T>) {
        let guard = self.inner.read();
        (guard.version, Arc::clone(&guard.value))
    }

    /// Apply `f` to a copy of the current value and publish it.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.write();
        let mut next = (*guard.value).clone();
        let result = f(&mut next);
        guard.value = Arc::new(next);
        guard.version += 1;
        result
    }
}
