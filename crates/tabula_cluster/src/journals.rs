//! Journals behind access control.

use tabula_chunk::ReplicationParams;
use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::security::{Acl, Permission};
use tabula_common::{ChunkId, JournalId, NamedRow};
use tabula_journal::{JournalAttributes, JournalMetricsSnapshot, JournalWriterOptions};

use crate::cluster::Cluster;

impl Cluster {
    fn check_journal(&self, user: &str, path: &str, permission: Permission) -> TabulaResult<()> {
        let acl = self
            .state
            .read()
            .journal_acls
            .get(path)
            .cloned()
            .ok_or_else(|| TabulaError::not_found(format!("journal {path}")))?;
        self.security.check(user, path, &acl, permission)
    }

    /// Create a journal. Replication left at its default takes the
    /// cluster's configured replication.
    pub fn create_journal(&self, user: &str, path: &str, mut attributes: JournalAttributes, acl: Acl) -> TabulaResult<JournalId> {
        if path.is_empty() {
            return Err(TabulaError::argument("journal path must be non-empty"));
        }
        if attributes.params == ReplicationParams::default() {
            attributes.params = self.default_replication();
        }
        let mut state = self.state.write();
        if state.tables.contains_key(path) {
            return Err(TabulaError::argument(format!("node {path} already exists")));
        }
        self.security.check(user, path, &Acl::default(), Permission::Write)?;
        let id = self.journals.create(path, attributes)?;
        state.journal_acls.insert(path.to_string(), acl);
        Ok(id)
    }

    pub fn remove_journal(&self, user: &str, path: &str) -> TabulaResult<()> {
        self.check_journal(user, path, Permission::Write)?;
        self.journals.remove(path)?;
        self.state.write().journal_acls.remove(path);
        Ok(())
    }

    pub fn journal_exists(&self, path: &str) -> bool {
        self.journals.exists(path)
    }

    /// Append rows; returns how many were written.
    pub fn write_journal(
        &self,
        user: &str,
        path: &str,
        rows: &[NamedRow],
        options: &JournalWriterOptions,
    ) -> TabulaResult<u64> {
        self.check_journal(user, path, Permission::Write)?;
        self.journals.write(path, rows, options)
    }

    /// Rows `[from, to)` of the quorum prefix.
    pub fn read_journal(&self, user: &str, path: &str, from: u64, to: Option<u64>) -> TabulaResult<Vec<NamedRow>> {
        self.check_journal(user, path, Permission::Read)?;
        self.journals.read(path, from, to)
    }

    /// Drop rows past `row_count`. The journal must be sealed.
    pub fn truncate_journal(&self, user: &str, path: &str, row_count: u64) -> TabulaResult<()> {
        self.check_journal(user, path, Permission::Write)?;
        self.journals.truncate(path, row_count)
    }

    pub fn journal_quorum_row_count(&self, user: &str, path: &str) -> TabulaResult<u64> {
        self.check_journal(user, path, Permission::Read)?;
        self.journals.quorum_row_count(path)
    }

    pub fn journal_sealed(&self, user: &str, path: &str) -> TabulaResult<bool> {
        self.check_journal(user, path, Permission::Read)?;
        self.journals.is_sealed(path)
    }

    pub fn journal_attributes(&self, user: &str, path: &str) -> TabulaResult<JournalAttributes> {
        self.check_journal(user, path, Permission::Read)?;
        self.journals.attributes(path)
    }

    pub fn journal_chunk_ids(&self, user: &str, path: &str) -> TabulaResult<Vec<ChunkId>> {
        self.check_journal(user, path, Permission::Read)?;
        self.journals.chunk_ids(path)
    }

    pub fn journal_metrics(&self) -> JournalMetricsSnapshot {
        self.journals.metrics()
    }
}
