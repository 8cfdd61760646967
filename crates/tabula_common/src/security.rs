//! Path-scoped access control.
//!
//! Every table and journal carries an [`Acl`]. A check walks the entries:
//! any matching `deny` wins, otherwise any matching `allow` grants, otherwise
//! the configured default permissions apply. `root` bypasses all checks.

use std::collections::HashSet;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{TabulaError, TabulaResult};

pub const ROOT_USER: &str = "root";
/// Subject matching every user.
pub const EVERYONE: &str = "everyone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    /// Mount, unmount, remount, freeze and reshard tablets.
    Mount,
    Administer,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Mount => "mount",
            Permission::Administer => "administer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AceAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub action: AceAction,
    pub subjects: Vec<String>,
    pub permissions: Vec<Permission>,
}

impl AccessControlEntry {
    pub fn allow(subject: impl Into<String>, permissions: &[Permission]) -> Self {
        Self {
            action: AceAction::Allow,
            subjects: vec![subject.into()],
            permissions: permissions.to_vec(),
        }
    }

    pub fn deny(subject: impl Into<String>, permissions: &[Permission]) -> Self {
        Self {
            action: AceAction::Deny,
            subjects: vec![subject.into()],
            permissions: permissions.to_vec(),
        }
    }

    fn matches(&self, user: &str, permission: Permission) -> bool {
        self.permissions.contains(&permission)
            && self.subjects.iter().any(|s| s == user || s == EVERYONE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Acl {
    pub entries: Vec<AccessControlEntry>,
}

impl Acl {
    pub fn new(entries: Vec<AccessControlEntry>) -> Self {
        Self { entries }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCheckResult {
    Allowed,
    Denied,
    NoMatch,
}

impl Acl {
    pub fn evaluate(&self, user: &str, permission: Permission) -> PermissionCheckResult {
        let mut allowed = false;
        for entry in self.entries.iter().filter(|e| e.matches(user, permission)) {
            match entry.action {
                AceAction::Deny => return PermissionCheckResult::Denied,
                AceAction::Allow => allowed = true,
            }
        }
        if allowed {
            PermissionCheckResult::Allowed
        } else {
            PermissionCheckResult::NoMatch
        }
    }
}

/// Registry of known users plus the cluster-wide default grant.
#[derive(Debug)]
pub struct SecurityManager {
    users: RwLock<HashSet<String>>,
    default_permissions: Vec<Permission>,
}

impl SecurityManager {
    pub fn new(default_permissions: Vec<Permission>) -> Self {
        let mut users = HashSet::new();
        users.insert(ROOT_USER.to_string());
        Self {
            users: RwLock::new(users),
            default_permissions,
        }
    }

    pub fn create_user(&self, name: &str) -> TabulaResult<()> {
        if name.is_empty() {
            return Err(TabulaError::argument("user name must be non-empty"));
        }
        if !self.users.write().insert(name.to_string()) {
            return Err(TabulaError::argument(format!("user {name:?} already exists")));
        }
        tracing::info!(user = name, "user created");
        Ok(())
    }

    pub fn user_exists(&self, name: &str) -> bool {
        self.users.read().contains(name)
    }

    pub fn check(&self, user: &str, path: &str, acl: &Acl, permission: Permission) -> TabulaResult<()> {
        if user == ROOT_USER {
            return Ok(());
        }
        let allowed = self.user_exists(user)
            && match acl.evaluate(user, permission) {
                PermissionCheckResult::Allowed => true,
                PermissionCheckResult::Denied => false,
                PermissionCheckResult::NoMatch => self.default_permissions.contains(&permission),
            };
        if allowed {
            Ok(())
        } else {
            tracing::debug!(user, path, %permission, "permission denied");
            Err(TabulaError::PermissionDenied {
                user: user.to_string(),
                permission: permission.to_string(),
                path: path.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecurityManager {
        let m = SecurityManager::new(vec![Permission::Read, Permission::Write]);
        m.create_user("u").unwrap();
        m
    }

    #[test]
    fn test_root_bypasses_acl() {
        let m = manager();
        let acl = Acl::new(vec![AccessControlEntry::deny(EVERYONE, &[Permission::Read])]);
        assert!(m.check(ROOT_USER, "//t", &acl, Permission::Read).is_ok());
    }

    #[test]
    fn test_defaults_and_explicit_grants() {
        let m = manager();
        let empty = Acl::default();
        assert!(m.check("u", "//t", &empty, Permission::Read).is_ok());
        assert!(m.check("u", "//t", &empty, Permission::Mount).is_err());

        let acl = Acl::new(vec![AccessControlEntry::allow("u", &[Permission::Mount])]);
        assert!(m.check("u", "//t", &acl, Permission::Mount).is_ok());
    }

    #[test]
    fn test_deny_wins() {
        let m = manager();
        let acl = Acl::new(vec![
            AccessControlEntry::allow("u", &[Permission::Write]),
            AccessControlEntry::deny("u", &[Permission::Write]),
        ]);
        let err = m.check("u", "//t", &acl, Permission::Write).unwrap_err();
        assert!(matches!(err, TabulaError::PermissionDenied { .. }));
    }

    #[test]
    fn test_unknown_user_is_denied() {
        let m = manager();
        assert!(m.check("ghost", "//t", &Acl::default(), Permission::Read).is_err());
        assert!(m.create_user("u").is_err());
    }
}
