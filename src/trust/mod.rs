//! Capability-scoped trust for loaded components.
//!
//! A [`TrustScope`] grants a permission set to a fixed set of component
//! locations. Installed scopes form a [`PolicyChain`]: checks consult the most
//! recently installed scope first and fall through to older (outer) scopes, so
//! installing a new scope never revokes a grant somebody else relies on.
//!
//! Scopes are immutable once installed. The [`TrustGrantor`] swaps in a new
//! chain snapshot on every install; readers hold an `Arc` to the snapshot they
//! checked against.

use crate::component::ComponentLocation;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Individual capability a component may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    /// Read and write local files (cache spool files, persistent directory).
    FileIo,
    /// Open sockets (overlay traffic, proxy port).
    NetworkIo,
}

/// Permissions a loaded component cannot run without.
pub const REQUIRED_PERMISSIONS: [Permission; 2] = [Permission::FileIo, Permission::NetworkIo];

/// Set of permissions granted by a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionSet {
    /// Everything, including permissions not modelled by [`Permission`].
    Unrestricted,
    /// Only the listed permissions.
    Only(BTreeSet<Permission>),
}

impl PermissionSet {
    pub fn only(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self::Only(permissions.into_iter().collect())
    }

    pub fn implies(&self, permission: Permission) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Only(set) => set.contains(&permission),
        }
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrestricted => write!(f, "unrestricted"),
            Self::Only(set) => write!(f, "{:?}", set),
        }
    }
}

/// Errors raised while building or installing trust policy.
#[derive(Debug, Error)]
pub enum TrustGrantError {
    #[error("trust scope '{0}' names no locations")]
    EmptyScope(String),

    #[error("trust scope '{scope}' does not grant {missing:?}")]
    InsufficientPermissions {
        scope: String,
        missing: Vec<Permission>,
    },

    #[error("policy store unavailable: {0}")]
    PolicyUnavailable(String),
}

/// Named, immutable grant of a permission set to a set of locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustScope {
    name: String,
    locations: BTreeSet<ComponentLocation>,
    permissions: PermissionSet,
}

impl TrustScope {
    /// Build a scope. The permission set must cover file and network I/O.
    pub fn new(
        name: impl Into<String>,
        locations: impl IntoIterator<Item = ComponentLocation>,
        permissions: PermissionSet,
    ) -> Result<Self, TrustGrantError> {
        let name = name.into();
        let locations: BTreeSet<_> = locations.into_iter().collect();
        if locations.is_empty() {
            return Err(TrustGrantError::EmptyScope(name));
        }

        let missing: Vec<_> = REQUIRED_PERMISSIONS
            .iter()
            .copied()
            .filter(|p| !permissions.implies(*p))
            .collect();
        if !missing.is_empty() {
            return Err(TrustGrantError::InsufficientPermissions {
                scope: name,
                missing,
            });
        }

        Ok(Self {
            name,
            locations,
            permissions,
        })
    }

    /// Scope granting unrestricted execution.
    pub fn unrestricted(
        name: impl Into<String>,
        locations: impl IntoIterator<Item = ComponentLocation>,
    ) -> Result<Self, TrustGrantError> {
        Self::new(name, locations, PermissionSet::Unrestricted)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn locations(&self) -> impl Iterator<Item = &ComponentLocation> {
        self.locations.iter()
    }

    pub fn contains(&self, location: &ComponentLocation) -> bool {
        self.locations.contains(location)
    }

    fn grants(&self, location: &ComponentLocation, permission: Permission) -> bool {
        self.contains(location) && self.permissions.implies(permission)
    }
}

/// Installed scopes, oldest first. Checks walk newest to oldest.
#[derive(Debug, Clone, Default)]
pub struct PolicyChain {
    scopes: Vec<Arc<TrustScope>>,
}

impl PolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new chain with `scope` on top, delegating to `self`.
    pub fn with_scope(&self, scope: Arc<TrustScope>) -> Self {
        let mut scopes = self.scopes.clone();
        scopes.push(scope);
        Self { scopes }
    }

    /// True if any scope, newest first, grants `permission` at `location`.
    pub fn implies(&self, location: &ComponentLocation, permission: Permission) -> bool {
        self.scopes
            .iter()
            .rev()
            .any(|scope| scope.grants(location, permission))
    }

    /// True if every permission a component needs is granted at `location`.
    pub fn trusts(&self, location: &ComponentLocation) -> bool {
        REQUIRED_PERMISSIONS
            .iter()
            .all(|p| self.implies(location, *p))
    }

    /// Newest scope that names `location`.
    pub fn resolve(&self, location: &ComponentLocation) -> Option<&TrustScope> {
        self.scopes
            .iter()
            .rev()
            .find(|scope| scope.contains(location))
            .map(Arc::as_ref)
    }

    /// Scopes newest first.
    pub fn scopes(&self) -> impl Iterator<Item = &TrustScope> {
        self.scopes.iter().rev().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// Owner of the live policy chain.
#[derive(Debug, Default)]
pub struct TrustGrantor {
    policy: RwLock<Arc<PolicyChain>>,
}

impl TrustGrantor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `scope` on top of the current policy.
    ///
    /// A scope equal to one already in the chain is not installed again; the
    /// installed one is returned instead.
    pub fn install_scope(&self, scope: TrustScope) -> Result<Arc<TrustScope>, TrustGrantError> {
        let mut policy = self
            .policy
            .write()
            .map_err(|e| TrustGrantError::PolicyUnavailable(e.to_string()))?;

        if let Some(existing) = policy.scopes.iter().find(|s| ***s == scope) {
            debug!(scope = %existing.name(), depth = policy.len(), "trust scope already installed");
            return Ok(Arc::clone(existing));
        }

        let scope = Arc::new(scope);
        let chained = policy.with_scope(Arc::clone(&scope));
        *policy = Arc::new(chained);

        info!(
            scope = %scope.name(),
            permissions = %scope.permissions(),
            locations = scope.locations.len(),
            depth = policy.len(),
            "trust scope installed"
        );
        for location in scope.locations() {
            debug!(scope = %scope.name(), %location, "granted");
        }

        Ok(scope)
    }

    /// Snapshot of the current policy.
    pub fn policy(&self) -> Arc<PolicyChain> {
        match self.policy.read() {
            Ok(policy) => Arc::clone(&policy),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(path: &str) -> ComponentLocation {
        ComponentLocation::parse(path)
    }

    #[test]
    fn test_empty_scope_rejected() {
        let result = TrustScope::unrestricted("empty", Vec::new());
        assert!(matches!(result, Err(TrustGrantError::EmptyScope(_))));
    }

    #[test]
    fn test_scope_without_network_rejected() {
        let result = TrustScope::new(
            "files-only",
            [loc("/opt/a.toml")],
            PermissionSet::only([Permission::FileIo]),
        );
        match result {
            Err(TrustGrantError::InsufficientPermissions { missing, .. }) => {
                assert_eq!(missing, vec![Permission::NetworkIo]);
            }
            other => panic!("expected InsufficientPermissions, got {:?}", other),
        }
    }

    #[test]
    fn test_fine_grained_scope_accepted() {
        let scope = TrustScope::new(
            "io",
            [loc("/opt/a.toml")],
            PermissionSet::only(REQUIRED_PERMISSIONS),
        )
        .unwrap();
        assert!(scope.permissions().implies(Permission::FileIo));
        assert!(scope.permissions().implies(Permission::NetworkIo));
    }

    #[test]
    fn test_location_outside_scope_not_trusted() {
        let grantor = TrustGrantor::new();
        grantor
            .install_scope(TrustScope::unrestricted("dht", [loc("/opt/dht.toml")]).unwrap())
            .unwrap();

        let policy = grantor.policy();
        assert!(policy.trusts(&loc("/opt/dht.toml")));
        assert!(!policy.trusts(&loc("/opt/other.toml")));
        assert!(!policy.implies(&loc("/opt/other.toml"), Permission::FileIo));
    }

    #[test]
    fn test_new_scope_delegates_to_outer() {
        let grantor = TrustGrantor::new();
        grantor
            .install_scope(TrustScope::unrestricted("first", [loc("/opt/first.toml")]).unwrap())
            .unwrap();
        grantor
            .install_scope(TrustScope::unrestricted("second", [loc("/opt/second.toml")]).unwrap())
            .unwrap();

        let policy = grantor.policy();
        assert_eq!(policy.len(), 2);
        // The older grant survives the newer install.
        assert!(policy.trusts(&loc("/opt/first.toml")));
        assert!(policy.trusts(&loc("/opt/second.toml")));
    }

    #[test]
    fn test_resolve_prefers_newest_scope() {
        let grantor = TrustGrantor::new();
        let shared = loc("/opt/shared.toml");
        grantor
            .install_scope(TrustScope::unrestricted("old", [shared.clone()]).unwrap())
            .unwrap();
        grantor
            .install_scope(TrustScope::unrestricted("new", [shared.clone()]).unwrap())
            .unwrap();

        let policy = grantor.policy();
        assert_eq!(policy.resolve(&shared).unwrap().name(), "new");
        let names: Vec<_> = policy.scopes().map(TrustScope::name).collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[test]
    fn test_equal_scope_installed_once() {
        let grantor = TrustGrantor::new();
        let first = grantor
            .install_scope(TrustScope::unrestricted("dht", [loc("/opt/dht.toml")]).unwrap())
            .unwrap();
        let again = grantor
            .install_scope(TrustScope::unrestricted("dht", [loc("/opt/dht.toml")]).unwrap())
            .unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(grantor.policy().len(), 1);

        // Same name, different locations: a distinct grant.
        grantor
            .install_scope(
                TrustScope::unrestricted("dht", [loc("/opt/dht.toml"), loc("/opt/x.toml")])
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(grantor.policy().len(), 2);
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let grantor = TrustGrantor::new();
        let before = grantor.policy();
        grantor
            .install_scope(TrustScope::unrestricted("late", [loc("/opt/late.toml")]).unwrap())
            .unwrap();

        assert!(before.is_empty());
        assert!(!before.trusts(&loc("/opt/late.toml")));
        assert!(grantor.policy().trusts(&loc("/opt/late.toml")));
    }
}
