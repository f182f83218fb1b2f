//! Scoped component loading.
//!
//! Loading happens in three steps:
//! 1. fetch the manifest at every given location (nothing else is consulted),
//! 2. install a trust scope covering exactly those locations,
//! 3. resolve the entry symbol through the fetched manifests and instantiate
//!    it with the factory the host registered for it.
//!
//! The entry is only instantiated if the location exporting it is trusted by
//! the policy snapshot taken after step 2.

use super::location::ComponentLocation;
use super::manifest::{ComponentManifest, FetchedManifest};
use super::memory::MemoryDht;
use super::traits::{DhtComponent, COMPONENT_ABI_VERSION};
use crate::trust::{PolicyChain, TrustGrantError, TrustGrantor, TrustScope};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// What a factory sees when asked to build a component.
#[derive(Debug)]
pub struct ComponentContext<'a> {
    pub entry: &'a str,
    pub location: &'a ComponentLocation,
    pub manifest: &'a ComponentManifest,
}

/// Constructor for one entry symbol.
pub type ComponentFactory =
    Arc<dyn Fn(&ComponentContext<'_>) -> Result<Arc<dyn DhtComponent>, String> + Send + Sync>;

/// Entry symbol → factory table supplied by the host.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: HashMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in [`MemoryDht`] under [`MemoryDht::ENTRY`].
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MemoryDht::ENTRY, |_ctx| {
            Ok(Arc::new(MemoryDht::new()) as Arc<dyn DhtComponent>)
        });
        registry
    }

    pub fn register<F>(&mut self, entry: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentContext<'_>) -> Result<Arc<dyn DhtComponent>, String>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(entry.into(), Arc::new(factory));
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }

    fn get(&self, entry: &str) -> Option<&ComponentFactory> {
        self.factories.get(entry)
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.factories.keys().collect();
        entries.sort();
        f.debug_struct("ComponentRegistry")
            .field("entries", &entries)
            .finish()
    }
}

/// Errors that abort a component load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no component locations given")]
    NoLocations,

    #[error("location unreachable: {location}: {source}")]
    Unreachable {
        location: ComponentLocation,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest at {location}: {reason}")]
    InvalidManifest {
        location: ComponentLocation,
        reason: String,
    },

    #[error("manifest at {location} targets ABI {found}, expected {expected}")]
    IncompatibleAbi {
        location: ComponentLocation,
        found: u32,
        expected: u32,
    },

    #[error("manifest at {location} requires '{requires}', which is not among the given locations")]
    MissingDependency {
        location: ComponentLocation,
        requires: String,
    },

    #[error("entry '{entry}' not exported by any of {searched} location(s)")]
    EntryNotFound { entry: String, searched: usize },

    #[error("entry '{entry}' exported by {location} has no registered factory")]
    UnregisteredEntry {
        entry: String,
        location: ComponentLocation,
    },

    #[error("entry '{entry}' at {location} is not trusted by the current policy")]
    Untrusted {
        entry: String,
        location: ComponentLocation,
    },

    #[error("failed to instantiate '{entry}' from {location}: {reason}")]
    Instantiation {
        entry: String,
        location: ComponentLocation,
        reason: String,
    },

    #[error(transparent)]
    Trust(#[from] TrustGrantError),
}

/// Loader that only sees the manifests of its own locations.
#[derive(Debug, Clone)]
pub struct ScopedLoader {
    manifests: Vec<FetchedManifest>,
    policy: Arc<PolicyChain>,
}

impl ScopedLoader {
    /// Fetch and validate the manifest at every location.
    pub fn fetch(
        locations: &[ComponentLocation],
        policy: Arc<PolicyChain>,
    ) -> Result<Self, LoadError> {
        if locations.is_empty() {
            return Err(LoadError::NoLocations);
        }

        let mut manifests = Vec::with_capacity(locations.len());
        for location in locations {
            manifests.push(fetch_manifest(location)?);
        }

        let provided: BTreeSet<&str> = manifests.iter().map(|m| m.manifest.name.as_str()).collect();
        for fetched in &manifests {
            if let Some(missing) = fetched
                .manifest
                .requires
                .iter()
                .find(|name| !provided.contains(name.as_str()))
            {
                return Err(LoadError::MissingDependency {
                    location: fetched.location.clone(),
                    requires: missing.clone(),
                });
            }
        }

        Ok(Self { manifests, policy })
    }

    /// Same manifests checked against another policy snapshot.
    pub fn with_policy(mut self, policy: Arc<PolicyChain>) -> Self {
        self.policy = policy;
        self
    }

    pub fn locations(&self) -> impl Iterator<Item = &ComponentLocation> {
        self.manifests.iter().map(|m| &m.location)
    }

    /// Manifest exporting `entry`.
    pub fn find_entry(&self, entry: &str) -> Result<&FetchedManifest, LoadError> {
        self.manifests
            .iter()
            .find(|m| m.manifest.exports(entry))
            .ok_or_else(|| LoadError::EntryNotFound {
                entry: entry.to_string(),
                searched: self.manifests.len(),
            })
    }

    /// Resolve `entry` and build it, provided its location is trusted.
    pub fn instantiate(
        &self,
        entry: &str,
        registry: &ComponentRegistry,
    ) -> Result<(ComponentLocation, Arc<dyn DhtComponent>), LoadError> {
        let fetched = self.find_entry(entry)?;
        let location = &fetched.location;

        if !self.policy.trusts(location) {
            return Err(LoadError::Untrusted {
                entry: entry.to_string(),
                location: location.clone(),
            });
        }

        let factory = registry
            .get(entry)
            .ok_or_else(|| LoadError::UnregisteredEntry {
                entry: entry.to_string(),
                location: location.clone(),
            })?;

        let context = ComponentContext {
            entry,
            location,
            manifest: &fetched.manifest,
        };
        let component = factory(&context).map_err(|reason| LoadError::Instantiation {
            entry: entry.to_string(),
            location: location.clone(),
            reason,
        })?;

        Ok((location.clone(), component))
    }
}

fn fetch_manifest(location: &ComponentLocation) -> Result<FetchedManifest, LoadError> {
    let contents = fs::read_to_string(location.to_path()).map_err(|source| {
        LoadError::Unreachable {
            location: location.clone(),
            source,
        }
    })?;

    let manifest =
        ComponentManifest::parse(&contents).map_err(|e| LoadError::InvalidManifest {
            location: location.clone(),
            reason: e.to_string(),
        })?;

    if manifest.abi_version != COMPONENT_ABI_VERSION {
        return Err(LoadError::IncompatibleAbi {
            location: location.clone(),
            found: manifest.abi_version,
            expected: COMPONENT_ABI_VERSION,
        });
    }

    debug!(%location, name = %manifest.name, entries = ?manifest.entries, "manifest fetched");
    Ok(FetchedManifest {
        location: location.clone(),
        manifest,
    })
}

/// A loaded component plus what it needs to re-check its trust.
#[derive(Clone)]
pub struct ComponentHandle {
    entry: String,
    location: ComponentLocation,
    component: Arc<dyn DhtComponent>,
    grantor: Arc<TrustGrantor>,
}

impl ComponentHandle {
    /// Wrap an already-built component, e.g. one compiled into the host.
    pub fn from_parts(
        entry: impl Into<String>,
        location: ComponentLocation,
        component: Arc<dyn DhtComponent>,
        grantor: Arc<TrustGrantor>,
    ) -> Self {
        Self {
            entry: entry.into(),
            location,
            component,
            grantor,
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn location(&self) -> &ComponentLocation {
        &self.location
    }

    pub fn component(&self) -> &Arc<dyn DhtComponent> {
        &self.component
    }

    /// Whether the live policy still trusts this component's location.
    pub fn is_trusted(&self) -> bool {
        self.grantor.policy().trusts(&self.location)
    }
}

impl fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("entry", &self.entry)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Loads components under a trust scope covering exactly their locations.
#[derive(Debug, Clone)]
pub struct ComponentLoader {
    registry: ComponentRegistry,
    grantor: Arc<TrustGrantor>,
}

impl ComponentLoader {
    pub fn new(registry: ComponentRegistry, grantor: Arc<TrustGrantor>) -> Self {
        Self { registry, grantor }
    }

    pub fn grantor(&self) -> &Arc<TrustGrantor> {
        &self.grantor
    }

    /// Load `entry` from `locations`.
    pub fn load(
        &self,
        locations: &[ComponentLocation],
        entry: &str,
    ) -> Result<ComponentHandle, LoadError> {
        let mut unique = Vec::with_capacity(locations.len());
        for location in locations {
            if !unique.contains(location) {
                unique.push(location.clone());
            }
        }

        let loader = ScopedLoader::fetch(&unique, self.grantor.policy())?;

        let scope = TrustScope::unrestricted(format!("component:{entry}"), unique.iter().cloned())
            .inspect_err(|e| warn!(%entry, error = %e, "trust scope rejected"))?;
        self.grantor.install_scope(scope)?;

        let loader = loader.with_policy(self.grantor.policy());
        let (location, component) = loader.instantiate(entry, &self.registry)?;

        info!(%entry, %location, "component loaded");
        Ok(ComponentHandle {
            entry: entry.to_string(),
            location,
            component,
            grantor: Arc::clone(&self.grantor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::mock::MockComponent;
    use crate::trust::Permission;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, file: &str, manifest: &ComponentManifest) -> ComponentLocation {
        let path = dir.join(file);
        fs::write(&path, manifest.to_toml().unwrap()).unwrap();
        ComponentLocation::parse(&path.to_string_lossy())
    }

    fn builtin_manifest() -> ComponentManifest {
        ComponentManifest::new("dhtfox-core", vec![MemoryDht::ENTRY.to_string()])
    }

    fn loader() -> ComponentLoader {
        ComponentLoader::new(
            ComponentRegistry::with_builtin(),
            Arc::new(TrustGrantor::new()),
        )
    }

    #[test]
    fn test_load_builtin_component() {
        let dir = TempDir::new().unwrap();
        let location = write_manifest(dir.path(), "core.toml", &builtin_manifest());
        let loader = loader();

        let handle = loader.load(&[location.clone()], MemoryDht::ENTRY).unwrap();

        assert_eq!(handle.entry(), MemoryDht::ENTRY);
        assert_eq!(handle.location(), &location);
        assert!(handle.is_trusted());
        assert!(!handle.component().is_started());
    }

    #[test]
    fn test_load_installs_scope_for_all_locations() {
        let dir = TempDir::new().unwrap();
        let mut core = builtin_manifest();
        core.requires.push("dhtfox-runtime".to_string());
        let core_loc = write_manifest(dir.path(), "core.toml", &core);
        let runtime_loc = write_manifest(
            dir.path(),
            "runtime.toml",
            &ComponentManifest::new("dhtfox-runtime", Vec::new()),
        );
        let loader = loader();

        loader
            .load(&[core_loc.clone(), runtime_loc.clone()], MemoryDht::ENTRY)
            .unwrap();

        let policy = loader.grantor().policy();
        assert!(policy.implies(&core_loc, Permission::FileIo));
        assert!(policy.implies(&runtime_loc, Permission::NetworkIo));
        assert_eq!(
            policy.resolve(&core_loc).unwrap().name(),
            format!("component:{}", MemoryDht::ENTRY)
        );
    }

    #[test]
    fn test_location_order_does_not_matter() {
        let dir = TempDir::new().unwrap();
        let mut core = builtin_manifest();
        core.requires.push("dhtfox-runtime".to_string());
        let core_loc = write_manifest(dir.path(), "core.toml", &core);
        let runtime_loc = write_manifest(
            dir.path(),
            "runtime.toml",
            &ComponentManifest::new("dhtfox-runtime", Vec::new()),
        );

        assert!(loader()
            .load(&[core_loc.clone(), runtime_loc.clone()], MemoryDht::ENTRY)
            .is_ok());
        assert!(loader()
            .load(&[runtime_loc, core_loc], MemoryDht::ENTRY)
            .is_ok());
    }

    #[test]
    fn test_missing_dependency_fails() {
        let dir = TempDir::new().unwrap();
        let mut core = builtin_manifest();
        core.requires.push("dhtfox-runtime".to_string());
        let core_loc = write_manifest(dir.path(), "core.toml", &core);

        let err = loader().load(&[core_loc.clone()], MemoryDht::ENTRY).unwrap_err();
        match err {
            LoadError::MissingDependency { location, requires } => {
                assert_eq!(location, core_loc);
                assert_eq!(requires, "dhtfox-runtime");
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_unreachable_location_fails_with_location() {
        let dir = TempDir::new().unwrap();
        let missing = ComponentLocation::parse(&dir.path().join("gone.toml").to_string_lossy());
        let loader = loader();

        let err = loader.load(&[missing.clone()], MemoryDht::ENTRY).unwrap_err();
        assert!(matches!(err, LoadError::Unreachable { ref location, .. } if *location == missing));
        // Nothing was granted for a load that never got its manifests.
        assert!(loader.grantor().policy().is_empty());
    }

    #[test]
    fn test_no_locations() {
        assert!(matches!(
            loader().load(&[], MemoryDht::ENTRY),
            Err(LoadError::NoLocations)
        ));
    }

    #[test]
    fn test_absent_entry_fails() {
        let dir = TempDir::new().unwrap();
        let location = write_manifest(dir.path(), "core.toml", &builtin_manifest());

        let err = loader().load(&[location], "dhtfox.Missing").unwrap_err();
        assert!(matches!(
            err,
            LoadError::EntryNotFound { ref entry, searched: 1 } if entry == "dhtfox.Missing"
        ));
    }

    #[test]
    fn test_exported_but_unregistered_entry_fails() {
        let dir = TempDir::new().unwrap();
        let manifest = ComponentManifest::new("other", vec!["vendor.Dht".to_string()]);
        let location = write_manifest(dir.path(), "other.toml", &manifest);

        let err = loader().load(&[location], "vendor.Dht").unwrap_err();
        assert!(matches!(err, LoadError::UnregisteredEntry { .. }));
    }

    #[test]
    fn test_incompatible_abi_fails() {
        let dir = TempDir::new().unwrap();
        let mut manifest = builtin_manifest();
        manifest.abi_version = COMPONENT_ABI_VERSION + 1;
        let location = write_manifest(dir.path(), "core.toml", &manifest);

        let err = loader().load(&[location], MemoryDht::ENTRY).unwrap_err();
        assert!(matches!(err, LoadError::IncompatibleAbi { found: 2, expected: 1, .. }));
    }

    #[test]
    fn test_malformed_manifest_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "name = ").unwrap();
        let location = ComponentLocation::parse(&path.to_string_lossy());

        let err = loader().load(&[location], MemoryDht::ENTRY).unwrap_err();
        assert!(matches!(err, LoadError::InvalidManifest { .. }));
    }

    #[test]
    fn test_factory_failure_is_instantiation_error() {
        let dir = TempDir::new().unwrap();
        let manifest = ComponentManifest::new("flaky", vec!["vendor.Flaky".to_string()]);
        let location = write_manifest(dir.path(), "flaky.toml", &manifest);

        let mut registry = ComponentRegistry::new();
        registry.register("vendor.Flaky", |_ctx| Err("constructor threw".to_string()));
        let loader = ComponentLoader::new(registry, Arc::new(TrustGrantor::new()));

        let err = loader.load(&[location], "vendor.Flaky").unwrap_err();
        match err {
            LoadError::Instantiation { entry, reason, .. } => {
                assert_eq!(entry, "vendor.Flaky");
                assert_eq!(reason, "constructor threw");
            }
            other => panic!("expected Instantiation, got {other:?}"),
        }
    }

    #[test]
    fn test_location_outside_scope_is_not_instantiated() {
        let dir = TempDir::new().unwrap();
        let trusted = write_manifest(
            dir.path(),
            "trusted.toml",
            &ComponentManifest::new("trusted", Vec::new()),
        );
        let untrusted = write_manifest(
            dir.path(),
            "untrusted.toml",
            &ComponentManifest::new("untrusted", vec!["vendor.Mock".to_string()]),
        );

        let grantor = TrustGrantor::new();
        grantor
            .install_scope(TrustScope::unrestricted("trusted-only", [trusted.clone()]).unwrap())
            .unwrap();

        let mut registry = ComponentRegistry::new();
        registry.register("vendor.Mock", |_ctx| {
            Ok(Arc::new(MockComponent::new()) as Arc<dyn DhtComponent>)
        });

        let scoped = ScopedLoader::fetch(&[trusted, untrusted.clone()], grantor.policy()).unwrap();
        let err = match scoped.instantiate("vendor.Mock", &registry) {
            Err(err) => err,
            Ok((location, _)) => panic!("instantiated from {location}"),
        };
        assert!(matches!(err, LoadError::Untrusted { ref location, .. } if *location == untrusted));
    }

    #[test]
    fn test_repeated_load_installs_one_scope() {
        let dir = TempDir::new().unwrap();
        let manifest = ComponentManifest::new("core", vec![MemoryDht::ENTRY.to_string()]);
        let location = write_manifest(dir.path(), "core.toml", &manifest);
        let loader = loader();

        for _ in 0..3 {
            loader.load(&[location.clone()], MemoryDht::ENTRY).unwrap();
        }

        assert_eq!(loader.grantor().policy().len(), 1);
    }

    #[test]
    fn test_factory_sees_its_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = ComponentManifest::new("ctx", vec!["vendor.Ctx".to_string()]);
        let location = write_manifest(dir.path(), "ctx.toml", &manifest);

        let mut registry = ComponentRegistry::new();
        registry.register("vendor.Ctx", |ctx| {
            if ctx.manifest.name == "ctx" && ctx.entry == "vendor.Ctx" {
                Ok(Arc::new(MockComponent::new()) as Arc<dyn DhtComponent>)
            } else {
                Err(format!("unexpected context {:?}", ctx))
            }
        });
        let loader = ComponentLoader::new(registry, Arc::new(TrustGrantor::new()));

        assert!(loader.load(&[location], "vendor.Ctx").is_ok());
    }

    #[test]
    fn test_handle_untrusted_under_foreign_grantor() {
        let handle = ComponentHandle::from_parts(
            "vendor.Mock",
            ComponentLocation::parse("/nowhere/mock.toml"),
            Arc::new(MockComponent::new()),
            Arc::new(TrustGrantor::new()),
        );
        assert!(!handle.is_trusted());
    }
}
