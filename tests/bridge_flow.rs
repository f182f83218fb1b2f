// End-to-end flow through the library: load a component from a trusted
// location, start the node, serve get/put, hand it cache files, log through
// the host sink, stop.

use dhtfox::cache::{CacheMaterializer, DiskCache, HeaderMap};
use dhtfox::component::mock::MockComponent;
use dhtfox::component::{
    ComponentLoader, ComponentLocation, ComponentManifest, ComponentRegistry, DhtComponent,
    LoadError, MemoryDht, NodeParams,
};
use dhtfox::logging::{HostLogSink, LoggerBridge, SinkError};
use dhtfox::node::{ClientError, KeyValueClient, NodeLifecycle, NodeState};
use dhtfox::trust::TrustGrantor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl HostLogSink for CollectingSink {
    fn log_string_message(&self, message: &str) -> Result<(), SinkError> {
        self.lines.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

fn write_manifest(dir: &Path, file: &str, entries: &[&str]) -> ComponentLocation {
    let path = dir.join(file);
    let manifest = ComponentManifest::new("vendor", entries.iter().map(|e| e.to_string()));
    std::fs::write(&path, manifest.to_toml().unwrap()).unwrap();
    ComponentLocation::from_install_root(dir, file)
}

fn params() -> NodeParams {
    NodeParams::new("abc", "125.6.175.11:3997", 3997, 8080)
}

#[tokio::test]
async fn test_mock_component_full_flow() {
    let dir = TempDir::new().unwrap();
    let location = write_manifest(dir.path(), "vendor.toml", &["vendor.Mock"]);

    let mock = MockComponent::new();
    let mut registry = ComponentRegistry::new();
    let factory_mock = mock.clone();
    registry.register("vendor.Mock", move |_ctx| {
        Ok(Arc::new(factory_mock.clone()) as Arc<dyn DhtComponent>)
    });
    let loader = ComponentLoader::new(registry, Arc::new(TrustGrantor::new()));
    let component = loader.load(&[location], "vendor.Mock").unwrap();
    assert!(component.is_trusted());

    let cache = DiskCache::open(dir.path().join("cache")).await.unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("Content-Length".to_string(), vec!["5".to_string()]);
    cache
        .store("http://example.com/", &headers, b"hello")
        .await
        .unwrap();
    let materializer =
        CacheMaterializer::new(Arc::new(cache.clone()), dir.path().join("spool")).unwrap();

    let sink = Arc::new(CollectingSink::default());
    let lifecycle = Arc::new(NodeLifecycle::new());
    let client = KeyValueClient::new(Arc::clone(&lifecycle));

    assert_eq!(client.get("k").await, Err(ClientError::NotRunning));

    let started = lifecycle
        .start(
            &component,
            Arc::new(materializer.clone()),
            Arc::new(LoggerBridge::new(sink.clone())),
            params(),
        )
        .await
        .unwrap();
    assert!(started);
    assert_eq!(lifecycle.state(), NodeState::Running);
    assert_eq!(mock.last_params(), Some(params()));

    client.put("k", "v").await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), Some("v".to_string()));

    // The node reads cached responses through the callbacks it was given.
    let callbacks = mock.callbacks().unwrap();
    let entry = callbacks
        .cache
        .get_cache_entry("http://example.com/")
        .await
        .unwrap();
    let path = callbacks.cache.read_all(entry).await.unwrap();
    assert!(path.is_absolute());
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    assert!(callbacks
        .cache
        .get_cache_entry("http://example.com/missing")
        .await
        .is_none());

    callbacks.log.log("joined");
    callbacks.log.error("lost a peer");
    assert_eq!(
        *sink.lines.lock().unwrap(),
        vec!["joined".to_string(), "[error] lost a peer".to_string()]
    );

    lifecycle.stop().await;
    assert_eq!(lifecycle.state(), NodeState::Stopped);
    assert_eq!(client.get("k").await, Err(ClientError::NotRunning));
    assert_eq!(client.put("k", "w").await, Err(ClientError::NotRunning));
    assert_eq!(mock.stored("k"), Some("v".to_string()));
}

#[tokio::test]
async fn test_builtin_component_flow() {
    let dir = TempDir::new().unwrap();
    let location = write_manifest(dir.path(), "core.toml", &[MemoryDht::ENTRY]);
    let loader = ComponentLoader::new(
        ComponentRegistry::with_builtin(),
        Arc::new(TrustGrantor::new()),
    );
    let component = loader.load(&[location], MemoryDht::ENTRY).unwrap();

    let cache = DiskCache::open(dir.path().join("cache")).await.unwrap();
    let materializer = CacheMaterializer::new(Arc::new(cache), dir.path().join("spool")).unwrap();
    let lifecycle = Arc::new(NodeLifecycle::new());
    let client = KeyValueClient::new(Arc::clone(&lifecycle));

    assert!(lifecycle
        .start(
            &component,
            Arc::new(materializer),
            Arc::new(LoggerBridge::tracing()),
            params(),
        )
        .await
        .unwrap());

    client.put("k", "first").await.unwrap();
    client.put("k", "second").await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), Some("second".to_string()));

    lifecycle.stop().await;
    assert_eq!(client.get("k").await, Err(ClientError::NotRunning));
}

#[tokio::test]
async fn test_untrusted_location_is_never_consulted() {
    let dir = TempDir::new().unwrap();
    let trusted = write_manifest(dir.path(), "core.toml", &["dhtfox.Other"]);
    // Exports the entry, but is not among the given locations.
    write_manifest(dir.path(), "stray.toml", &[MemoryDht::ENTRY]);

    let loader = ComponentLoader::new(
        ComponentRegistry::with_builtin(),
        Arc::new(TrustGrantor::new()),
    );
    let result = loader.load(&[trusted], MemoryDht::ENTRY);

    assert!(matches!(result, Err(LoadError::EntryNotFound { .. })));
}
