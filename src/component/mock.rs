//! Scriptable component and callback fakes for tests.

use super::traits::*;
use crate::cache::CacheEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fake component with counters and scripted behaviour.
#[derive(Clone)]
pub struct MockComponent {
    state: Arc<Mutex<MockState>>,
    init_calls: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
    started: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockState {
    store: HashMap<String, String>,
    fail_bootstrap: bool,
    init_delay: Duration,
    call_delay: Duration,
    callbacks: Option<NodeCallbacks>,
    last_params: Option<NodeParams>,
}

impl MockComponent {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            init_calls: Arc::new(AtomicUsize::new(0)),
            stop_calls: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every `initialize` reports an unreachable bootstrap peer.
    pub fn failing_bootstrap() -> Self {
        let mock = Self::new();
        mock.state.lock().unwrap().fail_bootstrap = true;
        mock
    }

    /// Make `initialize` take `delay` before answering.
    pub fn with_init_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().init_delay = delay;
        self
    }

    /// Make `get`/`put` take `delay` before answering.
    pub fn with_call_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().call_delay = delay;
        self
    }

    /// Pretend someone else already started a node in this component.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn set_fail_bootstrap(&self, fail: bool) {
        self.state.lock().unwrap().fail_bootstrap = fail;
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Raw store contents, bypassing the contract.
    pub fn stored(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().store.get(key).cloned()
    }

    pub fn store_len(&self) -> usize {
        self.state.lock().unwrap().store.len()
    }

    /// Callbacks received by the last successful `initialize`.
    pub fn callbacks(&self) -> Option<NodeCallbacks> {
        self.state.lock().unwrap().callbacks.clone()
    }

    pub fn last_params(&self) -> Option<NodeParams> {
        self.state.lock().unwrap().last_params.clone()
    }

    fn call_delay(&self) -> Duration {
        self.state.lock().unwrap().call_delay
    }
}

impl Default for MockComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DhtComponent for MockComponent {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn initialize(
        &self,
        params: &NodeParams,
        callbacks: NodeCallbacks,
    ) -> ComponentResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, fail) = {
            let state = self.state.lock().unwrap();
            (state.init_delay, state.fail_bootstrap)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            callbacks.log.error("bootstrap timed out");
            return Err(ComponentError::BootstrapUnreachable(params.bootstrap.clone()));
        }

        let mut state = self.state.lock().unwrap();
        state.callbacks = Some(callbacks);
        state.last_params = Some(params.clone());
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> ComponentResult<Option<String>> {
        let delay = self.call_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_started() {
            return Err(ComponentError::NotInitialized);
        }
        Ok(self.state.lock().unwrap().store.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> ComponentResult<()> {
        let delay = self.call_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_started() {
            return Err(ComponentError::NotInitialized);
        }
        self.state
            .lock()
            .unwrap()
            .store
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn stop(&self) -> ComponentResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Log callback that remembers every line.
#[derive(Debug, Default)]
pub struct RecordingLog {
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingLog {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl LogCallback for RecordingLog {
    fn log(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

/// Cache callback with nothing cached.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubCache;

#[async_trait]
impl CacheCallback for StubCache {
    async fn get_cache_entry(&self, _url: &str) -> Option<CacheEntry> {
        None
    }

    async fn read_all(&self, _entry: CacheEntry) -> Option<PathBuf> {
        None
    }
}
