//! Key-value access to the running node.
//!
//! Every call is a live round-trip to the component; nothing is cached here
//! and concurrent calls are not serialized. A call is bound to the node that
//! was running when it began: if that node is stopped (or replaced) while the
//! call is pending, the call fails with [`ClientError::NotRunning`] instead of
//! waiting on the component.

use super::lifecycle::{NodeHandle, NodeLifecycle, NodeStatus};
use crate::component::{ComponentError, DhtComponent};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Errors returned by [`KeyValueClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("DHT node is not running")]
    NotRunning,

    #[error("DHT request failed: {0}")]
    Component(#[from] ComponentError),
}

/// get/put façade over the node owned by a [`NodeLifecycle`].
#[derive(Debug, Clone)]
pub struct KeyValueClient {
    lifecycle: Arc<NodeLifecycle>,
}

impl KeyValueClient {
    pub fn new(lifecycle: Arc<NodeLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Current value for `key`, `None` if the DHT holds nothing.
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        let value = self
            .call(|dht| async move { dht.get(key).await })
            .await?;
        debug!(%key, found = value.is_some(), "get");
        Ok(value)
    }

    /// Store `value` under `key`; returns once the node accepted it.
    pub async fn put(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.call(|dht| async move { dht.put(key, value).await })
            .await?;
        debug!(%key, "put");
        Ok(())
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T, ClientError>
    where
        F: FnOnce(Arc<dyn DhtComponent>) -> Fut,
        Fut: Future<Output = Result<T, ComponentError>>,
    {
        let mut status = self.lifecycle.subscribe();
        let handle = running_handle(&mut status)?;

        tokio::select! {
            result = op(Arc::clone(handle.component())) => Ok(result?),
            _ = status.wait_for(|s| !s.is_running_handle(&handle)) => Err(ClientError::NotRunning),
        }
    }
}

fn running_handle(status: &mut watch::Receiver<NodeStatus>) -> Result<Arc<NodeHandle>, ClientError> {
    status
        .borrow_and_update()
        .handle()
        .cloned()
        .ok_or(ClientError::NotRunning)
}
