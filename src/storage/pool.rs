//! Provider client pool / 客户端池
//!
//! Bounds the number of provider clients in use at once and caches one
//! client per base directory. A lease returns its slot when dropped, so
//! the slot is released on success, error and cancellation alike.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StorageError;

/// Builds a client for one base directory (bucket / container)
pub type ClientFactoryFn<T> = Arc<dyn Fn(&str) -> Result<T, StorageError> + Send + Sync>;

pub struct ClientPool<T: Clone + Send + Sync + 'static> {
    name: String,
    factory: ClientFactoryFn<T>,
    clients: Mutex<HashMap<String, T>>,
    permits: Arc<Semaphore>,
    max_size: usize,
}

impl<T: Clone + Send + Sync + 'static> ClientPool<T> {
    pub fn new(name: impl Into<String>, max_size: usize, factory: ClientFactoryFn<T>) -> Self {
        let max_size = max_size.max(1);
        Self {
            name: name.into(),
            factory,
            clients: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_size)),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Free slots / 空闲槽位
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a slot and lease the client of `base_directory` / 获取客户端租约
    pub async fn acquire(&self, base_directory: &str) -> Result<ClientLease<T>, StorageError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::provider(format!("client pool {} is closed", self.name)))?;

        let client = {
            let mut clients = self.clients.lock();
            match clients.get(base_directory) {
                Some(client) => client.clone(),
                None => {
                    // permit is dropped with the error
                    let client = (self.factory)(base_directory)?;
                    tracing::debug!("Client pool {}: new client for {}", self.name, base_directory);
                    clients.insert(base_directory.to_string(), client.clone());
                    client
                }
            }
        };

        Ok(ClientLease {
            client,
            _permit: permit,
        })
    }
}

/// Leased client, returns its slot on drop / 客户端租约，丢弃时释放
pub struct ClientLease<T> {
    client: T,
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for ClientLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.client
    }
}
