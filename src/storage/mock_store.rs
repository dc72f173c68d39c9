//! Mock implementation of BlobStore for testing

use crate::storage::{validate_key, BlobError, BlobStore};
use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type DeleteHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Mock implementation of BlobStore for testing.
///
/// Clones share the same underlying state, so a test can keep one handle for
/// inspection and fault injection while the service owns another.
#[derive(Clone, Default)]
pub struct MockBlobStore {
    // In-memory storage: key -> data
    data: Arc<Mutex<HashMap<String, Bytes>>>,
    unavailable: Arc<AtomicBool>,
    delete_delay: Arc<Mutex<Option<Duration>>>,
    delete_calls: Arc<AtomicUsize>,
    before_delete: Arc<Mutex<Option<DeleteHook>>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delete fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every subsequent delete, used to trigger timeouts
    pub fn set_delete_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.delete_delay.lock() {
            *slot = delay;
        }
    }

    /// Run `hook` with the key before each delete is applied
    pub fn on_before_delete(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.before_delete.lock() {
            *slot = Some(Arc::new(hook));
        }
    }

    /// Number of delete calls received, successful or not
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Get the number of blobs in the store
    pub fn object_count(&self) -> usize {
        self.data.lock().map(|data| data.len()).unwrap_or(0)
    }

    /// Check if a blob exists without going through the async interface
    pub fn contains(&self, key: &str) -> bool {
        self.data
            .lock()
            .map(|data| data.contains_key(key))
            .unwrap_or(false)
    }

    /// Clear all data from the store
    pub fn clear(&self) {
        if let Ok(mut data) = self.data.lock() {
            data.clear();
        }
    }

    fn lock_error() -> BlobError {
        BlobError::Unavailable("mock blob store lock poisoned".to_string())
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<String, BlobError> {
        validate_key(key)?;
        let size = data.len();
        self.data
            .lock()
            .map_err(|_| Self::lock_error())?
            .insert(key.to_string(), data);
        info!("Mock: Stored blob {} with size {}", key, size);
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let data = self.data.lock().map_err(|_| Self::lock_error())?;
        data.get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delete_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable(format!("injected failure deleting {}", key)));
        }

        let hook = self.before_delete.lock().ok().and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook(key);
        }

        let removed = self
            .data
            .lock()
            .map_err(|_| Self::lock_error())?
            .remove(key)
            .is_some();
        info!("Mock: Deleted blob {} (existed: {})", key, removed);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.contains(key))
    }
}
