//! In-memory [`StorageClient`] used by tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ByteStream, StorageClient, StorageError};

#[derive(Default)]
pub struct InMemoryStorage {
    objects: RwLock<HashMap<String, (Bytes, String)>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    fail_deletes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `upload_file` calls.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `delete_file` calls, including injected failures.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make every subsequent `delete_file` fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, object_name: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(object_name)
    }

    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn content_type(&self, object_name: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(object_name)
            .map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl StorageClient for InMemoryStorage {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn upload_file(
        &self,
        object_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(object_name.to_string(), (data, content_type.to_string()));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("memory://{}", object_name))
    }

    async fn delete_file(&self, object_name: &str) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "injected delete failure for {}",
                object_name
            )));
        }
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(object_name);
        Ok(())
    }

    async fn get_file_url(&self, object_name: &str) -> Result<String, StorageError> {
        if !self.contains(object_name) {
            return Err(StorageError::NotFound(object_name.to_string()));
        }
        Ok(format!("memory://{}?expires=3600", object_name))
    }

    async fn get_file_content(&self, object_name: &str) -> Result<ByteStream, StorageError> {
        let data = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(object_name)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(object_name.to_string()))?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }
}
