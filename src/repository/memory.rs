//! In-memory [`DocumentRepository`] for tests and single-process use.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Conditional updates hold the
//! write lock across the status and version check and the write, so they are
//! atomic with respect to each other.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;
use uuid::Uuid;

use crate::models::{Document, DocumentStatus, NewDocument};

use super::{ensure_text, next_updated_at, DocumentRepository, RepoError};

pub struct InMemoryDocumentRepository {
    docs: RwLock<HashMap<Uuid, Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts a record as-is, bypassing validation.
    ///
    /// Used to load fixtures such as legacy rows written before empty
    /// extractions were rejected.
    pub fn seed(&self, doc: Document) {
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc.id, doc);
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryDocumentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn create(&self, new: NewDocument) -> Result<Document, RepoError> {
        ensure_text(&new.extracted_text)?;
        let now = Utc::now();
        let doc = Document {
            id: Uuid::new_v4(),
            filename: new.filename,
            content_type: new.content_type,
            storage_path: new.storage_path,
            file_url: new.file_url,
            extracted_text: new.extracted_text,
            summary: String::new(),
            doc_type: String::new(),
            metadata: Map::new(),
            status: DocumentStatus::Uploaded,
            created_at: now,
            updated_at: now,
        };
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc.id, doc.clone());
        Ok(doc)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Document, RepoError> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Document, RepoError> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| d.filename == filename)
            .min_by_key(|d| d.created_at)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn update(&self, doc: &Document) -> Result<Document, RepoError> {
        ensure_text(&doc.extracted_text)?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let mut stored = doc.clone();
        stored.updated_at = Utc::now();
        if let Some(existing) = docs.get(&doc.id) {
            stored.created_at = existing.created_at;
        }
        docs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_if_status(
        &self,
        doc: &Document,
        expected: DocumentStatus,
    ) -> Result<Document, RepoError> {
        ensure_text(&doc.extracted_text)?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let existing = docs.get(&doc.id).ok_or(RepoError::NotFound)?;
        if existing.status != expected {
            return Err(RepoError::StatusConflict {
                expected,
                actual: existing.status,
            });
        }
        if existing.updated_at != doc.updated_at {
            return Err(RepoError::ConcurrentUpdate);
        }
        let mut stored = doc.clone();
        stored.created_at = existing.created_at;
        stored.updated_at = next_updated_at(existing.updated_at);
        docs.insert(stored.id, stored.clone());
        Ok(stored)
    }
}
