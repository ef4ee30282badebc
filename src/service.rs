//! Upload and analysis workflows.
//!
//! [`DocumentService`] coordinates extraction, the object store, the
//! repository, and the analyzer. Every collaborator is shared behind an
//! `Arc`; the only state of its own is the set of documents with an analysis
//! in flight.
//!
//! # Upload
//!
//! ```text
//! buffer → dedup by filename → extract (blocking pool) → reject blank
//!        → put blob → create record ─┬─ ok → Document
//!                                    └─ err/cancel → delete blob, return error
//! ```
//!
//! # Analysis
//!
//! Status moves `uploaded → processing → analyzed` and never backward.
//!
//! A second analysis of a document that already has one in flight in this
//! service is rejected with [`ServiceError::AlreadyProcessing`] before the
//! model is called. Across services sharing a repository, the final write is
//! conditional on the status and `updated_at` observed when the document was
//! loaded, so of two racing analyses exactly one succeeds. The other fails
//! with [`ServiceError::StatusConflict`] if the status moved, or
//! [`ServiceError::ConcurrentUpdate`] if only the record did (re-analysis of
//! an `analyzed` document).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::{AnalyzeError, Analyzer};
use crate::extract::{extract_text, DocumentFormat, ExtractError};
use crate::models::{Document, DocumentStatus, NewDocument};
use crate::repository::{DocumentRepository, RepoError};
use crate::storage::{ByteStream, StorageClient, StorageError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("document {0} not found")]
    NotFound(Uuid),
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),
    #[error("failed to read upload: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to extract text from {filename}: {source}")]
    Extraction {
        filename: String,
        #[source]
        source: ExtractError,
    },
    #[error("upload rejected: no text could be extracted from document")]
    EmptyContent,
    #[error("document {0} has no extracted text; analysis skipped")]
    AnalysisSkipped(Uuid),
    #[error("document {0} is already being processed")]
    AlreadyProcessing(Uuid),
    #[error("document {id} changed concurrently: expected status {expected}, found {actual}")]
    StatusConflict {
        id: Uuid,
        expected: DocumentStatus,
        actual: DocumentStatus,
    },
    #[error("document {0} was modified by a concurrent request")]
    ConcurrentUpdate(Uuid),
    #[error("document {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    },
    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalyzeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repository(RepoError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServiceError {
    fn repo(id: Uuid, err: RepoError) -> Self {
        match err {
            RepoError::NotFound => ServiceError::NotFound(id),
            RepoError::StatusConflict { expected, actual } => ServiceError::StatusConflict {
                id,
                expected,
                actual,
            },
            RepoError::ConcurrentUpdate => ServiceError::ConcurrentUpdate(id),
            other => ServiceError::Repository(other),
        }
    }
}

pub struct DocumentService {
    repo: Arc<dyn DocumentRepository>,
    storage: Arc<dyn StorageClient>,
    analyzer: Arc<Analyzer>,
    analyzing: Mutex<HashSet<Uuid>>,
}

/// Marks a document as being analyzed by this service until dropped.
struct AnalysisClaim<'a> {
    analyzing: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for AnalysisClaim<'_> {
    fn drop(&mut self) {
        self.analyzing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl DocumentService {
    pub fn new(
        repo: Arc<dyn DocumentRepository>,
        storage: Arc<dyn StorageClient>,
        analyzer: Arc<Analyzer>,
    ) -> Self {
        Self {
            repo,
            storage,
            analyzer,
            analyzing: Mutex::new(HashSet::new()),
        }
    }

    /// Ingest a file.
    ///
    /// A file whose name is already known returns the existing record
    /// untouched. Otherwise the text is extracted, the raw bytes are stored as
    /// `{unix_seconds}_{filename}`, and a record with status `uploaded` is
    /// created. If the record cannot be created, or `cancel` fires after the
    /// blob was written, the blob is deleted again.
    pub async fn upload_document<R>(
        &self,
        filename: &str,
        mut reader: R,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Document, ServiceError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(ServiceError::Read)?;

        match self.repo.find_by_filename(filename).await {
            Ok(existing) => {
                tracing::info!(id = %existing.id, filename, "duplicate upload; returning existing document");
                return Ok(existing);
            }
            Err(e) if self.repo.is_not_found_error(&e) => {}
            Err(e) => return Err(ServiceError::Repository(e)),
        }

        let format = DocumentFormat::from_filename(filename)
            .ok_or_else(|| ServiceError::UnsupportedFormat(filename.to_string()))?;
        let content_type = if content_type.trim().is_empty() {
            format.mime_type().to_string()
        } else {
            content_type.to_string()
        };

        let data = Bytes::from(buf);
        let text = {
            let data = data.clone();
            tokio::task::spawn_blocking(move || extract_text(format, &data))
                .await?
                .map_err(|source| ServiceError::Extraction {
                    filename: filename.to_string(),
                    source,
                })?
        };
        if text.trim().is_empty() {
            tracing::debug!(filename, "rejecting upload with no extractable text");
            return Err(ServiceError::EmptyContent);
        }

        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        let object_name = format!("{}_{}", chrono::Utc::now().timestamp(), filename);
        let size = data.len();
        let file_url = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // The put may have landed before it was abandoned.
                self.discard_blob(&object_name).await;
                return Err(ServiceError::Cancelled);
            }
            res = self.storage.upload_file(&object_name, data, &content_type) => res?,
        };

        if cancel.is_cancelled() {
            self.discard_blob(&object_name).await;
            return Err(ServiceError::Cancelled);
        }

        let new = NewDocument {
            filename: filename.to_string(),
            content_type,
            storage_path: object_name.clone(),
            file_url,
            extracted_text: text,
        };
        let doc = match self.repo.create(new).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(filename, object = %object_name, error = %e, "failed to persist document");
                self.discard_blob(&object_name).await;
                return Err(ServiceError::Repository(e));
            }
        };

        tracing::info!(id = %doc.id, filename, object = %object_name, size, "document uploaded");
        Ok(doc)
    }

    /// Analyze a document on request.
    ///
    /// Rejects documents already `processing` or with an analysis in flight.
    /// Documents that are `uploaded` or `analyzed` are (re-)analyzed and end
    /// `analyzed`.
    pub async fn analyze_document(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Document, ServiceError> {
        let _claim = self.claim_analysis(id)?;
        let doc = self.get_document(id).await?;
        if doc.status == DocumentStatus::Processing {
            return Err(ServiceError::AlreadyProcessing(id));
        }
        self.run_analysis(doc, cancel).await
    }

    /// Analyze a document previously claimed with status `processing`.
    ///
    /// Used by the background workers that own the claim.
    pub async fn analyze_claimed(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Document, ServiceError> {
        let _claim = self.claim_analysis(id)?;
        let doc = self.get_document(id).await?;
        if doc.status != DocumentStatus::Processing {
            return Err(ServiceError::StatusConflict {
                id,
                expected: DocumentStatus::Processing,
                actual: doc.status,
            });
        }
        self.run_analysis(doc, cancel).await
    }

    fn claim_analysis(&self, id: Uuid) -> Result<AnalysisClaim<'_>, ServiceError> {
        let mut analyzing = self.analyzing.lock().unwrap_or_else(PoisonError::into_inner);
        if !analyzing.insert(id) {
            tracing::debug!(id = %id, "analysis already in flight");
            return Err(ServiceError::AlreadyProcessing(id));
        }
        Ok(AnalysisClaim {
            analyzing: &self.analyzing,
            id,
        })
    }

    async fn run_analysis(
        &self,
        mut doc: Document,
        cancel: &CancellationToken,
    ) -> Result<Document, ServiceError> {
        let id = doc.id;
        if !doc.has_text() {
            tracing::warn!(id = %id, "document has no extracted text; skipping analysis");
            return Err(ServiceError::AnalysisSkipped(id));
        }

        let observed = doc.status;
        let result = self
            .analyzer
            .analyze_text(&doc.extracted_text, cancel)
            .await
            .map_err(|e| match e {
                AnalyzeError::Cancelled => ServiceError::Cancelled,
                other => ServiceError::Analysis(other),
            })?;

        doc.apply_analysis(result);
        let updated = self
            .repo
            .update_if_status(&doc, observed)
            .await
            .map_err(|e| ServiceError::repo(id, e))?;

        tracing::info!(id = %id, doc_type = %updated.doc_type, "document analyzed");
        Ok(updated)
    }

    /// Move a document to `status`, refusing backward transitions.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
    ) -> Result<Document, ServiceError> {
        let mut doc = self.get_document(id).await?;
        let observed = doc.status;
        if !observed.can_transition_to(status) {
            return Err(ServiceError::InvalidTransition {
                id,
                from: observed,
                to: status,
            });
        }
        doc.status = status;
        self.repo
            .update_if_status(&doc, observed)
            .await
            .map_err(|e| ServiceError::repo(id, e))
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Document, ServiceError> {
        self.repo
            .find_by_id(id)
            .await
            .map_err(|e| ServiceError::repo(id, e))
    }

    /// Presigned download URL for the document's blob.
    pub async fn get_document_url(&self, id: Uuid) -> Result<String, ServiceError> {
        let doc = self.get_document(id).await?;
        Ok(self.storage.get_file_url(&doc.storage_path).await?)
    }

    /// The document record together with a stream of its raw bytes.
    pub async fn open_document_content(
        &self,
        id: Uuid,
    ) -> Result<(Document, ByteStream), ServiceError> {
        let doc = self.get_document(id).await?;
        let stream = self.storage.get_file_content(&doc.storage_path).await?;
        Ok((doc, stream))
    }

    /// Compensating delete. Failures are logged and swallowed.
    async fn discard_blob(&self, object_name: &str) {
        match self.storage.delete_file(object_name).await {
            Ok(()) => tracing::info!(object = object_name, "removed blob of failed upload"),
            Err(e) => tracing::error!(
                object = object_name,
                error = %e,
                "compensating delete failed; blob is orphaned"
            ),
        }
    }
}
