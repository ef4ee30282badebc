//! Shared fixtures and test doubles for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Barrier, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docai::analyzer::{Analyzer, CompletionClient, CompletionError};
use docai::config::AnalyzerConfig;
use docai::models::{Document, DocumentStatus, NewDocument};
use docai::repository::{DocumentRepository, InMemoryDocumentRepository, RepoError};
use docai::service::DocumentService;
use docai::storage::{ByteStream, InMemoryStorage, StorageClient, StorageError};

pub const INVOICE_REPLY: &str = "```json\n{\"summary\":\"An invoice for consulting.\",\"type\":\"Invoice\",\"metadata\":{\"invoice_number\":\"INV-7\",\"total_amount\":\"120.00\"}}\n```";

/// Completion double that returns a fixed reply and counts calls.
///
/// With a barrier installed, every call waits until `n` calls are in flight.
/// With a gate installed, every call waits for one [`release`](Self::release).
pub struct ScriptedCompletions {
    reply: Result<String, u16>,
    calls: AtomicUsize,
    barrier: Option<Barrier>,
    gate: Option<Notify>,
}

impl ScriptedCompletions {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            calls: AtomicUsize::new(0),
            barrier: None,
            gate: None,
        })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(status),
            calls: AtomicUsize::new(0),
            barrier: None,
            gate: None,
        })
    }

    pub fn rendezvous(reply: &str, n: usize) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            calls: AtomicUsize::new(0),
            barrier: Some(Barrier::new(n)),
            gate: None,
        })
    }

    pub fn gated(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            calls: AtomicUsize::new(0),
            barrier: None,
            gate: Some(Notify::new()),
        })
    }

    /// Let one gated call through.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    /// Wait until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..100 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} completion calls, saw {}", n, self.calls());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletions {
    async fn complete(&self, _model: &str, _prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.reply {
            Ok(reply) => Ok(reply.clone()),
            Err(status) => Err(CompletionError::Status {
                status: *status,
                body: "upstream unavailable".to_string(),
            }),
        }
    }
}

/// Repository whose `create` always fails; everything else delegates.
pub struct FailingCreateRepo {
    pub inner: InMemoryDocumentRepository,
}

impl FailingCreateRepo {
    pub fn new() -> Self {
        Self {
            inner: InMemoryDocumentRepository::new(),
        }
    }
}

#[async_trait]
impl DocumentRepository for FailingCreateRepo {
    async fn create(&self, _doc: NewDocument) -> Result<Document, RepoError> {
        Err(RepoError::Database(sqlx::Error::PoolTimedOut))
    }
    async fn find_by_id(&self, id: Uuid) -> Result<Document, RepoError> {
        self.inner.find_by_id(id).await
    }
    async fn find_by_filename(&self, filename: &str) -> Result<Document, RepoError> {
        self.inner.find_by_filename(filename).await
    }
    async fn update(&self, doc: &Document) -> Result<Document, RepoError> {
        self.inner.update(doc).await
    }
    async fn update_if_status(
        &self,
        doc: &Document,
        expected: DocumentStatus,
    ) -> Result<Document, RepoError> {
        self.inner.update_if_status(doc, expected).await
    }
}

/// How [`FaultyStorage`] misbehaves on upload.
pub enum UploadFault {
    /// Store the object, then never answer.
    Hang,
    /// Store the object, cancel the given token, then succeed.
    CancelAfter(CancellationToken),
}

/// Storage wrapper that injects upload faults in front of [`InMemoryStorage`].
pub struct FaultyStorage {
    pub inner: Arc<InMemoryStorage>,
    fault: UploadFault,
}

impl FaultyStorage {
    pub fn new(fault: UploadFault) -> Self {
        Self {
            inner: Arc::new(InMemoryStorage::new()),
            fault,
        }
    }
}

#[async_trait]
impl StorageClient for FaultyStorage {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        self.inner.ensure_bucket().await
    }

    async fn upload_file(
        &self,
        object_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let url = self.inner.upload_file(object_name, data, content_type).await?;
        match &self.fault {
            UploadFault::Hang => std::future::pending().await,
            UploadFault::CancelAfter(token) => {
                token.cancel();
                Ok(url)
            }
        }
    }

    async fn delete_file(&self, object_name: &str) -> Result<(), StorageError> {
        self.inner.delete_file(object_name).await
    }

    async fn get_file_url(&self, object_name: &str) -> Result<String, StorageError> {
        self.inner.get_file_url(object_name).await
    }

    async fn get_file_content(&self, object_name: &str) -> Result<ByteStream, StorageError> {
        self.inner.get_file_content(object_name).await
    }
}

pub fn analyzer(client: Arc<dyn CompletionClient>) -> Arc<Analyzer> {
    Arc::new(Analyzer::new(client, &AnalyzerConfig::default()))
}

pub fn service(
    repo: Arc<dyn DocumentRepository>,
    storage: Arc<dyn StorageClient>,
    client: Arc<dyn CompletionClient>,
) -> Arc<DocumentService> {
    Arc::new(DocumentService::new(repo, storage, analyzer(client)))
}

/// Build a minimal DOCX archive with one `<w:p>` per paragraph.
pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("[Content_Types].xml", options).unwrap();
        zip.write_all(b"<Types/>").unwrap();
        zip.start_file("word/document.xml", options).unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    cursor.into_inner()
}

/// A record that predates the non-empty text rule.
pub fn legacy_blank_document(filename: &str) -> Document {
    let now = chrono::Utc::now();
    Document {
        id: Uuid::new_v4(),
        filename: filename.to_string(),
        content_type: "text/plain".to_string(),
        storage_path: format!("1600000000_{}", filename),
        file_url: String::new(),
        extracted_text: "   ".to_string(),
        summary: String::new(),
        doc_type: String::new(),
        metadata: serde_json::Map::new(),
        status: DocumentStatus::Uploaded,
        created_at: now,
        updated_at: now,
    }
}

/// Poll until the document reaches `status`, or panic after five seconds.
pub async fn wait_for_status(
    repo: &dyn DocumentRepository,
    id: Uuid,
    status: DocumentStatus,
) -> Document {
    for _ in 0..100 {
        let doc = repo.find_by_id(id).await.unwrap();
        if doc.status == status {
            return doc;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("document {} never reached status {}", id, status);
}
