//! Persistence abstraction over document records.
//!
//! The [`DocumentRepository`] trait is the only way the service touches the
//! relational store. "Not found" is a first-class [`RepoError::NotFound`]
//! variant so callers branch on the error kind instead of matching strings.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`create`](DocumentRepository::create) | Insert a new record, assigning id and timestamps |
//! | [`find_by_id`](DocumentRepository::find_by_id) | Lookup by primary key |
//! | [`find_by_filename`](DocumentRepository::find_by_filename) | Dedup lookup by original filename |
//! | [`update`](DocumentRepository::update) | Full-record upsert by id |
//! | [`update_if_status`](DocumentRepository::update_if_status) | Upsert guarded by a compare-and-swap on status and `updated_at` |
//! | [`is_not_found_error`](DocumentRepository::is_not_found_error) | Distinguish "no such record" from other failures |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Document, DocumentStatus, NewDocument};

pub use memory::InMemoryDocumentRepository;
pub use sqlite::SqliteDocumentRepository;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("document not found")]
    NotFound,
    #[error("document status changed concurrently: expected {expected}, found {actual}")]
    StatusConflict {
        expected: DocumentStatus,
        actual: DocumentStatus,
    },
    #[error("document was modified concurrently")]
    ConcurrentUpdate,
    #[error("refusing to persist a document with empty extracted text")]
    EmptyText,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt document row: {0}")]
    Corrupt(String),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound)
    }
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Persist a new document with status `uploaded`.
    ///
    /// The repository assigns the id and both timestamps. Blank
    /// `extracted_text` is rejected with [`RepoError::EmptyText`].
    async fn create(&self, doc: NewDocument) -> Result<Document, RepoError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Document, RepoError>;

    /// Returns the oldest document with this filename.
    async fn find_by_filename(&self, filename: &str) -> Result<Document, RepoError>;

    /// Upsert every mutable field of `doc` by id and refresh `updated_at`.
    async fn update(&self, doc: &Document) -> Result<Document, RepoError>;

    /// Like [`update`](Self::update), but only if the stored record is the
    /// one the caller read.
    ///
    /// The stored status must still be `expected`, otherwise this fails with
    /// [`RepoError::StatusConflict`]. The stored `updated_at` must still equal
    /// `doc.updated_at`, otherwise this fails with
    /// [`RepoError::ConcurrentUpdate`]. A vanished record is
    /// [`RepoError::NotFound`]. Each successful write moves `updated_at`
    /// strictly forward, so it doubles as a version.
    async fn update_if_status(
        &self,
        doc: &Document,
        expected: DocumentStatus,
    ) -> Result<Document, RepoError>;

    fn is_not_found_error(&self, err: &RepoError) -> bool {
        err.is_not_found()
    }
}

/// Timestamp for the next conditional write of a record last written at
/// `prev`: now at millisecond precision, but always later than `prev`.
fn next_updated_at(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(3);
    if now > prev {
        now
    } else {
        prev + Duration::milliseconds(1)
    }
}

fn ensure_text(text: &str) -> Result<(), RepoError> {
    if text.trim().is_empty() {
        return Err(RepoError::EmptyText);
    }
    Ok(())
}
