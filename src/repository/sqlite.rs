//! SQLite-backed [`DocumentRepository`] implementation.
//!
//! Ids are stored as hyphenated UUID text, timestamps as RFC 3339 text with
//! millisecond precision (which sorts lexicographically), and `metadata` as a
//! JSON object in `metadata_json`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Document, DocumentStatus, NewDocument};

use super::{ensure_text, next_updated_at, DocumentRepository, RepoError};

const SELECT_COLUMNS: &str = "SELECT id, filename, content_type, storage_path, file_url, \
     extracted_text, summary, doc_type, metadata_json, status, created_at, updated_at \
     FROM documents";

pub struct SqliteDocumentRepository {
    pool: SqlitePool,
}

impl SqliteDocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_status(&self, id: Uuid) -> Result<Option<DocumentStatus>, RepoError> {
        let row = sqlx::query("SELECT status FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_status(&r.get::<String, _>("status")))
            .transpose()
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, RepoError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepoError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_status(raw: &str) -> Result<DocumentStatus, RepoError> {
    raw.parse().map_err(RepoError::Corrupt)
}

fn metadata_to_json(metadata: &Map<String, Value>) -> Result<String, RepoError> {
    serde_json::to_string(metadata)
        .map_err(|e| RepoError::Corrupt(format!("unserializable metadata: {}", e)))
}

fn row_to_document(row: &SqliteRow) -> Result<Document, RepoError> {
    let raw_id: String = row.get("id");
    let id = Uuid::parse_str(&raw_id)
        .map_err(|e| RepoError::Corrupt(format!("bad id '{}': {}", raw_id, e)))?;

    let raw_metadata: String = row.get("metadata_json");
    let metadata = match serde_json::from_str::<Value>(&raw_metadata) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => Map::new(),
        Ok(other) => {
            return Err(RepoError::Corrupt(format!(
                "metadata for {} is not an object: {}",
                id, other
            )))
        }
        Err(e) => return Err(RepoError::Corrupt(format!("bad metadata for {}: {}", id, e))),
    };

    Ok(Document {
        id,
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        storage_path: row.get("storage_path"),
        file_url: row.get("file_url"),
        extracted_text: row.get("extracted_text"),
        summary: row.get("summary"),
        doc_type: row.get("doc_type"),
        metadata,
        status: parse_status(&row.get::<String, _>("status"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[async_trait]
impl DocumentRepository for SqliteDocumentRepository {
    async fn create(&self, new: NewDocument) -> Result<Document, RepoError> {
        ensure_text(&new.extracted_text)?;
        let ts = now();
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
            created_at: ts,
            updated_at: ts,
        };

        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, content_type, storage_path, file_url,
                                   extracted_text, summary, doc_type, metadata_json,
                                   status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc.id.to_string())
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(&doc.storage_path)
        .bind(&doc.file_url)
        .bind(&doc.extracted_text)
        .bind(&doc.summary)
        .bind(&doc.doc_type)
        .bind(metadata_to_json(&doc.metadata)?)
        .bind(doc.status.as_str())
        .bind(format_ts(&doc.created_at))
        .bind(format_ts(&doc.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(doc)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Document, RepoError> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepoError::NotFound)?;
        row_to_document(&row)
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Document, RepoError> {
        let row = sqlx::query(&format!(
            "{} WHERE filename = ? ORDER BY created_at ASC, rowid ASC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepoError::NotFound)?;
        row_to_document(&row)
    }

    async fn update(&self, doc: &Document) -> Result<Document, RepoError> {
        ensure_text(&doc.extracted_text)?;
        let mut stored = doc.clone();
        stored.updated_at = now();

        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, content_type, storage_path, file_url,
                                   extracted_text, summary, doc_type, metadata_json,
                                   status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                storage_path = excluded.storage_path,
                file_url = excluded.file_url,
                extracted_text = excluded.extracted_text,
                summary = excluded.summary,
                doc_type = excluded.doc_type,
                metadata_json = excluded.metadata_json,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(stored.id.to_string())
        .bind(&stored.filename)
        .bind(&stored.content_type)
        .bind(&stored.storage_path)
        .bind(&stored.file_url)
        .bind(&stored.extracted_text)
        .bind(&stored.summary)
        .bind(&stored.doc_type)
        .bind(metadata_to_json(&stored.metadata)?)
        .bind(stored.status.as_str())
        .bind(format_ts(&stored.created_at))
        .bind(format_ts(&stored.updated_at))
        .execute(&self.pool)
        .await?;

        // created_at is never rewritten on conflict; report the stored value.
        self.find_by_id(stored.id).await
    }

    async fn update_if_status(
        &self,
        doc: &Document,
        expected: DocumentStatus,
    ) -> Result<Document, RepoError> {
        ensure_text(&doc.extracted_text)?;
        let updated_at = next_updated_at(doc.updated_at);

        let result = sqlx::query(
            r#"
            UPDATE documents SET
                filename = ?,
                content_type = ?,
                storage_path = ?,
                file_url = ?,
                extracted_text = ?,
                summary = ?,
                doc_type = ?,
                metadata_json = ?,
                status = ?,
                updated_at = ?
            WHERE id = ? AND status = ? AND updated_at = ?
            "#,
        )
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(&doc.storage_path)
        .bind(&doc.file_url)
        .bind(&doc.extracted_text)
        .bind(&doc.summary)
        .bind(&doc.doc_type)
        .bind(metadata_to_json(&doc.metadata)?)
        .bind(doc.status.as_str())
        .bind(format_ts(&updated_at))
        .bind(doc.id.to_string())
        .bind(expected.as_str())
        .bind(format_ts(&doc.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.fetch_status(doc.id).await? {
                None => Err(RepoError::NotFound),
                Some(actual) if actual != expected => {
                    Err(RepoError::StatusConflict { expected, actual })
                }
                // Same status, different `updated_at`.
                Some(_) => Err(RepoError::ConcurrentUpdate),
            };
        }

        self.find_by_id(doc.id).await
    }
}
