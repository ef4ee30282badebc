//! Wiring of production collaborators, plus the CLI command bodies.
//!
//! [`build_service`] assembles SQLite, S3, and the OpenAI-compatible client
//! into a [`DocumentService`]. The `run_*` functions back the `docai`
//! subcommands and print their results to stdout.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::{Analyzer, OpenAiCompatibleClient};
use crate::config::Config;
use crate::db;
use crate::extract::{extract_text, DocumentFormat};
use crate::migrate::run_migrations;
use crate::models::Document;
use crate::repository::{DocumentRepository, SqliteDocumentRepository};
use crate::service::DocumentService;
use crate::storage::{S3StorageClient, StorageClient};

/// Open the database, applying migrations if needed.
pub async fn open_repository(config: &Config) -> Result<Arc<SqliteDocumentRepository>> {
    let pool = db::connect(config).await?;
    run_migrations(&pool)
        .await
        .context("Failed to apply database migrations")?;
    Ok(Arc::new(SqliteDocumentRepository::new(pool)))
}

async fn open_storage(config: &Config) -> Result<Arc<S3StorageClient>> {
    let storage =
        S3StorageClient::new(&config.storage).context("Failed to configure object storage")?;
    storage
        .ensure_bucket()
        .await
        .with_context(|| format!("Failed to ensure bucket '{}'", config.storage.bucket))?;
    Ok(Arc::new(storage))
}

/// Build the production [`DocumentService`].
///
/// Fails if the database cannot be opened or the bucket cannot be ensured.
/// A missing model API key is only reported when an analysis runs.
pub async fn build_service(config: &Config) -> Result<Arc<DocumentService>> {
    let repo = open_repository(config).await?;
    let storage = open_storage(config).await?;

    if config.analyzer.api_key.is_none() {
        tracing::warn!("no model API key configured; analysis requests will fail");
    }
    let client = OpenAiCompatibleClient::new(&config.analyzer)
        .context("Failed to build completion client")?;
    let analyzer = Arc::new(Analyzer::new(Arc::new(client), &config.analyzer));

    Ok(Arc::new(DocumentService::new(repo, storage, analyzer)))
}

/// A token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling");
            on_signal.cancel();
        }
    });
    cancel
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid document id: {}", raw))
}

fn print_document(doc: &Document) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(doc)?);
    Ok(())
}

/// `docai init`
pub async fn run_init(config: &Config) -> Result<()> {
    open_repository(config).await?;
    println!("Database initialized at {}", config.db.path.display());
    open_storage(config).await?;
    println!("Bucket '{}' ready.", config.storage.bucket);
    Ok(())
}

/// `docai upload <path>`
pub async fn run_upload(
    config: &Config,
    path: &Path,
    content_type: Option<&str>,
    analyze: bool,
) -> Result<()> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Not a file path: {}", path.display()))?;
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let service = build_service(config).await?;
    let cancel = interrupt_token();

    let mut doc = service
        .upload_document(filename, file, content_type.unwrap_or(""), &cancel)
        .await?;
    if analyze {
        doc = service.analyze_document(doc.id, &cancel).await?;
    }
    print_document(&doc)
}

/// `docai analyze <id>`
pub async fn run_analyze(config: &Config, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    if config.analyzer.api_key.is_none() {
        bail!("No model API key configured (set OPENROUTER_API_KEY or OPENAI_API_KEY)");
    }
    let service = build_service(config).await?;
    let doc = service.analyze_document(id, &interrupt_token()).await?;
    print_document(&doc)
}

/// `docai get <id>`
///
/// Reads the record straight from the database; storage and model
/// credentials are not needed.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let repo = open_repository(config).await?;
    match repo.find_by_id(id).await {
        Ok(doc) => print_document(&doc),
        Err(e) if repo.is_not_found_error(&e) => bail!("document not found: {}", id),
        Err(e) => Err(e.into()),
    }
}

/// `docai extract <path>`: print extracted text without storing anything.
pub fn run_extract(path: &Path) -> Result<()> {
    let filename = path.to_string_lossy();
    let format = DocumentFormat::from_filename(&filename)
        .with_context(|| format!("Unsupported file type: {}", path.display()))?;
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = extract_text(format, &bytes)
        .with_context(|| format!("Failed to extract text from {}", path.display()))?;
    print!("{}", text);
    Ok(())
}
