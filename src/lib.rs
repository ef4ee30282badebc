//! # docai
//!
//! Document ingestion and AI analysis service.
//!
//! Uploaded PDF, DOCX, and plain-text files have their text extracted, their
//! raw bytes stored in an S3-compatible bucket, and a record persisted in
//! SQLite. On request (or right after upload) a language model produces a
//! summary, a document type, and flat key/value metadata.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!  HTTP / CLI ───▶│ DocumentSvc  │──▶ extract (PDF / DOCX / TXT)
//!                 └──┬────┬────┬─┘
//!                    │    │    └──▶ Analyzer ──▶ CompletionClient
//!                    │    └───────▶ StorageClient (S3 / memory)
//!                    └────────────▶ DocumentRepository (SQLite / memory)
//!                          ▲
//!              AnalysisWorkers (background queue)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Document record and status state machine |
//! | [`extract`] | Format-specific text extraction |
//! | [`analyzer`] | Language-model analysis |
//! | [`repository`] | Record persistence trait and backends |
//! | [`storage`] | Object storage trait and backends |
//! | [`service`] | Upload and analysis workflows |
//! | [`worker`] | Background analysis pool |
//! | [`server`] | HTTP API |
//! | [`app`] | Production wiring and CLI commands |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |

pub mod analyzer;
pub mod app;
pub mod config;
pub mod db;
pub mod extract;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod repository;
pub mod server;
pub mod service;
pub mod storage;
pub mod worker;
