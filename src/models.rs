//! Core data models used throughout docai.
//!
//! These types represent the documents that flow through the upload and
//! analysis pipeline, and the status state machine that governs them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::analyzer::AnalysisResult;

/// Lifecycle state of a document.
///
/// Status only moves forward: `uploaded → processing → analyzed`. A document
/// that is already analyzed may be analyzed again, which keeps it `analyzed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Analyzed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Analyzed => "analyzed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Uploaded => 0,
            DocumentStatus::Processing => 1,
            DocumentStatus::Analyzed => 2,
        }
    }

    /// Returns `true` if moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        next.rank() > self.rank()
            || (*self == DocumentStatus::Analyzed && next == DocumentStatus::Analyzed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "processing" => Ok(DocumentStatus::Processing),
            "analyzed" => Ok(DocumentStatus::Analyzed),
            other => Err(format!("unknown document status: '{}'", other)),
        }
    }
}

/// A persisted document record.
///
/// The JSON projection omits `storage_path` and `file_url`; those are
/// internal to the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    #[serde(skip)]
    pub storage_path: String,
    #[serde(skip)]
    pub file_url: String,
    pub extracted_text: String,
    pub summary: String,
    pub doc_type: String,
    pub metadata: Map<String, Value>,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Overwrites the analysis fields and marks the document analyzed.
    pub fn apply_analysis(&mut self, result: AnalysisResult) {
        self.summary = result.summary;
        self.doc_type = result.doc_type;
        self.metadata = result.metadata;
        self.status = DocumentStatus::Analyzed;
    }

    pub fn has_text(&self) -> bool {
        !self.extracted_text.trim().is_empty()
    }
}

/// Fields supplied by the upload workflow when creating a record.
///
/// `id`, timestamps, and the initial `uploaded` status are assigned by the
/// repository on first successful persistence.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub content_type: String,
    pub storage_path: String,
    pub file_url: String,
    pub extracted_text: String,
}
