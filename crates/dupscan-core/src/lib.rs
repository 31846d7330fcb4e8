//! Core domain model for duplicate-record detection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dupscan-core";

pub const FIELD_NAME: &str = "name";
pub const FIELD_ADDRESS: &str = "address";
pub const FIELD_CITY: &str = "city";
pub const FIELD_ZIP: &str = "zip";

/// Extracted metadata for one captured document. Produced upstream, read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub batch_id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, batch_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            batch_id: batch_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Raw value for `key`, treating empty strings as absent.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Comparison keys derived from a document for one detection pass. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedKey {
    pub name: String,
    pub address: String,
}

/// Per-field minimum similarity scores. Passed explicitly on every call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityThresholds {
    pub name: f64,
    pub address: f64,
    /// Reserved for image-based signature comparison done outside this crate.
    pub signature: f64,
}

impl Default for SimilarityThresholds {
    fn default() -> Self {
        Self {
            name: 0.85,
            address: 0.90,
            signature: 0.85,
        }
    }
}

impl SimilarityThresholds {
    /// First threshold that is NaN or outside `[0, 1]`, if any.
    pub fn out_of_range(&self) -> Option<(&'static str, f64)> {
        [
            ("name", self.name),
            ("address", self.address),
            ("signature", self.signature),
        ]
        .into_iter()
        .find(|(_, v)| !(0.0..=1.0).contains(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateType {
    Name,
    Address,
    Combined,
}

impl DuplicateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Address => "address",
            Self::Combined => "combined",
        }
    }

    /// Label for a pair given which fields crossed their thresholds.
    pub fn from_flags(name: bool, address: bool) -> Option<Self> {
        match (name, address) {
            (true, true) => Some(Self::Combined),
            (true, false) => Some(Self::Name),
            (false, true) => Some(Self::Address),
            (false, false) => None,
        }
    }
}

/// Review state. Only an external reviewer moves a finding out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    #[default]
    Pending,
    Confirmed,
    Dismissed,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Dismissed => "dismissed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldScores {
    pub name: f64,
    pub address: f64,
}

impl FieldScores {
    pub fn mean(&self) -> f64 {
        (self.name + self.address) / 2.0
    }
}

/// A flagged (source, candidate) pair awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateFinding {
    pub id: Uuid,
    pub source_document_id: String,
    pub candidate_document_id: String,
    pub duplicate_type: DuplicateType,
    pub similarity_score: f64,
    pub field_scores: FieldScores,
    pub source_key: NormalizedKey,
    pub candidate_key: NormalizedKey,
    pub status: FindingStatus,
    pub created_at: DateTime<Utc>,
}

impl DuplicateFinding {
    pub fn pending(
        source_document_id: impl Into<String>,
        candidate_document_id: impl Into<String>,
        duplicate_type: DuplicateType,
        field_scores: FieldScores,
        source_key: NormalizedKey,
        candidate_key: NormalizedKey,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_document_id: source_document_id.into(),
            candidate_document_id: candidate_document_id.into(),
            duplicate_type,
            similarity_score: field_scores.mean(),
            field_scores,
            source_key,
            candidate_key,
            status: FindingStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_field_values_read_as_absent() {
        let doc = DocumentRecord::new("d1", "b1")
            .with_field(FIELD_NAME, "")
            .with_field(FIELD_CITY, "Springfield");
        assert_eq!(doc.field(FIELD_NAME), None);
        assert_eq!(doc.field(FIELD_ZIP), None);
        assert_eq!(doc.field(FIELD_CITY), Some("Springfield"));
    }

    #[test]
    fn thresholds_default_and_partial_deserialize() {
        let t: SimilarityThresholds = serde_json::from_str(r#"{"name":0.7}"#).unwrap();
        assert_eq!(t.name, 0.7);
        assert_eq!(t.address, 0.90);
        assert_eq!(t.signature, 0.85);
        assert!(t.out_of_range().is_none());
    }

    #[test]
    fn thresholds_reject_out_of_range_and_nan() {
        let t = SimilarityThresholds {
            address: 1.2,
            ..Default::default()
        };
        assert_eq!(t.out_of_range(), Some(("address", 1.2)));

        let t = SimilarityThresholds {
            signature: f64::NAN,
            ..Default::default()
        };
        assert_eq!(t.out_of_range().map(|(k, _)| k), Some("signature"));
    }

    #[test]
    fn duplicate_type_from_flags() {
        assert_eq!(DuplicateType::from_flags(true, true), Some(DuplicateType::Combined));
        assert_eq!(DuplicateType::from_flags(true, false), Some(DuplicateType::Name));
        assert_eq!(DuplicateType::from_flags(false, true), Some(DuplicateType::Address));
        assert_eq!(DuplicateType::from_flags(false, false), None);
    }

    #[test]
    fn pending_finding_scores_mean_of_both_fields() {
        let finding = DuplicateFinding::pending(
            "a",
            "b",
            DuplicateType::Name,
            FieldScores { name: 0.9, address: 0.0 },
            NormalizedKey::default(),
            NormalizedKey::default(),
        );
        assert_eq!(finding.status, FindingStatus::Pending);
        assert!((finding.similarity_score - 0.45).abs() < 1e-12);
        assert_eq!(
            serde_json::to_value(finding.duplicate_type).unwrap(),
            serde_json::json!("name")
        );
    }
}
