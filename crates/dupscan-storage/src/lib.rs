//! Storage boundary for duplicate detection: document lookup and finding persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use dupscan_core::{DocumentRecord, DuplicateFinding};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

pub const CRATE_NAME: &str = "dupscan-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed stored record: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read side: source lookup plus the batch/project hierarchy used to scope candidates.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    async fn project_for_batch(&self, batch_id: &str) -> Result<Option<String>, StoreError>;

    async fn batches_in_project(&self, project_id: &str) -> Result<Vec<String>, StoreError>;

    /// Documents of `batch_ids` other than `exclude_id`, oldest first, at most `limit`.
    async fn documents_in_batches(
        &self,
        batch_ids: &[String],
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError>;
}

/// Write side: one new row per finding. No merge with earlier findings for the same pair.
#[async_trait]
pub trait FindingSink: Send + Sync {
    async fn insert_finding(&self, finding: &DuplicateFinding) -> Result<(), StoreError>;
}

/// Flattens a JSON object of extracted fields into strings.
///
/// Numbers and booleans are stringified (zip codes often arrive as numbers),
/// nulls are dropped, and nested values are rejected.
pub fn fields_from_json(value: JsonValue) -> Result<BTreeMap<String, String>, StoreError> {
    let object = match value {
        JsonValue::Object(map) => map,
        JsonValue::Null => return Ok(BTreeMap::new()),
        other => {
            return Err(StoreError::Decode(format!(
                "document fields must be an object, got {other}"
            )))
        }
    };

    let mut out = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            JsonValue::Null => continue,
            JsonValue::String(s) => s,
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            nested => {
                return Err(StoreError::Decode(format!(
                    "field {key} holds a nested value: {nested}"
                )))
            }
        };
        out.insert(key, text);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<DocumentRecord, StoreError> {
        let fields: Option<JsonValue> = row.try_get("fields")?;
        Ok(DocumentRecord {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            fields: fields_from_json(fields.unwrap_or(JsonValue::Null))?,
        })
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, batch_id, fields
              FROM documents
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::document_from_row).transpose()
    }

    async fn project_for_batch(&self, batch_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT project_id
              FROM batches
             WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>("project_id")?),
            None => Ok(None),
        }
    }

    async fn batches_in_project(&self, project_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM batches
             WHERE project_id = $1
             ORDER BY id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("id")?);
        }
        Ok(out)
    }

    async fn documents_in_batches(
        &self,
        batch_ids: &[String],
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        if batch_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, fields
              FROM documents
             WHERE batch_id = ANY($1)
               AND id <> $2
             ORDER BY created_at, id
             LIMIT $3
            "#,
        )
        .bind(batch_ids)
        .bind(exclude_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::document_from_row).collect()
    }
}

#[async_trait]
impl FindingSink for PgStore {
    async fn insert_finding(&self, finding: &DuplicateFinding) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO duplicate_findings
                (id, source_document_id, candidate_document_id, duplicate_type,
                 similarity_score, field_scores, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(finding.id)
        .bind(&finding.source_document_id)
        .bind(&finding.candidate_document_id)
        .bind(finding.duplicate_type.as_str())
        .bind(finding.similarity_score)
        .bind(sqlx::types::Json(&finding.field_scores))
        .bind(finding.status.as_str())
        .bind(finding.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    batches: Vec<FixtureBatch>,
    #[serde(default)]
    documents: Vec<FixtureDocument>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureBatch {
    id: String,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureDocument {
    id: String,
    batch_id: String,
    #[serde(default)]
    fields: JsonValue,
}

#[derive(Debug, Default)]
struct MemoryState {
    batch_projects: HashMap<String, Option<String>>,
    documents: Vec<DocumentRecord>,
    findings: Vec<DuplicateFinding>,
    failing_candidates: HashSet<String>,
}

/// Process-local store backed by a JSON fixture. Documents keep insertion order.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_fixture_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_fixture_json(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_fixture_json(text: &str) -> anyhow::Result<Self> {
        let fixture: FixtureFile = serde_json::from_str(text)?;
        let mut state = MemoryState::default();
        for batch in fixture.batches {
            state.batch_projects.insert(batch.id, batch.project_id);
        }
        for doc in fixture.documents {
            let fields = fields_from_json(doc.fields)
                .with_context(|| format!("decoding fields of document {}", doc.id))?;
            state.documents.push(DocumentRecord {
                id: doc.id,
                batch_id: doc.batch_id,
                fields,
            });
        }
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub async fn add_batch(&self, batch_id: &str, project_id: Option<&str>) {
        self.state
            .write()
            .await
            .batch_projects
            .insert(batch_id.to_string(), project_id.map(ToString::to_string));
    }

    pub async fn add_document(&self, doc: DocumentRecord) {
        let mut state = self.state.write().await;
        state.batch_projects.entry(doc.batch_id.clone()).or_insert(None);
        state.documents.push(doc);
    }

    /// Makes every later insert for `candidate_id` fail with `StoreError::Unavailable`.
    pub async fn fail_inserts_for(&self, candidate_id: &str) {
        self.state
            .write()
            .await
            .failing_candidates
            .insert(candidate_id.to_string());
    }

    pub async fn findings(&self) -> Vec<DuplicateFinding> {
        self.state.read().await.findings.clone()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.documents.iter().find(|d| d.id == id).cloned())
    }

    async fn project_for_batch(&self, batch_id: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state.batch_projects.get(batch_id).cloned().flatten())
    }

    async fn batches_in_project(&self, project_id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .batch_projects
            .iter()
            .filter(|(_, p)| p.as_deref() == Some(project_id))
            .map(|(b, _)| b.clone())
            .collect::<Vec<_>>();
        out.sort();
        Ok(out)
    }

    async fn documents_in_batches(
        &self,
        batch_ids: &[String],
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .iter()
            .filter(|d| d.id != exclude_id && batch_ids.contains(&d.batch_id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FindingSink for InMemoryStore {
    async fn insert_finding(&self, finding: &DuplicateFinding) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.failing_candidates.contains(&finding.candidate_document_id) {
            return Err(StoreError::Unavailable(format!(
                "insert rejected for candidate {}",
                finding.candidate_document_id
            )));
        }
        state.findings.push(finding.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupscan_core::{DuplicateType, FieldScores, NormalizedKey};
    use serde_json::json;
    use tempfile::tempdir;

    const FIXTURE: &str = r#"{
        "batches": [
            {"id": "b1", "project_id": "p1"},
            {"id": "b2", "project_id": "p1"},
            {"id": "b9", "project_id": "p2"},
            {"id": "orphan"}
        ],
        "documents": [
            {"id": "d1", "batch_id": "b1", "fields": {"name": "Robert Smith", "zip": 62701}},
            {"id": "d2", "batch_id": "b1", "fields": {"name": "Robert Smitt", "city": null}},
            {"id": "d3", "batch_id": "b2", "fields": {}},
            {"id": "d4", "batch_id": "b9"}
        ]
    }"#;

    #[test]
    fn fields_are_stringified_and_nulls_dropped() {
        let fields = fields_from_json(json!({"zip": 62701, "name": "A", "city": null, "ok": true}))
            .expect("decode");
        assert_eq!(fields.get("zip").map(String::as_str), Some("62701"));
        assert_eq!(fields.get("ok").map(String::as_str), Some("true"));
        assert!(!fields.contains_key("city"));
        assert!(fields_from_json(json!({"name": {"first": "A"}})).is_err());
        assert!(fields_from_json(json!(["a"])).is_err());
        assert!(fields_from_json(JsonValue::Null).expect("null").is_empty());
    }

    #[tokio::test]
    async fn fixture_store_resolves_batch_hierarchy() {
        let store = InMemoryStore::from_fixture_json(FIXTURE).expect("fixture");
        assert_eq!(store.project_for_batch("b2").await.unwrap(), Some("p1".to_string()));
        assert_eq!(store.project_for_batch("orphan").await.unwrap(), None);
        assert_eq!(store.project_for_batch("missing").await.unwrap(), None);
        assert_eq!(
            store.batches_in_project("p1").await.unwrap(),
            vec!["b1".to_string(), "b2".to_string()]
        );

        let docs = store
            .documents_in_batches(&["b1".to_string(), "b2".to_string()], "d1", 10)
            .await
            .unwrap();
        let ids = docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["d2", "d3"]);

        let limited = store
            .documents_in_batches(&["b1".to_string(), "b2".to_string()], "d9", 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "d1");
    }

    #[tokio::test]
    async fn fixture_file_loads_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, FIXTURE).expect("write fixture");
        let store = InMemoryStore::from_fixture_file(&path).await.expect("load");
        let doc = store.get_document("d1").await.unwrap().expect("d1 present");
        assert_eq!(doc.field("zip"), Some("62701"));
        assert!(store.get_document("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inserts_are_recorded_and_can_be_forced_to_fail() {
        let store = InMemoryStore::new();
        store.fail_inserts_for("bad").await;
        let mk = |candidate: &str| {
            DuplicateFinding::pending(
                "src",
                candidate,
                DuplicateType::Name,
                FieldScores { name: 1.0, address: 0.0 },
                NormalizedKey::default(),
                NormalizedKey::default(),
            )
        };

        store.insert_finding(&mk("good")).await.expect("good insert");
        store.insert_finding(&mk("good")).await.expect("repeat insert");
        let err = store.insert_finding(&mk("bad")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.findings().await.len(), 2);
    }
}
