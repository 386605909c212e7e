//! JSON file store
//!
//! One directory per store:
//!
//! ```text
//! <root>/
//!   _meta.json
//!   schema.json
//!   <table id>/<record id>.json
//! ```
//!
//! Queries load the whole table and filter in memory, so this backend suits
//! local development and small data sets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::{unwrap_references, Backend};
use crate::engine::error::{BackendError, BackendResult};
use crate::engine::evaluator::{compare_field, matches};
use crate::engine::query::Query;
use crate::engine::schema::{Record, Schema, Table, ID_FIELD};

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

const META_FILE: &str = "_meta.json";
const SCHEMA_FILE: &str = "schema.json";

/// Contents of `_meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMeta {
    engine: String,
    format_version: u32,
    created_at: DateTime<Utc>,
}

/// A stored record with bookkeeping fields
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    #[serde(rename = "_id")]
    id: String,

    #[serde(rename = "_created_at")]
    created_at: DateTime<Utc>,

    #[serde(rename = "_modified_at")]
    modified_at: DateTime<Utc>,

    #[serde(flatten)]
    data: Map<String, Value>,
}

impl Document {
    fn into_record(self) -> Record {
        let mut record = Record::from_json(Value::Object(self.data)).unwrap_or_default();
        record.set_id(self.id);
        record
    }
}

pub struct JsonFileBackend {
    root: PathBuf,
    /// Serialises writes; reads go straight to disk.
    write_lock: Mutex<()>,
}

impl JsonFileBackend {
    /// Initialise a store at `path` with `schema`.
    pub async fn create(path: &Path, schema: &Schema) -> BackendResult<Self> {
        fs::create_dir_all(path).await?;

        let meta = StoreMeta {
            engine: "recordhub-json".to_string(),
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
        };
        fs::write(path.join(META_FILE), serde_json::to_string_pretty(&meta)?).await?;

        let backend = Self {
            root: path.to_path_buf(),
            write_lock: Mutex::new(()),
        };
        backend.save_schema(schema).await?;
        Ok(backend)
    }

    /// Open an existing store.
    pub async fn open(path: &Path) -> BackendResult<Self> {
        let content = match fs::read_to_string(path.join(META_FILE)).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No JSON store at {}", path.display()),
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let meta: StoreMeta = serde_json::from_str(&content)?;
        if meta.format_version != FORMAT_VERSION {
            return Err(BackendError::Unsupported(format!(
                "store format version {} (expected {})",
                meta.format_version, FORMAT_VERSION
            )));
        }

        Ok(Self {
            root: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Open the store at `path`, initialising an empty one if none exists.
    pub async fn open_or_create(path: &Path) -> BackendResult<Self> {
        if fs::try_exists(path.join(META_FILE)).await? {
            Self::open(path).await
        } else {
            Self::create(path, &Schema::default()).await
        }
    }

    /// Replace the stored schema, creating directories for new tables.
    pub async fn save_schema(&self, schema: &Schema) -> BackendResult<()> {
        let _guard = self.write_lock.lock().await;
        for table in &schema.tables {
            fs::create_dir_all(self.root.join(&table.id)).await?;
        }
        fs::write(
            self.root.join(SCHEMA_FILE),
            serde_json::to_string_pretty(schema)?,
        )
        .await?;
        Ok(())
    }

    fn document_path(&self, table: &Table, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && !id.starts_with('_')
            && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.root.join(&table.id).join(format!("{}.json", id)))
    }

    async fn read_document(path: &Path) -> BackendResult<Option<Document>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(path: &Path, document: &Document) -> BackendResult<()> {
        fs::write(path, serde_json::to_string_pretty(document)?).await?;
        Ok(())
    }

    /// Every document of `table`, in id order.
    async fn all_documents(&self, table: &Table) -> BackendResult<Vec<Document>> {
        let dir = self.root.join(&table.id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_document = path.extension().map(|e| e == "json").unwrap_or(false)
                && path
                    .file_stem()
                    .map(|s| !s.to_string_lossy().starts_with('_'))
                    .unwrap_or(false);
            if is_document {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(document) = Self::read_document(&path).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }
}

#[async_trait]
impl Backend for JsonFileBackend {
    fn kind(&self) -> &'static str {
        "json"
    }

    async fn load_schema(&self) -> BackendResult<Schema> {
        let content = fs::read_to_string(self.root.join(SCHEMA_FILE)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn retrieve(&self, table: &Table, id: &str) -> BackendResult<Option<Record>> {
        let Some(path) = self.document_path(table, id) else {
            return Ok(None);
        };
        Ok(Self::read_document(&path).await?.map(Document::into_record))
    }

    async fn query(&self, table: &Table, query: &Query) -> BackendResult<Vec<Record>> {
        if let Some(view) = &query.view {
            debug!(table = %table.name, view = %view, "views are not supported by the JSON store, ignoring");
        }

        let mut records: Vec<Record> = self
            .all_documents(table)
            .await?
            .into_iter()
            .map(Document::into_record)
            .filter(|record| match &query.conditions {
                Some(condition) => matches(table, record, condition),
                None => true,
            })
            .collect();

        if !query.sort.is_empty() {
            records.sort_by(|a, b| {
                query
                    .sort
                    .iter()
                    .map(|s| {
                        let ordering = compare_field(table, &s.column, a, b);
                        if s.ascending {
                            ordering
                        } else {
                            ordering.reverse()
                        }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }

        Ok(query.paginate(records))
    }

    async fn save(&self, table: &Table, record: Record) -> BackendResult<Record> {
        let mut data = unwrap_references(table, &record);
        data.remove(ID_FIELD);

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let document = match record.id() {
            Some(id) => {
                let path = self
                    .document_path(table, id)
                    .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
                let existing = Self::read_document(&path)
                    .await?
                    .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
                let document = Document {
                    modified_at: now,
                    data,
                    ..existing
                };
                Self::write_document(&path, &document).await?;
                document
            }
            None => {
                let document = Document {
                    id: uuid::Uuid::now_v7().to_string(),
                    created_at: now,
                    modified_at: now,
                    data,
                };
                let dir = self.root.join(&table.id);
                fs::create_dir_all(&dir).await?;
                Self::write_document(&dir.join(format!("{}.json", document.id)), &document).await?;
                document
            }
        };

        Ok(document.into_record())
    }

    async fn delete(&self, table: &Table, id: &str) -> BackendResult<()> {
        let path = self
            .document_path(table, id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;

        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::query::{Condition, Operator, SortExpr};
    use crate::engine::schema::{Column, FieldValue};
    use serde_json::json;
    use tempfile::tempdir;

    fn people() -> Table {
        Table::new("tbl_people", "people", "name")
            .with_column(Column::text("name"))
            .with_column(Column::number("age"))
            .with_column(Column::foreign_key("manager", "tbl_people", false))
    }

    async fn store(path: &Path) -> JsonFileBackend {
        JsonFileBackend::create(path, &Schema::new(vec![people()]))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_lifecycle() {
        let dir = tempdir().unwrap();
        let backend = store(dir.path()).await;
        let table = people();

        let saved = backend
            .save(&table, Record::new().with("name", "Alice").with("age", json!(30)))
            .await
            .unwrap();
        let id = saved.id().unwrap().to_string();
        assert!(dir.path().join("tbl_people").join(format!("{}.json", id)).exists());

        let fetched = backend.retrieve(&table, &id).await.unwrap().unwrap();
        assert_eq!(fetched.get("name"), Some(&FieldValue::from("Alice")));

        let updated = backend
            .save(&table, fetched.with("age", json!(31)))
            .await
            .unwrap();
        assert_eq!(updated.id(), Some(id.as_str()));
        assert_eq!(updated.get("age"), Some(&FieldValue::from(json!(31))));

        backend.delete(&table, &id).await.unwrap();
        assert!(backend.retrieve(&table, &id).await.unwrap().is_none());
        assert!(matches!(
            backend.delete(&table, &id).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema_and_records() {
        let dir = tempdir().unwrap();
        {
            let backend = store(dir.path()).await;
            backend
                .save(&people(), Record::new().with("name", "Bob"))
                .await
                .unwrap();
        }

        let backend = JsonFileBackend::open(dir.path()).await.unwrap();
        let schema = backend.load_schema().await.unwrap();
        assert_eq!(schema.table_names(), vec!["people"]);
        let all = backend.query(&people(), &Query::new().all()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_open_missing_store_fails() {
        let dir = tempdir().unwrap();
        assert!(JsonFileBackend::open(&dir.path().join("nope")).await.is_err());

        let created = JsonFileBackend::open_or_create(&dir.path().join("fresh"))
            .await
            .unwrap();
        assert!(created.load_schema().await.unwrap().tables.is_empty());
    }

    #[tokio::test]
    async fn test_query_filters_sorts_and_pages() {
        let dir = tempdir().unwrap();
        let backend = store(dir.path()).await;
        let table = people();
        for (name, age) in [("Cleo", 41), ("ada", 36), ("Bea", 29), ("Dan", 52)] {
            backend
                .save(&table, Record::new().with("name", name).with("age", json!(age)))
                .await
                .unwrap();
        }

        let query = Query::new()
            .filter(Condition::single("age", Operator::Gt, 30))
            .sort_by(SortExpr::asc("name"));
        let names: Vec<_> = backend
            .query(&table, &query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.display_value("name").unwrap())
            .collect();
        assert_eq!(names, vec!["ada", "Cleo", "Dan"]);

        let page = backend
            .query(&table, &Query::new().sort_by(SortExpr::desc("age")).page(2, 3))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].display_value("name").as_deref(), Some("Bea"));
    }

    #[tokio::test]
    async fn test_references_stored_as_ids() {
        let dir = tempdir().unwrap();
        let backend = store(dir.path()).await;
        let table = people();

        let boss = backend
            .save(&table, Record::new().with("name", "Boss"))
            .await
            .unwrap();
        let boss_id = boss.id().unwrap();
        let report = backend
            .save(
                &table,
                Record::new()
                    .with("name", "Report")
                    .with("manager", crate::engine::schema::RelatedRecord::new(boss_id)),
            )
            .await
            .unwrap();

        let raw = std::fs::read_to_string(
            dir.path()
                .join("tbl_people")
                .join(format!("{}.json", report.id().unwrap())),
        )
        .unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["manager"], json!(boss_id));
        assert!(doc.get("_created_at").is_some());
    }

    #[tokio::test]
    async fn test_path_like_ids_are_rejected() {
        let dir = tempdir().unwrap();
        let backend = store(dir.path()).await;
        assert!(backend.retrieve(&people(), "../_meta").await.unwrap().is_none());
    }
}
