//! Multi-source routing
//!
//! Presents several data sources as one. Each table belongs to exactly one
//! source; requests are forwarded to the owner.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{EngineError, Result};
use super::hooks::{Hook, HookRegistry};
use super::query::Query;
use super::schema::{Record, SchemaDescription, Table};
use super::source::{DataSource, RecordSource};
use super::workflow::WorkflowContext;

pub struct MultiSource {
    name: String,
    sources: Vec<Arc<DataSource>>,
    /// Table name and id to index in `sources`
    owners: HashMap<String, usize>,
    hooks: HookRegistry,
    cross_source_expansion: bool,
}

impl MultiSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sources: Vec::new(),
            owners: HashMap::new(),
            hooks: HookRegistry::new(),
            cross_source_expansion: false,
        }
    }

    /// Resolve references into tables owned by other sources.
    pub fn with_cross_source_expansion(mut self, enabled: bool) -> Self {
        self.cross_source_expansion = enabled;
        self
    }

    /// Add a source. Fails without changes if any of its table names or ids
    /// is already routed elsewhere.
    pub fn add_source(&mut self, mut source: DataSource) -> Result<()> {
        let schema = source.schema();
        for table in &schema.tables {
            for key in [&table.name, &table.id] {
                if let Some(&owner) = self.owners.get(key) {
                    return Err(EngineError::Schema(format!(
                        "Table '{}' of source '{}' is already served by source '{}'",
                        key,
                        source.name(),
                        self.sources[owner].name()
                    )));
                }
            }
        }

        let index = self.sources.len();
        for table in &schema.tables {
            self.owners.insert(table.name.clone(), index);
            self.owners.insert(table.id.clone(), index);
        }
        source.attach_hooks(self.hooks.clone());
        info!(
            router = %self.name,
            source = source.name(),
            tables = schema.tables.len(),
            "source added"
        );
        self.sources.push(Arc::new(source));
        Ok(())
    }

    pub fn sources(&self) -> &[Arc<DataSource>] {
        &self.sources
    }

    fn owner(&self, table: &str) -> Result<&DataSource> {
        let index = self
            .owners
            .get(table)
            .ok_or_else(|| EngineError::unknown_table(table))?;
        debug!(table, source = self.sources[*index].name(), "routing");
        Ok(&self.sources[*index])
    }

    /// Where references of `source` are looked up.
    fn resolver<'a>(&'a self, source: &'a DataSource) -> &'a dyn RecordSource {
        if self.cross_source_expansion {
            self
        } else {
            source
        }
    }
}

#[async_trait]
impl RecordSource for MultiSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_table(&self, name_or_id: &str) -> Result<Table> {
        self.owner(name_or_id)?.get_table(name_or_id)
    }

    fn get_table_names(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|source| source.get_table_names())
            .collect()
    }

    fn has_table(&self, name_or_id: &str) -> bool {
        self.owners.contains_key(name_or_id)
    }

    fn describe_schema(&self) -> SchemaDescription {
        SchemaDescription {
            tables: self
                .sources
                .iter()
                .flat_map(|source| source.describe_schema().tables)
                .collect(),
        }
    }

    /// Applies to every table of every source, including sources added later.
    fn register_hook(&self, hook: Hook) {
        self.hooks.register(hook);
    }

    fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .iter()
            .flat_map(|source| source.workflow_names())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    async fn retrieve_record(
        &self,
        table: &str,
        id: &str,
        expansion: &[String],
    ) -> Result<Option<Record>> {
        let source = self.owner(table)?;
        source
            .retrieve_record_via(self.resolver(source), table, id, expansion)
            .await
    }

    async fn retrieve_records(&self, table: &str, query: Query) -> Result<Vec<Record>> {
        let source = self.owner(table)?;
        source
            .retrieve_records_via(self.resolver(source), table, query)
            .await
    }

    async fn create_record(&self, table: &str, record: Record) -> Result<Record> {
        self.owner(table)?.create_record(table, record).await
    }

    async fn update_record(&self, table: &str, id: &str, patch: Record) -> Result<Record> {
        self.owner(table)?.update_record(table, id, patch).await
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<()> {
        self.owner(table)?.delete_record(table, id).await
    }

    async fn find_by_id(
        &self,
        table: &str,
        expansion: &[String],
        ids: &[String],
    ) -> Result<HashMap<String, Record>> {
        let source = self.owner(table)?;
        source
            .find_by_id_via(self.resolver(source), table, expansion, ids)
            .await
    }

    async fn execute_workflow(
        &self,
        name: &str,
        input: Value,
        context: WorkflowContext,
    ) -> Result<Value> {
        let source = self
            .sources
            .iter()
            .find(|source| source.has_workflow(name))
            .ok_or_else(|| EngineError::Workflow(format!("Unknown workflow: {}", name)))?;
        source.execute_workflow(name, input, context).await
    }
}
