//! Record sources
//!
//! `DataSource` sequences hooks, validation and reference expansion around
//! the primitives of a single backend. `RecordSource` is the uniform surface
//! shared with the multi-source router.

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use super::adapter::{wrap_references, Backend};
use super::error::{BackendError, EngineError, Result};
use super::hooks::{
    stage, FieldValidationArgs, FindArgs, Hook, HookPipeline, HookRegistry, RecordExpandArgs,
    RecordsArgs, RetrieveArgs, UpdateArgs, ValidateArgs,
};
use super::query::{Condition, Query};
use super::schema::{
    FieldValue, Record, RelatedRecord, Schema, SchemaDescription, Table, TableDescription, ID_FIELD,
};
use super::validation::{validated_columns, FieldValidator, Validator};
use super::workflow::{Workflow, WorkflowContext, WorkflowRegistry};

/// Uniform read/write surface over one or many backends
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve a table by id or name.
    fn get_table(&self, name_or_id: &str) -> Result<Table>;

    fn get_table_names(&self) -> Vec<String>;

    fn has_table(&self, name_or_id: &str) -> bool {
        self.get_table(name_or_id).is_ok()
    }

    fn describe_schema(&self) -> SchemaDescription;

    fn register_hook(&self, hook: Hook);

    fn workflow_names(&self) -> Vec<String>;

    async fn retrieve_record(
        &self,
        table: &str,
        id: &str,
        expansion: &[String],
    ) -> Result<Option<Record>>;

    async fn retrieve_records(&self, table: &str, query: Query) -> Result<Vec<Record>>;

    async fn create_record(&self, table: &str, record: Record) -> Result<Record>;

    /// Merge `patch` into the stored record.
    async fn update_record(&self, table: &str, id: &str, patch: Record) -> Result<Record>;

    async fn delete_record(&self, table: &str, id: &str) -> Result<()>;

    /// Batched lookup of `ids`, keyed by id. Missing ids are simply absent.
    async fn find_by_id(
        &self,
        table: &str,
        expansion: &[String],
        ids: &[String],
    ) -> Result<HashMap<String, Record>>;

    async fn execute_workflow(
        &self,
        name: &str,
        input: Value,
        context: WorkflowContext,
    ) -> Result<Value>;
}

/// One backend plus its schema, hooks and workflows
pub struct DataSource {
    name: String,
    backend: Arc<dyn Backend>,
    schema: RwLock<Arc<Schema>>,
    hooks: HookPipeline,
    workflows: WorkflowRegistry,
}

impl DataSource {
    /// Load and check the backend's schema.
    pub async fn connect(name: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        let schema = backend.load_schema().await?;
        info!(
            source = name,
            backend = backend.kind(),
            tables = schema.tables.len(),
            "connected data source"
        );
        Self::with_schema(name, backend, schema)
    }

    pub fn with_schema(name: &str, backend: Arc<dyn Backend>, schema: Schema) -> Result<Self> {
        schema.validate()?;
        Ok(Self {
            name: name.to_string(),
            backend,
            schema: RwLock::new(Arc::new(schema)),
            hooks: HookPipeline::new(),
            workflows: WorkflowRegistry::new(),
        })
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Reload the schema from the backend, replacing the cached one.
    pub async fn refresh_schema(&self) -> Result<()> {
        let schema = self.backend.load_schema().await?;
        schema.validate()?;
        info!(source = %self.name, tables = schema.tables.len(), "schema refreshed");
        *self.schema.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(schema);
        Ok(())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Consult `registry` after this source's own hooks.
    pub fn attach_hooks(&mut self, registry: HookRegistry) {
        self.hooks.attach(registry);
    }

    pub fn register_workflow(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows.register(workflow);
    }

    pub fn has_workflow(&self, name: &str) -> bool {
        self.workflows.contains(name)
    }

    /// Fetch one record, resolving references through `resolver`.
    pub async fn retrieve_record_via(
        &self,
        resolver: &dyn RecordSource,
        table: &str,
        id: &str,
        expansion: &[String],
    ) -> Result<Option<Record>> {
        let table = self.get_table(table)?;
        let args = self
            .hooks
            .run(
                stage::PreRetrieveRecord,
                &table,
                RetrieveArgs {
                    id: id.to_string(),
                    expansion: expansion.to_vec(),
                },
            )
            .await?;

        let record = self
            .backend
            .retrieve(&table, &args.id)
            .await?
            .map(|record| normalized(&table, record));

        let args = self
            .hooks
            .run(
                stage::PreRetrieveRecordExpand,
                &table,
                RecordExpandArgs {
                    record,
                    expansion: args.expansion,
                },
            )
            .await?;

        let record = match args.record {
            Some(record) if !args.expansion.is_empty() => {
                expand_records(resolver, &table, vec![record], &args.expansion)
                    .await?
                    .pop()
            }
            other => other,
        };

        self.hooks.run(stage::PostRetrieveRecord, &table, record).await
    }

    pub async fn retrieve_records_via(
        &self,
        resolver: &dyn RecordSource,
        table: &str,
        query: Query,
    ) -> Result<Vec<Record>> {
        let table = self.get_table(table)?;
        let query = self.hooks.run(stage::PreRetrieveRecords, &table, query).await?;

        let records = self
            .backend
            .query(&table, &query)
            .await?
            .into_iter()
            .map(|record| normalized(&table, record))
            .collect();
        debug!(table = %table.name, "retrieved records");

        let args = self
            .hooks
            .run(stage::PreRetrieveRecordsExpand, &table, RecordsArgs { query, records })
            .await?;

        let records = if args.query.expand.is_empty() {
            args.records
        } else {
            expand_records(resolver, &table, args.records, &args.query.expand).await?
        };

        let args = self
            .hooks
            .run(
                stage::PostRetrieveRecords,
                &table,
                RecordsArgs {
                    query: args.query,
                    records,
                },
            )
            .await?;
        Ok(args.records)
    }

    pub async fn find_by_id_via(
        &self,
        resolver: &dyn RecordSource,
        table: &str,
        expansion: &[String],
        ids: &[String],
    ) -> Result<HashMap<String, Record>> {
        let table = self.get_table(table)?;
        let args = self
            .hooks
            .run(
                stage::PreFind,
                &table,
                FindArgs {
                    ids: ids.to_vec(),
                    expansion: expansion.to_vec(),
                },
            )
            .await?;

        let ids: Vec<String> = args
            .ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let query = Query::new().filter(Condition::any_id(&ids)).all();
        let query = self.hooks.run(stage::PreFindQuery, &table, query).await?;

        let records: Vec<Record> = self
            .backend
            .query(&table, &query)
            .await?
            .into_iter()
            .map(|record| normalized(&table, record))
            .collect();
        debug!(table = %table.name, requested = ids.len(), found = records.len(), "find by id");

        let records = if args.expansion.is_empty() {
            records
        } else {
            expand_records(resolver, &table, records, &args.expansion).await?
        };

        let records = self.hooks.run(stage::PostFind, &table, records).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.id()?.to_string();
                Some((id, record))
            })
            .collect())
    }

    /// Column validators adjusted by `field-validation`, then the whole
    /// validator by `table-validation`.
    async fn build_validator(&self, table: &Table) -> Result<Validator> {
        let mut validator = Validator::new();
        for column in validated_columns(table) {
            let args = self
                .hooks
                .run(
                    stage::FieldValidation,
                    table,
                    FieldValidationArgs {
                        columns: table.columns.clone(),
                        column: column.clone(),
                        validator: FieldValidator::from_column(column),
                    },
                )
                .await?;
            validator.set_field(args.validator);
        }
        self.hooks.run(stage::TableValidation, table, validator).await
    }

    fn write_failed(&self, err: BackendError) -> EngineError {
        match err {
            BackendError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Backend(other),
        }
    }
}

/// Bare ids under foreign key columns become references.
fn normalized(table: &Table, mut record: Record) -> Record {
    wrap_references(table, &mut record);
    record
}

#[async_trait]
impl RecordSource for DataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_table(&self, name_or_id: &str) -> Result<Table> {
        self.schema()
            .table(name_or_id)
            .cloned()
            .ok_or_else(|| EngineError::unknown_table(name_or_id))
    }

    fn get_table_names(&self) -> Vec<String> {
        self.schema().table_names()
    }

    fn describe_schema(&self) -> SchemaDescription {
        SchemaDescription {
            tables: self
                .schema()
                .tables
                .iter()
                .map(|table| TableDescription {
                    table: table.clone(),
                    collection: self.backend.collection_path(table),
                })
                .collect(),
        }
    }

    fn register_hook(&self, hook: Hook) {
        self.hooks.register(hook);
    }

    fn workflow_names(&self) -> Vec<String> {
        self.workflows.names()
    }

    async fn retrieve_record(
        &self,
        table: &str,
        id: &str,
        expansion: &[String],
    ) -> Result<Option<Record>> {
        self.retrieve_record_via(self, table, id, expansion).await
    }

    async fn retrieve_records(&self, table: &str, query: Query) -> Result<Vec<Record>> {
        self.retrieve_records_via(self, table, query).await
    }

    async fn create_record(&self, table: &str, mut record: Record) -> Result<Record> {
        let table = self.get_table(table)?;
        // ids are always assigned by the backend
        record.remove(ID_FIELD);

        let record = self.hooks.run(stage::PreCreate, &table, record).await?;
        let validator = self.build_validator(&table).await?;
        let ValidateArgs { record, validator } = self
            .hooks
            .run(stage::PreCreateValidate, &table, ValidateArgs { record, validator })
            .await?;
        validator.validate(&record)?;
        let record = self.hooks.run(stage::PostCreateValidate, &table, record).await?;

        let saved = self.backend.save(&table, record).await?;
        let saved = normalized(&table, saved);
        info!(table = %table.name, id = saved.id().unwrap_or_default(), "record created");

        self.hooks.run(stage::PostCreate, &table, saved).await
    }

    async fn update_record(&self, table: &str, id: &str, patch: Record) -> Result<Record> {
        let table = self.get_table(table)?;
        let UpdateArgs { id, record: mut patch } = self
            .hooks
            .run(
                stage::PreUpdate,
                &table,
                UpdateArgs {
                    id: id.to_string(),
                    record: patch,
                },
            )
            .await?;

        let stored = self
            .backend
            .retrieve(&table, &id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("{}/{}", table.name, id)))?;

        patch.remove(ID_FIELD);
        let mut record = normalized(&table, stored).merge(patch);
        record.set_id(id.as_str());

        let validator = self.build_validator(&table).await?;
        let ValidateArgs { record, validator } = self
            .hooks
            .run(stage::PreUpdateValidate, &table, ValidateArgs { record, validator })
            .await?;
        validator.validate(&record)?;
        let mut record = self.hooks.run(stage::PostUpdateValidate, &table, record).await?;
        record.set_id(id.as_str());

        let saved = self
            .backend
            .save(&table, record)
            .await
            .map_err(|e| self.write_failed(e))?;
        let saved = normalized(&table, saved);
        info!(table = %table.name, id = %id, "record updated");

        self.hooks.run(stage::PostUpdate, &table, saved).await
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<()> {
        let table = self.get_table(table)?;
        let id = self.hooks.run(stage::PreDelete, &table, id.to_string()).await?;

        self.backend
            .delete(&table, &id)
            .await
            .map_err(|e| self.write_failed(e))?;
        info!(table = %table.name, id = %id, "record deleted");

        self.hooks.run(stage::PostDelete, &table, id).await?;
        Ok(())
    }

    async fn find_by_id(
        &self,
        table: &str,
        expansion: &[String],
        ids: &[String],
    ) -> Result<HashMap<String, Record>> {
        self.find_by_id_via(self, table, expansion, ids).await
    }

    async fn execute_workflow(
        &self,
        name: &str,
        input: Value,
        context: WorkflowContext,
    ) -> Result<Value> {
        let context = WorkflowContext {
            source: context.source.or_else(|| Some(self.name.clone())),
            ..context
        };
        self.workflows.execute(name, input, context).await
    }
}

/// Columns to expand on one foreign table, with everything they reference
#[derive(Default)]
struct ExpansionPlan {
    columns: Vec<String>,
    ids: BTreeSet<String>,
    nested: Vec<String>,
}

/// Expand the references named by `expansion` on `records`.
///
/// Paths may be dotted (`author.publisher`) to expand the expanded records in
/// turn. All references into one foreign table are resolved with a single
/// `find_by_id` call, and lookups for different tables run concurrently.
/// Unknown columns, tables the resolver does not serve, and ids that do not
/// resolve are left as plain references.
pub async fn expand_records(
    resolver: &dyn RecordSource,
    table: &Table,
    records: Vec<Record>,
    expansion: &[String],
) -> Result<Vec<Record>> {
    let mut paths: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for path in expansion {
        match path.split_once('.') {
            Some((head, rest)) => paths.entry(head).or_default().push(rest.to_string()),
            None => {
                paths.entry(path.as_str()).or_default();
            }
        }
    }

    let mut plans: BTreeMap<String, ExpansionPlan> = BTreeMap::new();
    for (column_name, nested) in paths {
        let Some((column, foreign_table, _)) =
            table.foreign_keys().find(|(c, _, _)| c.name == column_name)
        else {
            debug!(table = %table.name, column = column_name, "not a reference column, skipping");
            continue;
        };
        if !resolver.has_table(foreign_table) {
            debug!(
                table = %table.name,
                column = %column.name,
                foreign_table,
                "foreign table not served here, leaving unexpanded"
            );
            continue;
        }

        let plan = plans.entry(foreign_table.to_string()).or_default();
        plan.columns.push(column.name.clone());
        for path in nested {
            if !plan.nested.contains(&path) {
                plan.nested.push(path);
            }
        }
        for record in &records {
            if let Some(value) = record.get(&column.name) {
                plan.ids.extend(value.reference_ids().into_iter().map(String::from));
            }
        }
    }

    let lookups = plans
        .iter()
        .filter(|(_, plan)| !plan.ids.is_empty())
        .map(|(foreign_table, plan)| async move {
            let ids: Vec<String> = plan.ids.iter().cloned().collect();
            let target = resolver.get_table(foreign_table)?;
            let found = resolver.find_by_id(foreign_table, &plan.nested, &ids).await?;
            Ok::<_, EngineError>((foreign_table.as_str(), (target.name_field, found)))
        });
    let resolved: HashMap<&str, (String, HashMap<String, Record>)> =
        try_join_all(lookups).await?.into_iter().collect();

    Ok(records
        .into_iter()
        .map(|record| {
            record
                .iter()
                .map(|(field, value)| {
                    let lookup = plans
                        .iter()
                        .find(|(_, plan)| plan.columns.contains(field))
                        .and_then(|(foreign_table, _)| resolved.get(foreign_table.as_str()));
                    let value = match lookup {
                        Some((name_field, found)) => expanded(value, found, name_field),
                        None => value.clone(),
                    };
                    (field.clone(), value)
                })
                .collect::<Record>()
        })
        .collect())
}

fn expanded(value: &FieldValue, found: &HashMap<String, Record>, name_field: &str) -> FieldValue {
    let resolve = |reference: &RelatedRecord| match found.get(&reference.id) {
        Some(target) => reference.expanded_with(
            target
                .display_value(name_field)
                .unwrap_or_else(|| reference.id.clone()),
            target.clone(),
        ),
        None => reference.clone(),
    };

    match value {
        FieldValue::Related(reference) => FieldValue::Related(resolve(reference)),
        FieldValue::Collection(collection) => {
            let mut collection = collection.clone();
            collection.records = collection.records.iter().map(resolve).collect();
            FieldValue::Collection(collection)
        }
        FieldValue::Scalar(_) => value.clone(),
    }
}
