//! AirTable backend

pub mod client;
pub mod formula;
pub mod marshal;
pub mod schema;

pub use client::AirtableClient;

use async_trait::async_trait;
use tracing::debug;

use self::client::{ListParams, RecordPage, MAX_PAGE_SIZE};
use self::formula::Formula;
use super::Backend;
use crate::engine::error::BackendResult;
use crate::engine::evaluator::matches;
use crate::engine::query::Query;
use crate::engine::schema::{Record, Schema, Table};

pub struct AirtableBackend {
    client: AirtableClient,
}

impl AirtableBackend {
    pub fn new(client: AirtableClient) -> Self {
        Self { client }
    }

    fn list_params(query: &Query, formula: Option<&Formula>, page_size: usize) -> ListParams {
        ListParams {
            formula: formula
                .filter(|f| !f.is_trivial())
                .map(|f| f.expression.clone()),
            view: query.view.clone(),
            sort: query.sort.clone(),
            page_size,
            offset: None,
        }
    }

    /// Follow the cursor through every page.
    async fn fetch_all(&self, table: &Table, mut params: ListParams) -> BackendResult<Vec<Record>> {
        let mut records = Vec::new();
        loop {
            let RecordPage {
                records: page,
                offset,
            } = self.client.list_records(&table.id, &params).await?;
            records.extend(page.into_iter().map(|r| marshal::to_record(table, r)));
            match offset {
                Some(offset) => params.offset = Some(offset),
                None => return Ok(records),
            }
        }
    }

    /// Walk the cursor up to the requested page and return only that page.
    async fn fetch_page(
        &self,
        table: &Table,
        mut params: ListParams,
        page: usize,
    ) -> BackendResult<Vec<Record>> {
        for current in 1.. {
            let RecordPage { records, offset } = self.client.list_records(&table.id, &params).await?;
            if current == page {
                return Ok(records
                    .into_iter()
                    .map(|r| marshal::to_record(table, r))
                    .collect());
            }
            match offset {
                Some(offset) => params.offset = Some(offset),
                None => break,
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl Backend for AirtableBackend {
    fn kind(&self) -> &'static str {
        "airtable"
    }

    async fn load_schema(&self) -> BackendResult<Schema> {
        let tables = self.client.list_tables().await?;
        Ok(schema::convert_schema(&tables))
    }

    async fn retrieve(&self, table: &Table, id: &str) -> BackendResult<Option<Record>> {
        Ok(self
            .client
            .get_record(&table.id, id)
            .await?
            .map(|r| marshal::to_record(table, r)))
    }

    async fn query(&self, table: &Table, query: &Query) -> BackendResult<Vec<Record>> {
        let formula = query
            .conditions
            .as_ref()
            .map(|condition| formula::compile(table, condition));
        let exact = formula.as_ref().map(|f| f.exact).unwrap_or(true);
        let page_size = query.effective_page_size();

        if exact && !query.retrieve_all && page_size <= MAX_PAGE_SIZE {
            let params = Self::list_params(query, formula.as_ref(), page_size);
            return self.fetch_page(table, params, query.effective_page()).await;
        }

        let params = Self::list_params(query, formula.as_ref(), MAX_PAGE_SIZE);
        let mut records = self.fetch_all(table, params).await?;
        if !exact {
            if let Some(condition) = &query.conditions {
                debug!(table = %table.name, fetched = records.len(), "re-filtering locally");
                records.retain(|record| matches(table, record, condition));
            }
        }
        Ok(query.paginate(records))
    }

    async fn save(&self, table: &Table, record: Record) -> BackendResult<Record> {
        let fields = marshal::to_fields(table, &record);
        let saved = match record.id() {
            Some(id) => self.client.update_record(&table.id, id, &fields).await?,
            None => self.client.create_record(&table.id, &fields).await?,
        };
        Ok(marshal::to_record(table, saved))
    }

    async fn delete(&self, table: &Table, id: &str) -> BackendResult<()> {
        self.client.delete_record(&table.id, id).await
    }

    fn collection_path(&self, table: &Table) -> String {
        format!("/{}/{}", self.client.base_id(), table.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::query::{Condition, Operator};
    use crate::engine::schema::Column;
    use axum::extract::{Path, Query as UrlQuery};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

    /// Serves five records, honouring `pageSize` and `offset` but not formulas.
    async fn fake_airtable(seen: Seen) -> String {
        let app = Router::new().route(
            "/v0/{base}/{table}",
            get(
                move |Path((_base, _table)): Path<(String, String)>,
                      UrlQuery(params): UrlQuery<HashMap<String, String>>| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(params.clone());
                        let start: usize =
                            params.get("offset").and_then(|o| o.parse().ok()).unwrap_or(0);
                        let size: usize =
                            params.get("pageSize").and_then(|s| s.parse().ok()).unwrap_or(100);
                        let all: Vec<Value> = (0..5)
                            .map(|i| {
                                json!({
                                    "id": format!("rec{}", i),
                                    "fields": {"Name": format!("Task {}", i), "Points": i}
                                })
                            })
                            .collect();
                        let page: Vec<Value> = all.iter().skip(start).take(size).cloned().collect();
                        let mut body = json!({ "records": page });
                        if start + size < all.len() {
                            body["offset"] = json!((start + size).to_string());
                        }
                        Json(body)
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn tasks() -> Table {
        Table::new("tblTasks", "Tasks", "Name")
            .with_column(Column::text("Name"))
            .with_column(Column::number("Points"))
    }

    async fn backend(seen: &Seen) -> AirtableBackend {
        let url = fake_airtable(seen.clone()).await;
        AirtableBackend::new(AirtableClient::with_api_url(&url, "appTest", "key").unwrap())
    }

    #[tokio::test]
    async fn test_page_walks_cursor() {
        let seen = Seen::default();
        let backend = backend(&seen).await;

        let records = backend
            .query(&tasks(), &Query::new().page(3, 2))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), Some("rec4"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|p| p.get("pageSize").map(String::as_str) == Some("2")));
    }

    #[tokio::test]
    async fn test_retrieve_all_ignores_paging() {
        let seen = Seen::default();
        let backend = backend(&seen).await;

        let records = backend
            .query(&tasks(), &Query::new().page(2, 2).all())
            .await
            .unwrap();
        assert_eq!(records.len(), 5);
    }

    #[tokio::test]
    async fn test_inexact_formula_is_refiltered_locally() {
        let seen = Seen::default();
        let backend = backend(&seen).await;

        let query = Query::new().filter(Condition::single("Points", Operator::Lt, 2));
        let records = backend.query(&tasks(), &query).await.unwrap();
        let ids: Vec<_> = records.iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec!["rec0", "rec1"]);

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0].get("filterByFormula").map(String::as_str),
            Some("{Points} < 2")
        );
    }
}
