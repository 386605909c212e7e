//! AirTable HTTP client
//!
//! Thin wrapper over the records API and the base metadata API.

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::engine::error::{BackendError, BackendResult};
use crate::engine::query::SortExpr;

pub const DEFAULT_API_URL: &str = "https://api.airtable.com";

/// Largest page the records API returns
pub const MAX_PAGE_SIZE: usize = 100;

/// Record as returned by the records API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirtableRecord {
    pub id: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordPage {
    pub records: Vec<AirtableRecord>,
    /// Cursor for the next page, absent on the last one
    #[serde(default)]
    pub offset: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    fields: &'a Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaTables {
    pub tables: Vec<MetaTable>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaTable {
    pub id: String,
    pub name: String,
    pub primary_field_id: String,
    #[serde(default)]
    pub fields: Vec<MetaField>,
    #[serde(default)]
    pub views: Vec<MetaView>,
}

impl MetaTable {
    pub fn field(&self, id: &str) -> Option<&MetaField> {
        self.fields.iter().find(|f| f.id == id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaField {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub options: FieldOptions,
}

/// Union of the option blocks of the field kinds we convert
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOptions {
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub precision: Option<u32>,
    pub linked_table_id: Option<String>,
    #[serde(default)]
    pub prefers_single_record_link: bool,
    pub record_link_field_id: Option<String>,
    pub field_id_in_linked_table: Option<String>,
    /// Result type of formula, rollup and lookup fields
    pub result: Option<Box<FieldResult>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldResult {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub options: FieldOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaView {
    pub id: String,
    pub name: String,
}

/// Parameters of one list request
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub formula: Option<String>,
    pub view: Option<String>,
    pub sort: Vec<SortExpr>,
    pub page_size: usize,
    pub offset: Option<String>,
}

impl ListParams {
    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![(
            "pageSize".to_string(),
            self.page_size.clamp(1, MAX_PAGE_SIZE).to_string(),
        )];
        if let Some(formula) = &self.formula {
            pairs.push(("filterByFormula".to_string(), formula.clone()));
        }
        if let Some(view) = &self.view {
            pairs.push(("view".to_string(), view.clone()));
        }
        for (i, sort) in self.sort.iter().enumerate() {
            pairs.push((format!("sort[{}][field]", i), sort.column.clone()));
            let direction = if sort.ascending { "asc" } else { "desc" };
            pairs.push((format!("sort[{}][direction]", i), direction.to_string()));
        }
        if let Some(offset) = &self.offset {
            pairs.push(("offset".to_string(), offset.clone()));
        }
        pairs
    }
}

pub struct AirtableClient {
    api_url: Url,
    base_id: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl AirtableClient {
    pub fn new(base_id: &str, api_key: &str) -> BackendResult<Self> {
        Self::with_api_url(DEFAULT_API_URL, base_id, api_key)
    }

    pub fn with_api_url(api_url: &str, base_id: &str, api_key: &str) -> BackendResult<Self> {
        let api_url = Url::parse(api_url)
            .map_err(|e| BackendError::Config(format!("invalid URL '{}': {}", api_url, e)))?;
        if api_url.cannot_be_a_base() {
            return Err(BackendError::Config(format!("'{}' cannot be a base URL", api_url)));
        }
        Ok(Self {
            api_url,
            base_id: base_id.to_string(),
            api_key: api_key.to_string(),
            http_client: reqwest::Client::new(),
        })
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v0").extend(segments);
        }
        url
    }

    fn records_url(&self, table_id: &str, record_id: Option<&str>) -> Url {
        match record_id {
            Some(id) => self.url(&[self.base_id.as_str(), table_id, id]),
            None => self.url(&[self.base_id.as_str(), table_id]),
        }
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        debug!(%method, path = url.path(), "airtable request");
        self.http_client
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(ACCEPT, "application/json")
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// Table and field definitions of the base
    pub async fn list_tables(&self) -> BackendResult<Vec<MetaTable>> {
        let url = self.url(&["meta", "bases", self.base_id.as_str(), "tables"]);
        let response = self.request(Method::GET, url).send().await?;
        let meta: MetaTables = Self::parse(response).await?;
        Ok(meta.tables)
    }

    pub async fn list_records(&self, table_id: &str, params: &ListParams) -> BackendResult<RecordPage> {
        let response = self
            .request(Method::GET, self.records_url(table_id, None))
            .query(&params.to_pairs())
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn get_record(&self, table_id: &str, id: &str) -> BackendResult<Option<AirtableRecord>> {
        let response = self
            .request(Method::GET, self.records_url(table_id, Some(id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::parse(response).await?))
    }

    pub async fn create_record(
        &self,
        table_id: &str,
        fields: &Map<String, Value>,
    ) -> BackendResult<AirtableRecord> {
        let response = self
            .request(Method::POST, self.records_url(table_id, None))
            .json(&WriteRequest { fields })
            .send()
            .await?;
        Self::parse(response).await
    }

    /// PATCH semantics: fields not sent keep their values.
    pub async fn update_record(
        &self,
        table_id: &str,
        id: &str,
        fields: &Map<String, Value>,
    ) -> BackendResult<AirtableRecord> {
        let response = self
            .request(Method::PATCH, self.records_url(table_id, Some(id)))
            .json(&WriteRequest { fields })
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(id.to_string()));
        }
        Self::parse(response).await
    }

    pub async fn delete_record(&self, table_id: &str, id: &str) -> BackendResult<()> {
        let response = self
            .request(Method::DELETE, self.records_url(table_id, Some(id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(id.to_string()));
        }
        let _: Value = Self::parse(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_params_encode_sort_and_cursor() {
        let params = ListParams {
            formula: Some("{Status} = 'open'".into()),
            view: Some("Grid view".into()),
            sort: vec![SortExpr::asc("Name"), SortExpr::desc("Due")],
            page_size: 500,
            offset: Some("itr123".into()),
        };
        let pairs = params.to_pairs();
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("pageSize"), Some("100"));
        assert_eq!(get("filterByFormula"), Some("{Status} = 'open'"));
        assert_eq!(get("sort[0][field]"), Some("Name"));
        assert_eq!(get("sort[1][direction]"), Some("desc"));
        assert_eq!(get("offset"), Some("itr123"));
    }

    #[test]
    fn test_urls() {
        let client = AirtableClient::new("appXYZ", "key").unwrap();
        assert_eq!(
            client.records_url("tblA", Some("rec1")).as_str(),
            "https://api.airtable.com/v0/appXYZ/tblA/rec1"
        );
        assert_eq!(
            client.url(&["meta", "bases", "appXYZ", "tables"]).as_str(),
            "https://api.airtable.com/v0/meta/bases/appXYZ/tables"
        );
    }

    #[test]
    fn test_meta_field_options_parse() {
        let field: MetaField = serde_json::from_value(json!({
            "id": "fldLookup",
            "name": "Author name",
            "type": "multipleLookupValues",
            "options": {
                "recordLinkFieldId": "fldAuthor",
                "fieldIdInLinkedTable": "fldName",
                "isValid": true,
                "result": {"type": "singleLineText"}
            }
        }))
        .unwrap();
        assert_eq!(field.options.record_link_field_id.as_deref(), Some("fldAuthor"));
        assert_eq!(field.options.result.unwrap().field_type, "singleLineText");
    }
}
