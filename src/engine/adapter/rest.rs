//! REST backend
//!
//! Client for another recordhub server's HTTP surface. The base URL points at
//! the API root, e.g. `http://localhost:7070/api`.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{unwrap_references, Backend};
use crate::engine::api::RECORD_NOT_FOUND;
use crate::engine::error::{BackendError, BackendResult};
use crate::engine::query::Query;
use crate::engine::schema::{Record, Schema, SchemaDescription, Table, ID_FIELD};

pub struct RestBackend {
    base_url: Url,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl RestBackend {
    pub fn new(base_url: &str) -> BackendResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BackendError::Config(format!("invalid URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Config(format!("'{}' cannot be a base URL", base_url)));
        }
        Ok(Self {
            base_url,
            token: None,
            http_client: reqwest::Client::new(),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        debug!(%method, %url, "rest request");
        let builder = self
            .http_client
            .request(method, url)
            .header(ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn check(response: Response) -> BackendResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// `None` when the server reports a missing record. Any other 404, such
    /// as an unknown table, stays an error.
    async fn check_found(response: Response) -> BackendResult<Option<Response>> {
        if response.status() != StatusCode::NOT_FOUND {
            return Self::check(response).await.map(Some);
        }
        let message = response.text().await.unwrap_or_default();
        let code = serde_json::from_str::<Value>(&message)
            .ok()
            .and_then(|body| body.get("code").and_then(Value::as_str).map(String::from));
        if code.as_deref() == Some(RECORD_NOT_FOUND) {
            return Ok(None);
        }
        Err(BackendError::Api {
            status: StatusCode::NOT_FOUND.as_u16(),
            message,
        })
    }

    fn body(table: &Table, record: &Record) -> Value {
        let mut data = unwrap_references(table, record);
        data.remove(ID_FIELD);
        Value::Object(data)
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn kind(&self) -> &'static str {
        "rest"
    }

    async fn load_schema(&self) -> BackendResult<Schema> {
        let response = self
            .request(reqwest::Method::GET, self.url(&["schema"]))
            .send()
            .await?;
        let description: SchemaDescription = Self::parse(response).await?;
        Ok(description.into_schema())
    }

    async fn retrieve(&self, table: &Table, id: &str) -> BackendResult<Option<Record>> {
        let response = self
            .request(reqwest::Method::GET, self.url(&["tables", &table.name, id]))
            .send()
            .await?;
        match Self::check_found(response).await? {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }

    async fn query(&self, table: &Table, query: &Query) -> BackendResult<Vec<Record>> {
        // expansion happens on this side
        let query = Query {
            expand: Vec::new(),
            ..query.clone()
        };
        let response = self
            .request(reqwest::Method::POST, self.url(&["tables", &table.name, "query"]))
            .json(&query)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn save(&self, table: &Table, record: Record) -> BackendResult<Record> {
        let url = match record.id() {
            Some(id) => self.url(&["tables", &table.name, id]),
            None => self.url(&["tables", &table.name]),
        };
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(&Self::body(table, &record))
            .send()
            .await?;
        match Self::check_found(response).await? {
            Some(response) => Ok(response.json().await?),
            None => Err(BackendError::NotFound(
                record.id().unwrap_or_default().to_string(),
            )),
        }
    }

    async fn delete(&self, table: &Table, id: &str) -> BackendResult<()> {
        let response = self
            .request(reqwest::Method::DELETE, self.url(&["tables", &table.name, id]))
            .send()
            .await?;
        match Self::check_found(response).await? {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building_escapes_segments() {
        let backend = RestBackend::new("http://localhost:7070/api/").unwrap();
        assert_eq!(
            backend.url(&["tables", "my table", "rec/1"]).as_str(),
            "http://localhost:7070/api/tables/my%20table/rec%2F1"
        );
        assert_eq!(
            backend.url(&["schema"]).as_str(),
            "http://localhost:7070/api/schema"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(matches!(
            RestBackend::new("not a url"),
            Err(BackendError::Config(_))
        ));
        assert!(matches!(
            RestBackend::new("mailto:someone@example.com"),
            Err(BackendError::Config(_))
        ));
    }
}
