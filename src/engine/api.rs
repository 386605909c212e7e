//! RecordHub API Module
//! REST surface over any record source

use axum::{
    extract::{Path, Query as UrlQuery, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::engine::error::EngineError;
use crate::engine::query::{Query, QueryParams};
use crate::engine::schema::{Record, SchemaDescription};
use crate::engine::source::RecordSource;
use crate::engine::workflow::{PendingWorkflows, WorkflowContext, WorkflowState};

#[derive(Clone)]
pub struct ApiState {
    pub source: Arc<dyn RecordSource>,
    pub pending: Arc<PendingWorkflows>,
}

impl ApiState {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            pending: Arc::new(PendingWorkflows::default()),
        }
    }
}

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/schema", get(describe_schema))
        .route("/api/tables/{table}", get(list_records).put(create_record))
        .route("/api/tables/{table}/query", post(query_records))
        .route(
            "/api/tables/{table}/{id}",
            get(get_record).put(update_record).delete(delete_record),
        )
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/results/{token}", get(poll_workflow))
        .route("/api/workflows/{name}", post(execute_workflow))
        .route("/api/workflows/{name}/start", post(start_workflow))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Engine failure rendered as an HTTP response
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

/// `code` of the error body when a record id does not exist
pub const RECORD_NOT_FOUND: &str = "not_found";

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, code) = match &self.0 {
            EngineError::Validation(v) => {
                let body = json!({ "code": "validation", "errors": v.errors });
                return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
            }
            EngineError::Schema(_) => (StatusCode::NOT_FOUND, "schema"),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, RECORD_NOT_FOUND),
            EngineError::Backend(_) => {
                warn!(error = %message, "backend failure");
                (StatusCode::BAD_GATEWAY, "backend")
            }
            EngineError::Workflow(_) => (StatusCode::BAD_REQUEST, "workflow"),
            EngineError::Other(_) => {
                warn!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        (status, Json(json!({ "code": code, "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn describe_schema(State(state): State<ApiState>) -> Json<SchemaDescription> {
    Json(state.source.describe_schema())
}

async fn list_records(
    State(state): State<ApiState>,
    Path(table): Path<String>,
    UrlQuery(params): UrlQuery<QueryParams>,
) -> ApiResult<Json<Vec<Record>>> {
    let records = state
        .source
        .retrieve_records(&table, params.into_query(None))
        .await?;
    Ok(Json(records))
}

async fn query_records(
    State(state): State<ApiState>,
    Path(table): Path<String>,
    Json(query): Json<Query>,
) -> ApiResult<Json<Vec<Record>>> {
    Ok(Json(state.source.retrieve_records(&table, query).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExpandParams {
    #[serde(default)]
    pub expand: Option<String>,
}

async fn get_record(
    State(state): State<ApiState>,
    Path((table, id)): Path<(String, String)>,
    UrlQuery(params): UrlQuery<ExpandParams>,
) -> ApiResult<Json<Record>> {
    let expansion = QueryParams {
        expand: params.expand,
        ..Default::default()
    }
    .expansion();
    state
        .source
        .retrieve_record(&table, &id, &expansion)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("{}/{}", table, id)).into())
}

async fn create_record(
    State(state): State<ApiState>,
    Path(table): Path<String>,
    Json(record): Json<Record>,
) -> ApiResult<(StatusCode, Json<Record>)> {
    let created = state.source.create_record(&table, record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_record(
    State(state): State<ApiState>,
    Path((table, id)): Path<(String, String)>,
    Json(patch): Json<Record>,
) -> ApiResult<Json<Record>> {
    Ok(Json(state.source.update_record(&table, &id, patch).await?))
}

async fn delete_record(
    State(state): State<ApiState>,
    Path((table, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.source.delete_record(&table, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workflows(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.source.workflow_names())
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkflowRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub context: WorkflowContext,
}

async fn execute_workflow(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(request): Json<WorkflowRequest>,
) -> ApiResult<Json<Value>> {
    let result = state
        .source
        .execute_workflow(&name, request.input, request.context)
        .await?;
    Ok(Json(result))
}

async fn start_workflow(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(request): Json<WorkflowRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if !state.source.workflow_names().contains(&name) {
        return Err(EngineError::Workflow(format!("Unknown workflow: {}", name)).into());
    }
    let source = state.source.clone();
    let workflow = name.clone();
    let token = state
        .pending
        .start(&name, async move {
            source
                .execute_workflow(&workflow, request.input, request.context)
                .await
        })
        .await;
    Ok((StatusCode::ACCEPTED, Json(json!({ "token": token }))))
}

async fn poll_workflow(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> ApiResult<Json<WorkflowState>> {
    state
        .pending
        .poll(&token)
        .await
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("workflow result {}", token)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::json_file::JsonFileBackend;
    use crate::engine::error::Result as EngineResult;
    use crate::engine::hooks::{stage, Hook, TableMatcher};
    use crate::engine::validation::Validator;
    use crate::engine::schema::{Column, Schema, Table};
    use crate::engine::source::DataSource;
    use crate::engine::workflow::Workflow;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct Shout;

    #[async_trait]
    impl Workflow for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        async fn execute(&self, input: Value, _context: WorkflowContext) -> EngineResult<Value> {
            let text = input.as_str().unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Table::new("tbl_authors", "authors", "name").with_column(Column::text("name")),
            Table::new("tbl_books", "books", "title")
                .with_column(Column::text("title"))
                .with_column(Column::number("pages"))
                .with_column(Column::foreign_key("author", "tbl_authors", false)),
        ])
    }

    async fn app() -> (Router, TempDir) {
        let dir = tempdir().unwrap();
        let backend = JsonFileBackend::create(dir.path(), &schema()).await.unwrap();
        let mut source = DataSource::connect("library", Arc::new(backend)).await.unwrap();
        source.register_workflow(Arc::new(Shout));
        source.register_hook(Hook::sync(
            TableMatcher::exact("books"),
            stage::TableValidation,
            |_table, mut validator: Validator| {
                validator.require("title");
                Ok(validator)
            },
        ));
        (create_router(ApiState::new(Arc::new(source))), dir)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_schema() {
        let (app, _dir) = app().await;

        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, "GET", "/api/schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tables"].as_array().unwrap().len(), 2);
        assert_eq!(body["tables"][1]["collection"], "/tables/books");
    }

    #[tokio::test]
    async fn test_crud_with_expansion() {
        let (app, _dir) = app().await;

        let (status, author) =
            send(&app, "PUT", "/api/tables/authors", Some(json!({"name": "Le Guin"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let author_id = author["id"].as_str().unwrap().to_string();

        let (status, book) = send(
            &app,
            "PUT",
            "/api/tables/books",
            Some(json!({"title": "The Dispossessed", "pages": 387, "author": author_id})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let book_id = book["id"].as_str().unwrap().to_string();
        assert_eq!(book["author"]["type"], "record");
        assert!(book["author"].get("name").is_none());

        let uri = format!("/api/tables/books/{}?expand=author", book_id);
        let (status, fetched) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["author"]["name"], "Le Guin");

        let uri = format!("/api/tables/books/{}", book_id);
        let (status, updated) = send(&app, "PUT", &uri, Some(json!({"pages": 400}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["pages"], 400);
        assert_eq!(updated["title"], "The Dispossessed");

        let (status, listed) = send(&app, "GET", "/api/tables/books?expand=author", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["author"]["name"], "Le Guin");

        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_body_filters() {
        let (app, _dir) = app().await;
        for (title, pages) in [("Short", 90), ("Long", 900), ("Medium", 300)] {
            send(
                &app,
                "PUT",
                "/api/tables/books",
                Some(json!({"title": title, "pages": pages})),
            )
            .await;
        }

        let (status, body) = send(
            &app,
            "POST",
            "/api/tables/books/query",
            Some(json!({
                "conditions": {"conditionType": "single", "field": "pages", "operator": "gte", "value": 300},
                "sort": {"column": "pages", "ascending": false}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let titles: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["Long", "Medium"]);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (app, _dir) = app().await;

        let (status, body) =
            send(&app, "PUT", "/api/tables/books", Some(json!({"pages": "many"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let paths: Vec<_> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["title", "pages"]);

        let (status, body) = send(&app, "GET", "/api/tables/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "schema");

        let (status, body) =
            send(&app, "PUT", "/api/tables/books/missing", Some(json!({"pages": 1}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], RECORD_NOT_FOUND);

        let (status, _) = send(&app, "POST", "/api/workflows/nope", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_workflows_inline_and_polled() {
        let (app, _dir) = app().await;

        let (_, names) = send(&app, "GET", "/api/workflows", None).await;
        assert_eq!(names, json!(["shout"]));

        let (status, body) =
            send(&app, "POST", "/api/workflows/shout", Some(json!({"input": "hi"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("HI"));

        let (status, body) = send(
            &app,
            "POST",
            "/api/workflows/shout/start",
            Some(json!({"input": "later"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let uri = format!("/api/workflows/results/{}", body["token"].as_str().unwrap());

        let mut state = Value::Null;
        for _ in 0..50 {
            let (_, body) = send(&app, "GET", &uri, None).await;
            if body["status"] != "pending" {
                state = body;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state, json!({"status": "complete", "result": "LATER"}));

        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
