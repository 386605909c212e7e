//! Named workflows
//!
//! Side-effecting operations outside plain CRUD. The engine runs them inline;
//! callers that need to poll hand the invocation to `PendingWorkflows`, which
//! parks the outcome in an injected `WorkflowResultStore`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::error::{EngineError, Result};

/// Caller context handed to a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, input: Value, context: WorkflowContext) -> Result<Value>;
}

/// Outcome of a started workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Complete { result: Value },
    Failed { message: String },
}

/// Key-value store for pending workflow results
#[async_trait]
pub trait WorkflowResultStore: Send + Sync {
    async fn put(&self, token: &str, state: WorkflowState);

    async fn get(&self, token: &str) -> Option<WorkflowState>;

    async fn remove(&self, token: &str) -> Option<WorkflowState>;
}

/// Process-local result store
#[derive(Default)]
pub struct MemoryResultStore {
    entries: RwLock<HashMap<String, WorkflowState>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowResultStore for MemoryResultStore {
    async fn put(&self, token: &str, state: WorkflowState) {
        self.entries.write().await.insert(token.to_string(), state);
    }

    async fn get(&self, token: &str) -> Option<WorkflowState> {
        self.entries.read().await.get(token).cloned()
    }

    async fn remove(&self, token: &str) -> Option<WorkflowState> {
        self.entries.write().await.remove(token)
    }
}

/// Workflows registered on a data source, keyed by name
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(workflow.name().to_string(), workflow);
    }

    pub fn names(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Run to completion in the caller's task.
    pub async fn execute(&self, name: &str, input: Value, context: WorkflowContext) -> Result<Value> {
        let workflow = self
            .workflows
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Workflow(format!("Unknown workflow: {}", name)))?;
        info!(workflow = name, "executing workflow");
        workflow.execute(input, context).await
    }
}

/// Background invocations whose results are parked under a token.
pub struct PendingWorkflows {
    store: Arc<dyn WorkflowResultStore>,
}

impl Default for PendingWorkflows {
    fn default() -> Self {
        Self::new(Arc::new(MemoryResultStore::new()))
    }
}

impl PendingWorkflows {
    pub fn new(store: Arc<dyn WorkflowResultStore>) -> Self {
        Self { store }
    }

    /// Spawn `run` and return the token to poll.
    pub async fn start<F>(&self, name: &str, run: F) -> String
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let token = uuid::Uuid::new_v4().to_string();
        self.store.put(&token, WorkflowState::Pending).await;

        let store = self.store.clone();
        let task_token = token.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let state = match run.await {
                Ok(result) => WorkflowState::Complete { result },
                Err(e) => {
                    warn!(workflow = %name, error = %e, "workflow failed");
                    WorkflowState::Failed {
                        message: e.to_string(),
                    }
                }
            };
            store.put(&task_token, state).await;
        });

        token
    }

    /// Current state; finished results are handed out once.
    pub async fn poll(&self, token: &str) -> Option<WorkflowState> {
        match self.store.get(token).await? {
            WorkflowState::Pending => Some(WorkflowState::Pending),
            _ => self.store.remove(token).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Workflow for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, input: Value, context: WorkflowContext) -> Result<Value> {
            Ok(json!({"input": input, "user": context.user_id}))
        }
    }

    #[tokio::test]
    async fn test_execute_inline() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(Echo));

        let ctx = WorkflowContext {
            user_id: Some("u1".into()),
            source: None,
        };
        let out = registry.execute("echo", json!(5), ctx).await.unwrap();
        assert_eq!(out, json!({"input": 5, "user": "u1"}));
        assert_eq!(registry.names(), vec!["echo"]);
        assert!(matches!(
            registry.execute("nope", json!(null), WorkflowContext::default()).await,
            Err(EngineError::Workflow(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_poll() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(Echo));
        let registry = Arc::new(registry);
        let pending = PendingWorkflows::default();

        let runner = registry.clone();
        let token = pending
            .start("echo", async move {
                runner.execute("echo", json!("hi"), WorkflowContext::default()).await
            })
            .await;

        let mut state = pending.poll(&token).await;
        for _ in 0..50 {
            if !matches!(state, Some(WorkflowState::Pending)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = pending.poll(&token).await;
        }

        assert_eq!(
            state,
            Some(WorkflowState::Complete {
                result: json!({"input": "hi", "user": null})
            })
        );
        // handed out once
        assert_eq!(pending.poll(&token).await, None);
    }

    #[tokio::test]
    async fn test_failed_workflow_reports_message() {
        let pending = PendingWorkflows::default();
        let token = pending
            .start("broken", async { Err(EngineError::Workflow("boom".into())) })
            .await;

        let mut state = pending.poll(&token).await;
        for _ in 0..50 {
            if !matches!(state, Some(WorkflowState::Pending)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = pending.poll(&token).await;
        }
        assert!(matches!(state, Some(WorkflowState::Failed { message }) if message.contains("boom")));
    }
}
