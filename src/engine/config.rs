//! RecordHub Configuration Module
//! Handles loading recordhub.config.json and wiring its sources into a router

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::adapter::airtable::{AirtableBackend, AirtableClient};
use super::adapter::json_file::JsonFileBackend;
use super::adapter::rest::RestBackend;
use super::adapter::Backend;
use super::error::{BackendError, EngineError};
use super::router::MultiSource;
use super::source::DataSource;

pub const CONFIG_FILE: &str = "recordhub.config.json";

const DEFAULT_AIRTABLE_KEY_ENV: &str = "AIRTABLE_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Missing credential for source '{0}'")]
    MissingCredential(String),
    #[error("Failed to open source: {0}")]
    Source(#[from] EngineError),
}

impl From<BackendError> for ConfigError {
    fn from(err: BackendError) -> Self {
        ConfigError::Source(err.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub version: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    /// Let references resolve into tables owned by other sources
    #[serde(default)]
    pub cross_source_expansion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SourceConfig {
    Json {
        name: String,
        path: PathBuf,
    },
    Rest {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Airtable {
        name: String,
        base_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_url: Option<String>,
    },
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Json { name, .. }
            | SourceConfig::Rest { name, .. }
            | SourceConfig::Airtable { name, .. } => name,
        }
    }

    /// Build the backend this entry describes. Relative paths resolve against `base_dir`.
    pub async fn open_backend(&self, base_dir: &Path) -> Result<Arc<dyn Backend>, ConfigError> {
        let backend: Arc<dyn Backend> = match self {
            SourceConfig::Json { path, .. } => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                Arc::new(JsonFileBackend::open_or_create(&path).await?)
            }
            SourceConfig::Rest { url, token, .. } => {
                let backend = RestBackend::new(url)?;
                Arc::new(match token {
                    Some(token) => backend.with_token(token),
                    None => backend,
                })
            }
            SourceConfig::Airtable {
                name,
                base_id,
                api_key,
                api_key_env,
                api_url,
            } => {
                let env = api_key_env.as_deref().unwrap_or(DEFAULT_AIRTABLE_KEY_ENV);
                let key = api_key
                    .clone()
                    .or_else(|| std::env::var(env).ok())
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| ConfigError::MissingCredential(name.clone()))?;
                let client = match api_url {
                    Some(url) => AirtableClient::with_api_url(url, base_id, &key)?,
                    None => AirtableClient::new(base_id, &key)?,
                };
                Arc::new(AirtableBackend::new(client))
            }
        };
        Ok(backend)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_name() -> String {
    "recordhub".to_string()
}

fn default_port() -> u16 {
    54321
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_project(name: &str) -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: name.to_string(),
            sources: vec![SourceConfig::Json {
                name: name.to_string(),
                path: PathBuf::from("./data"),
            }],
            api: ApiConfig::default(),
            cross_source_expansion: false,
        }
    }

    /// Connect every configured source, in order, behind one router.
    pub async fn build_router(&self, base_dir: &Path) -> Result<MultiSource, ConfigError> {
        let mut router =
            MultiSource::new(&self.name).with_cross_source_expansion(self.cross_source_expansion);
        for entry in &self.sources {
            let backend = entry.open_backend(base_dir).await?;
            let kind = backend.kind();
            let source = DataSource::connect(entry.name(), backend).await?;
            info!(
                source = entry.name(),
                kind,
                tables = source.schema().tables.len(),
                "source connected"
            );
            router.add_source(source)?;
        }
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::source::RecordSource;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_sources() {
        let config: Config = serde_json::from_value(json!({
            "version": "0.1.0",
            "sources": [
                {"type": "json", "name": "local", "path": "./data"},
                {"type": "rest", "name": "remote", "url": "http://localhost:9000/api"},
                {"type": "airtable", "name": "crm", "baseId": "appX", "apiKeyEnv": "CRM_KEY"}
            ],
            "crossSourceExpansion": true
        }))
        .unwrap();

        assert_eq!(config.name, "recordhub");
        assert_eq!(config.api.port, 54321);
        assert!(config.cross_source_expansion);
        assert_eq!(config.sources.len(), 3);
        assert_eq!(
            config.sources[2],
            SourceConfig::Airtable {
                name: "crm".into(),
                base_id: "appX".into(),
                api_key: None,
                api_key_env: Some("CRM_KEY".into()),
                api_url: None,
            }
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(ConfigError::NotFound(_))
        ));

        Config::default_for_project("notes").save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.name, "notes");
        assert_eq!(loaded.sources[0].name(), "notes");
    }

    #[tokio::test]
    async fn test_build_router_creates_json_store() {
        let dir = tempdir().unwrap();
        let router = Config::default_for_project("notes")
            .build_router(dir.path())
            .await
            .unwrap();

        assert_eq!(router.name(), "notes");
        assert!(router.get_table_names().is_empty());
        assert!(dir.path().join("data").join("_meta.json").exists());
    }

    #[tokio::test]
    async fn test_airtable_without_key_is_rejected() {
        let source = SourceConfig::Airtable {
            name: "crm".into(),
            base_id: "appX".into(),
            api_key: None,
            api_key_env: Some("RECORDHUB_TEST_UNSET_KEY".into()),
            api_url: None,
        };
        let err = source.open_backend(Path::new(".")).await.err().unwrap();
        assert!(matches!(err, ConfigError::MissingCredential(name) if name == "crm"));
    }
}
