// RecordHub Engine - Core module structure
pub mod adapter;
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod hooks;
pub mod query;
pub mod router;
pub mod schema;
pub mod source;
pub mod validation;
pub mod workflow;

pub use config::Config;
pub use error::{BackendError, EngineError, Result, ValidationError};
pub use router::MultiSource;
pub use source::{DataSource, RecordSource};
