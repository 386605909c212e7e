//! RecordHub - uniform record access over heterogeneous backends
//!
//! A `DataSource` wraps one backend with lifecycle hooks, validation and
//! foreign-key expansion; a `MultiSource` routes across several of them.

pub mod engine;

pub use engine::{
    BackendError, Config, DataSource, EngineError, MultiSource, RecordSource, Result,
    ValidationError,
};
