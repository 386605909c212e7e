//! Lifecycle hook pipeline
//!
//! Hooks are table-scoped callbacks attached to a lifecycle stage. Each stage
//! has its own argument type; running a stage folds the arguments through
//! every matching hook in registration order.

use futures_util::future::{self, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::error::Result;
use super::query::Query;
use super::schema::{Column, Record, Table};
use super::validation::{FieldValidator, Validator};

pub type HookFuture<T> = BoxFuture<'static, Result<T>>;

/// Type-erased callback for one stage.
pub type Callback<A> = Arc<dyn Fn(&Table, A) -> HookFuture<A> + Send + Sync>;

/// A lifecycle stage and the arguments threaded through its hooks.
pub trait Stage: Copy + Send + Sync + 'static {
    type Args: Send + 'static;

    const NAME: StageName;

    fn wrap(callback: Callback<Self::Args>) -> HookCallback;

    fn callback(hook: &HookCallback) -> Option<&Callback<Self::Args>>;
}

/// Arguments of `pre-retrieve-record`
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveArgs {
    pub id: String,
    pub expansion: Vec<String>,
}

/// Arguments of `pre-retrieve-record-expand`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordExpandArgs {
    pub record: Option<Record>,
    pub expansion: Vec<String>,
}

/// Arguments of the list retrieval stages after the backend call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordsArgs {
    pub query: Query,
    pub records: Vec<Record>,
}

/// Arguments of `pre-update`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateArgs {
    pub id: String,
    pub record: Record,
}

/// Arguments of the `*-validate` stages before validation runs
#[derive(Clone)]
pub struct ValidateArgs {
    pub record: Record,
    pub validator: Validator,
}

/// Arguments of `field-validation`
#[derive(Clone)]
pub struct FieldValidationArgs {
    pub columns: Vec<Column>,
    pub column: Column,
    pub validator: FieldValidator,
}

/// Arguments of `pre-find`
#[derive(Debug, Clone, PartialEq)]
pub struct FindArgs {
    pub ids: Vec<String>,
    pub expansion: Vec<String>,
}

macro_rules! stages {
    ($( $(#[$doc:meta])* $marker:ident($args:ty) => $name:literal, )*) => {
        /// Names of every lifecycle stage
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StageName {
            $($marker,)*
        }

        impl StageName {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(StageName::$marker => $name,)*
                }
            }
        }

        /// Callback tagged with the stage it belongs to
        #[derive(Clone)]
        pub enum HookCallback {
            $($marker(Callback<$args>),)*
        }

        impl HookCallback {
            pub fn stage(&self) -> StageName {
                match self {
                    $(HookCallback::$marker(_) => StageName::$marker,)*
                }
            }
        }

        /// Stage markers passed to `Hook::new` and `HookPipeline::run`
        pub mod stage {
            use super::*;

            $(
                $(#[$doc])*
                #[derive(Debug, Clone, Copy, Default)]
                pub struct $marker;

                impl Stage for $marker {
                    type Args = $args;

                    const NAME: StageName = StageName::$marker;

                    fn wrap(callback: Callback<$args>) -> HookCallback {
                        HookCallback::$marker(callback)
                    }

                    fn callback(hook: &HookCallback) -> Option<&Callback<$args>> {
                        match hook {
                            HookCallback::$marker(cb) => Some(cb),
                            _ => None,
                        }
                    }
                }
            )*
        }
    };
}

stages! {
    /// Before a single record is fetched
    PreRetrieveRecord(RetrieveArgs) => "pre-retrieve-record",
    /// After fetch, before references are expanded
    PreRetrieveRecordExpand(RecordExpandArgs) => "pre-retrieve-record-expand",
    PostRetrieveRecord(Option<Record>) => "post-retrieve-record",
    /// May rewrite the query, e.g. to inject tenant scoping
    PreRetrieveRecords(Query) => "pre-retrieve-records",
    PreRetrieveRecordsExpand(RecordsArgs) => "pre-retrieve-records-expand",
    PostRetrieveRecords(RecordsArgs) => "post-retrieve-records",
    PreCreate(Record) => "pre-create",
    PreCreateValidate(ValidateArgs) => "pre-create-validate",
    PostCreateValidate(Record) => "post-create-validate",
    PostCreate(Record) => "post-create",
    /// Receives the patch before it is merged into the stored record
    PreUpdate(UpdateArgs) => "pre-update",
    PreUpdateValidate(ValidateArgs) => "pre-update-validate",
    PostUpdateValidate(Record) => "post-update-validate",
    PostUpdate(Record) => "post-update",
    PreDelete(String) => "pre-delete",
    PostDelete(String) => "post-delete",
    TableValidation(Validator) => "table-validation",
    FieldValidation(FieldValidationArgs) => "field-validation",
    PreFind(FindArgs) => "pre-find",
    PreFindQuery(Query) => "pre-find-query",
    PostFind(Vec<Record>) => "post-find",
}

/// Which tables a hook applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableMatcher {
    Any,
    Exact(String),
    /// `*` wildcard at either end
    Pattern(String),
}

impl TableMatcher {
    pub fn exact(name: &str) -> Self {
        TableMatcher::Exact(name.to_string())
    }

    pub fn pattern(pattern: &str) -> Self {
        TableMatcher::Pattern(pattern.to_string())
    }

    /// Matches on table name or id
    pub fn matches(&self, table: &Table) -> bool {
        match self {
            TableMatcher::Any => true,
            TableMatcher::Exact(name) => table.is(name),
            TableMatcher::Pattern(p) => matches_pattern(p, &table.name) || matches_pattern(p, &table.id),
        }
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(rest), _) if rest.ends_with('*') => name.contains(&rest[..rest.len() - 1]),
        (Some(suffix), _) => name.ends_with(suffix),
        (None, Some(prefix)) => name.starts_with(prefix),
        (None, None) => pattern == name,
    }
}

/// A registered hook
#[derive(Clone)]
pub struct Hook {
    pub matcher: TableMatcher,
    callback: HookCallback,
}

impl Hook {
    /// Async hook; the returned future must own everything it uses.
    pub fn new<S, F, Fut>(matcher: TableMatcher, _stage: S, f: F) -> Self
    where
        S: Stage,
        F: Fn(&Table, S::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S::Args>> + Send + 'static,
    {
        let callback: Callback<S::Args> =
            Arc::new(move |table: &Table, args: S::Args| -> HookFuture<S::Args> {
                f(table, args).boxed()
            });
        Self {
            matcher,
            callback: S::wrap(callback),
        }
    }

    /// Synchronous transform
    pub fn sync<S, F>(matcher: TableMatcher, _stage: S, f: F) -> Self
    where
        S: Stage,
        F: Fn(&Table, S::Args) -> Result<S::Args> + Send + Sync + 'static,
    {
        let callback: Callback<S::Args> =
            Arc::new(move |table: &Table, args: S::Args| -> HookFuture<S::Args> {
                future::ready(f(table, args)).boxed()
            });
        Self {
            matcher,
            callback: S::wrap(callback),
        }
    }

    pub fn stage(&self) -> StageName {
        self.callback.stage()
    }
}

/// Append-only hook list, shared between clones.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<RwLock<Vec<Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Hook) {
        debug!(stage = hook.stage().as_str(), "registering hook");
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn callbacks_into<S: Stage>(&self, table: &Table, out: &mut Vec<Callback<S::Args>>) {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        out.extend(
            hooks
                .iter()
                .filter(|h| h.matcher.matches(table))
                .filter_map(|h| S::callback(&h.callback).cloned()),
        );
    }
}

/// A source's own hooks followed by any attached registries.
#[derive(Clone, Default)]
pub struct HookPipeline {
    own: HookRegistry,
    attached: Vec<HookRegistry>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Hook) {
        self.own.register(hook);
    }

    /// Consult `registry` after this pipeline's own hooks.
    pub fn attach(&mut self, registry: HookRegistry) {
        self.attached.push(registry);
    }

    /// Fold `args` through every matching hook for `stage`.
    pub async fn run<S: Stage>(&self, _stage: S, table: &Table, mut args: S::Args) -> Result<S::Args> {
        let mut callbacks = Vec::new();
        self.own.callbacks_into::<S>(table, &mut callbacks);
        for registry in &self.attached {
            registry.callbacks_into::<S>(table, &mut callbacks);
        }

        if !callbacks.is_empty() {
            debug!(
                stage = S::NAME.as_str(),
                table = %table.name,
                hooks = callbacks.len(),
                "running hooks"
            );
        }

        for callback in callbacks {
            args = callback(table, args).await?;
        }
        Ok(args)
    }
}
