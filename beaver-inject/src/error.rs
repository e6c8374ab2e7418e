use thiserror::Error;

use crate::descriptor::Declaration;
use crate::key::Key;

pub type Result<T, E = InjectError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("invalid qualifier `{qualifier}`: {reason}")]
    InvalidQualifier { qualifier: String, reason: String },

    #[error("unable to instantiate module `{module}`: {source}")]
    ModuleInstantiation {
        module: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{key} is bound more than once:\n  1: {first}\n  2: {second}")]
    DuplicateBinding {
        key: Key,
        first: Declaration,
        second: Declaration,
    },

    #[error("no binding for {key}, required by {requested_by}")]
    UnresolvedDependency { key: Key, requested_by: Declaration },

    #[error("cyclic binding: {}", render_path(.path))]
    CyclicBinding { path: Vec<Key> },

    #[error("no binding registered for {key}")]
    UnknownBinding { key: Key },

    #[error("error providing {key}{}: {source}", declared_at(.declaration))]
    Provision {
        key: Key,
        declaration: Option<Declaration>,
        #[source]
        source: anyhow::Error,
    },

    #[error("value of {key} is not a `{expected}`")]
    TypeMismatch { key: Key, expected: &'static str },

    #[error("lazy handle for {key} outlived its injector")]
    InjectorDropped { key: Key },

    #[error("unable to load config: {0}")]
    ConfigLoadError(#[from] config::ConfigError),

    #[error("invalid config value: {0}")]
    InvalidConfigValueError(String),

    #[error("unable to create log file: {0}")]
    LogFileCreationError(Box<dyn std::error::Error + Send + Sync>),

    #[error("unable to initialize tracing subscriber: {0}")]
    TracingSubscriberInitError(Box<dyn std::error::Error + Send + Sync>),
}

fn render_path(path: &[Key]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn declared_at(declaration: &Option<Declaration>) -> String {
    match declaration {
        Some(declaration) => format!(" from {}", declaration),
        None => String::new(),
    }
}
