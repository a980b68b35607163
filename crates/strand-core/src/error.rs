use std::any::Any;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::ids::WorkerId;

/// A thrown value: what a handler fails with and what a promise rejects with.
pub type Reason = serde_json::Value;

/// The worker entry point could not be resolved or initialized.
///
/// Surfaced synchronously from `spawn`; no live worker exists afterwards.
#[derive(Debug, Error)]
pub enum ModuleLoadError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module `{module}` failed to initialize: {reason}")]
    Init { module: String, reason: Reason },

    #[error("module `{module}` did not finish initializing within {timeout:?}")]
    InitTimeout { module: String, timeout: Duration },

    #[error("failed to start worker thread for module `{module}`")]
    Thread {
        module: String,
        #[source]
        source: io::Error,
    },
}

/// Errors from building a [`crate::module::ModuleRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module `{0}` is already registered")]
    AlreadyRegistered(String),
}

/// An error escaped a message or timer handler inside a worker.
#[derive(Debug, Error)]
#[error("uncaught error in {worker}: {reason}")]
pub struct UncaughtWorkerError {
    pub worker: WorkerId,
    pub reason: Reason,
}

/// A promise rejected and was dropped without any continuation attached.
#[derive(Debug, Clone, Error)]
#[error("unhandled promise rejection: {reason}")]
pub struct UnhandledRejection {
    pub reason: Reason,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] io::Error),

    #[error("invalid config json")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Converts a caught panic payload into a `Reason`.
pub(crate) fn panic_reason(payload: Box<dyn Any + Send>) -> Reason {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    Reason::String(format!("panic: {message}"))
}
