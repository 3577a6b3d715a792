//! Supervisor error kinds
//!
//! Lifecycle failures map to their own variants so callers can count
//! and classify them without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service {0} already registered")]
    AlreadyRegistered(String),

    #[error("module {0} already registered")]
    ModuleAlreadyRegistered(String),

    #[error("unknown service {0}")]
    UnknownService(String),

    #[error("service {service} depends on unregistered {dependency}")]
    MissingDependency { service: String, dependency: String },

    #[error("service dependency cycle detected")]
    DependencyCycle,

    /// A service's own `init` or `start` failed. Startup failures are
    /// fatal and never restarted silently.
    #[error("service {name} failed during {phase}: {message}")]
    ServiceFailed {
        name: String,
        phase: &'static str,
        message: String,
    },
}
