//! Haven node kernel
//!
//! Wires the vault, trust store, secure channels, router and control
//! surfaces into a supervised daemon with an orderly lifecycle.

pub mod api;
pub mod config;
pub mod events;
pub mod node;
pub mod supervisor;

pub use config::NodeConfig;
pub use events::{EventBus, NodeEvent};
pub use node::Node;
pub use supervisor::{RestartPolicy, Service, ServiceState, Supervisor, SupervisorError};
