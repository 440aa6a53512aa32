pub mod catalog;
pub mod config;
pub mod environment;
pub mod error;
pub mod error_payload;
pub mod http;
pub mod logs;
pub mod orchestrator;
pub mod port_alloc;
pub mod reconcile;
pub mod registry;
pub mod sandbox;
pub mod supervisor;
pub mod templates;

pub use error::{DemoError, DemoResult};
pub use orchestrator::Orchestrator;
