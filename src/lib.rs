pub mod accounts;
pub mod config;
pub mod engine;
pub mod executor;
pub mod llm;
pub mod notify;
pub mod protocol;
pub mod responder;
pub mod router;
pub mod runtime;
pub mod supervisor;
pub mod throttle;

pub use chatpilot_app::logging;
pub use chatpilot_core::error;
pub use chatpilot_core::llm_types;
pub use chatpilot_core::text;
pub use chatpilot_storage::db;
pub use chatpilot_storage::patterns;
