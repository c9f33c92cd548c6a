pub mod config;
pub mod context;
pub mod types;

pub use config::KeelConfig;
pub use context::OperationContext;
pub use types::*;
