pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logger;
pub mod model;
pub mod multimap;
pub mod queue;
pub mod show_cache;
pub mod store;
pub mod stream;

pub use checkpoint::Checkpoint;
pub use config::Config;
pub use error::{Error, Result};
pub use logger::{AuditLogger, LoggerState};
