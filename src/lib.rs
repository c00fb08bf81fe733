pub mod config;
pub mod fallback;
pub mod http;
pub mod observability;
pub mod storage;

pub use fallback::{FallbackRoute, FallbackStrategy, RedirectFallback};
pub use storage::{FileStorage, LinkRecord, StorageError};
