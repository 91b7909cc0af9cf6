pub mod engine;
pub mod error;
pub mod observability;
pub mod store;

use std::sync::Arc;

pub use engine::{BatchSummary, Engine, EngineConfig};
pub use error::EngineError;
pub use store::{MessageStore, SqlStore, StoreError};

/// Shared state handed to the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}
