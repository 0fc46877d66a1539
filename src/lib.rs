pub mod client;
pub mod engine;
pub mod fetcher;
pub mod limiter;
pub mod merge;
pub mod models;
pub mod plan;
pub mod probe;
pub mod progress;

/// Convenient re-exports for front-ends.
pub mod prelude {
    pub use crate::engine::{DownloadEngine, EngineError};
    pub use crate::models::{DownloadRequest, EngineState, OriginCapability, ProgressSnapshot};
    pub use crate::progress::DownloadObserver;
}
