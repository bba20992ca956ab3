//! Node services shared by the storage layer.
//!
//! - **Background workers** (`worker`): a dedicated task per concern, fed by
//!   a bounded queue (the cache's eviction worker runs on one).

pub mod worker;

pub use worker::{BackgroundRunnable, BackgroundWorker, SubmitError};
