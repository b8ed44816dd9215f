//! Change-log consumption: one task per partition applying records in log
//! order, with bounded retries on storage faults.

mod retry;
mod service;
mod task;

pub use retry::{RetryPolicy, retry_with_backoff};
pub use service::IngestionService;
pub use task::IngestionProgress;
