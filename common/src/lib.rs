pub mod args;
pub mod context;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod shutdown;
pub mod timefmt;

pub use context::{OpContext, TraceId};
pub use retry::{Retriable, RetryError, RetryPolicy};
