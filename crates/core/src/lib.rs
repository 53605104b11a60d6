pub mod config;
pub mod error;
pub mod paths;
pub mod retry;
pub mod selector;
pub mod types;

pub use config::Config;
pub use error::{
    Error, ExecutionError, FailureKind, OrchestrationError, ParseError, Result, TranscriptionError,
};
pub use paths::Paths;
pub use retry::{Backoff, RetryPolicy};
pub use selector::Selector;
pub use types::*;
