//! Browser automation back end.
//!
//! The executor only sees [`BrowserDriver`] and [`BrowserSession`]; the
//! concrete implementation launches a Chromium-family browser per task and
//! drives it over the Chrome DevTools Protocol.

pub mod cdp;
pub mod launcher;
pub mod script;
pub mod session;

use async_trait::async_trait;
use std::time::Duration;
use voxnav_core::error::ExecutionError;
use voxnav_core::types::{ActionStep, PageState, Postcondition};

/// What the page looked like after a step completed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepObservation {
    pub page: PageState,
    /// Value read by an `extract` step.
    pub extracted: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub error: ExecutionError,
    /// The step may have changed the page before failing (e.g. a click that
    /// was dispatched but never acknowledged).
    pub effect_may_have_applied: bool,
}

impl StepFailure {
    pub fn clean(error: ExecutionError) -> Self {
        Self { error, effect_may_have_applied: false }
    }

    pub fn uncertain(error: ExecutionError) -> Self {
        Self { error, effect_may_have_applied: true }
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a fresh session dedicated to one task.
    async fn open(&self, task_id: &str) -> Result<Box<dyn BrowserSession>, ExecutionError>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait BrowserSession: Send {
    /// Perform one step, waiting at most `timeout` for its target.
    async fn perform(&mut self, step: &ActionStep, timeout: Duration) -> Result<StepObservation, StepFailure>;

    /// Check a post-condition against the current page.
    async fn verify(&mut self, condition: &Postcondition) -> Result<bool, ExecutionError>;

    async fn page_state(&mut self) -> Result<PageState, ExecutionError>;

    /// Tear the session down. Must be called exactly once.
    async fn close(&mut self);
}

pub use cdp::{CdpClient, CdpError};
pub use launcher::{detect_browser, list_available_browsers, BrowserEngine, ChromeDriver, DriverConfig};
pub use session::CdpSession;
