use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxnav_browser::{BrowserDriver, BrowserSession, StepFailure, StepObservation};
use voxnav_core::config::AutomationConfig;
use voxnav_core::error::{ExecutionError, FailureKind};
use voxnav_core::types::{
    ActionPlan, ActionStep, Extraction, LogEntry, PageState, StepOutcome, TaskFailure, TaskResult, TaskState,
};
use voxnav_core::RetryPolicy;

/// Extra time the driver gets beyond the step timeout before the call is
/// abandoned.
const DRIVER_GRACE: Duration = Duration::from_secs(2);

/// Receives every per-step log entry as it happens.
#[async_trait]
pub trait ExecutionJournal: Send + Sync {
    async fn record(&self, entry: LogEntry);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(TaskResult),
    Failed(TaskFailure),
    Aborted(TaskFailure),
}

impl ExecutionOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            ExecutionOutcome::Succeeded(_) => TaskState::Succeeded,
            ExecutionOutcome::Failed(_) => TaskState::Failed,
            ExecutionOutcome::Aborted(_) => TaskState::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    /// Last page observed before the session closed.
    pub page: Option<PageState>,
}

enum StepResult {
    Done(StepObservation),
    Fatal(TaskFailure),
    Cancelled,
}

/// Drives one plan through a dedicated browser session.
pub struct Executor {
    driver: Arc<dyn BrowserDriver>,
    step_timeout: Duration,
    retry: RetryPolicy,
    max_wait: Duration,
}

impl Executor {
    pub fn new(driver: Arc<dyn BrowserDriver>, step_timeout: Duration, retry: RetryPolicy, max_wait: Duration) -> Self {
        Self { driver, step_timeout, retry, max_wait }
    }

    pub fn from_config(driver: Arc<dyn BrowserDriver>, config: &AutomationConfig) -> Self {
        Self::new(
            driver,
            Duration::from_millis(config.step_timeout_ms),
            config.step_retry_policy(),
            Duration::from_millis(config.max_wait_ms),
        )
    }

    fn timeout_for(&self, step: &ActionStep) -> Duration {
        match step {
            ActionStep::Wait { timeout_ms, .. } => Duration::from_millis(*timeout_ms).min(self.max_wait),
            _ => self.step_timeout,
        }
    }

    /// Run `plan` to a terminal outcome. The session is closed exactly once
    /// whenever it was opened.
    pub async fn execute(
        &self,
        task_id: &str,
        plan: &ActionPlan,
        cancel: &CancellationToken,
        journal: &dyn ExecutionJournal,
    ) -> ExecutionReport {
        if cancel.is_cancelled() {
            return ExecutionReport {
                outcome: ExecutionOutcome::Aborted(TaskFailure::new(FailureKind::Cancelled, "cancelled before execution")),
                page: None,
            };
        }

        let mut session = match self.driver.open(task_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(task_id, error = %e, "Could not open browser session");
                let failure = TaskFailure::new(FailureKind::SessionLost, e.to_string());
                return ExecutionReport { outcome: ExecutionOutcome::Failed(failure), page: None };
            }
        };
        info!(task_id, steps = plan.len(), driver = self.driver.name(), "Executing plan");

        let mut result = TaskResult::default();
        let mut page: Option<PageState> = None;
        let mut outcome = None;

        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                journal.record(LogEntry::now(index, StepOutcome::Cancelled)).await;
                outcome = Some(ExecutionOutcome::Aborted(
                    TaskFailure::new(FailureKind::Cancelled, format!("cancelled before step {}", index)).at_step(index),
                ));
                break;
            }

            match self.run_step(task_id, index, step, session.as_mut(), cancel, journal).await {
                StepResult::Done(observation) => {
                    if let ActionStep::Extract { selector } = step {
                        result.extracted.push(Extraction {
                            step_index: index,
                            selector: selector.clone(),
                            value: observation.extracted.clone().unwrap_or_default(),
                        });
                    }
                    page = Some(observation.page);
                }
                StepResult::Fatal(failure) => {
                    outcome = Some(ExecutionOutcome::Failed(failure));
                    break;
                }
                StepResult::Cancelled => {
                    journal.record(LogEntry::now(index, StepOutcome::Cancelled)).await;
                    outcome = Some(ExecutionOutcome::Aborted(
                        TaskFailure::new(FailureKind::Cancelled, format!("cancelled during step {}", index))
                            .at_step(index),
                    ));
                    break;
                }
            }
        }

        session.close().await;

        let outcome = outcome.unwrap_or_else(|| {
            result.final_url = page.as_ref().and_then(|p| p.url.clone());
            ExecutionOutcome::Succeeded(result)
        });
        info!(task_id, state = %outcome.state(), "Plan finished");
        ExecutionReport { outcome, page }
    }

    async fn run_step(
        &self,
        task_id: &str,
        index: usize,
        step: &ActionStep,
        session: &mut dyn BrowserSession,
        cancel: &CancellationToken,
        journal: &dyn ExecutionJournal,
    ) -> StepResult {
        let timeout = self.timeout_for(step);
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            debug!(task_id, step = index, action = step.name(), attempt, "Step attempt");
            let performed = match tokio::time::timeout(timeout + DRIVER_GRACE, session.perform(step, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(StepFailure {
                    error: ExecutionError::StepTimeout(format!("driver did not answer within {}ms", timeout.as_millis())),
                    effect_may_have_applied: step.mutates_page(),
                }),
            };

            let failure = match performed {
                Ok(observation) => {
                    journal
                        .record(LogEntry::now(
                            index,
                            StepOutcome::Success { attempts: attempt, url: observation.page.url.clone(), verified: false },
                        ))
                        .await;
                    return StepResult::Done(observation);
                }
                Err(failure) => failure,
            };

            // A mutating step may already have happened: never repeat it blindly.
            if failure.effect_may_have_applied && step.mutates_page() {
                return self.confirm_effect(task_id, index, step, attempt, failure, session, journal).await;
            }

            let kind = failure.error.kind();
            let reason = failure.error.to_string();
            if failure.error.is_transient() && attempt < max_attempts {
                warn!(task_id, step = index, attempt, kind = %kind, reason = %reason, "Step failed, retrying");
                journal
                    .record(LogEntry::now(index, StepOutcome::Retrying { attempt, kind, reason }))
                    .await;
                let delay = self.retry.delay_for(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return StepResult::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                continue;
            }

            warn!(task_id, step = index, attempts = attempt, kind = %kind, reason = %reason, "Step failed");
            journal
                .record(LogEntry::now(index, StepOutcome::Failed { attempts: attempt, kind, reason: reason.clone() }))
                .await;
            return StepResult::Fatal(TaskFailure::new(kind, reason).at_step(index));
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn confirm_effect(
        &self,
        task_id: &str,
        index: usize,
        step: &ActionStep,
        attempt: u32,
        failure: StepFailure,
        session: &mut dyn BrowserSession,
        journal: &dyn ExecutionJournal,
    ) -> StepResult {
        let verdict = match step.postcondition() {
            Some(condition) => match session.verify(condition).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!(
                    "{} may have been applied ({}) but {:?} was not observed",
                    step.name(),
                    failure.error,
                    condition
                )),
                Err(e) => Err(format!("{} may have been applied ({}); verification failed: {}", step.name(), failure.error, e)),
            },
            None => Err(format!(
                "{} may have been applied ({}) and declares no post-condition to confirm it",
                step.name(),
                failure.error
            )),
        };

        match verdict {
            Ok(()) => {
                info!(task_id, step = index, "Post-condition confirmed the step's effect");
                let page = session.page_state().await.unwrap_or_default();
                journal
                    .record(LogEntry::now(
                        index,
                        StepOutcome::Success { attempts: attempt, url: page.url.clone(), verified: true },
                    ))
                    .await;
                StepResult::Done(StepObservation { page, extracted: None })
            }
            Err(reason) => {
                let kind = FailureKind::PostconditionFailed;
                warn!(task_id, step = index, reason = %reason, "Post-condition not satisfied");
                journal
                    .record(LogEntry::now(index, StepOutcome::Failed { attempts: attempt, kind, reason: reason.clone() }))
                    .await;
                StepResult::Fatal(TaskFailure::new(kind, reason).at_step(index))
            }
        }
    }
}
