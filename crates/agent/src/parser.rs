use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use voxnav_core::config::{AutomationConfig, ReasoningConfig};
use voxnav_core::error::ParseError;
use voxnav_core::types::{ActionPlan, ActionStep, PageState, PlanOrigin, Postcondition, Transcript, WaitCondition};
use voxnav_core::{RetryPolicy, Selector};
use voxnav_providers::{Reasoner, ReasoningError, ReasoningRequest};

use crate::grammar::{parse_command, GrammarMatch};

/// One way of turning a transcript into steps.
///
/// `Ok(None)` means "not mine": the next source gets a chance.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn plan(&self, transcript: &Transcript, page: &PageState) -> Result<Option<ActionPlan>, ParseError>;

    fn name(&self) -> &str;
}

pub struct GrammarParser;

#[async_trait]
impl PlanSource for GrammarParser {
    async fn plan(&self, transcript: &Transcript, _page: &PageState) -> Result<Option<ActionPlan>, ParseError> {
        match parse_command(&transcript.text) {
            GrammarMatch::Plan(steps) => Ok(Some(ActionPlan::new(steps, PlanOrigin::Grammar))),
            GrammarMatch::Ambiguous(reason) => Err(ParseError::Ambiguous(reason)),
            GrammarMatch::NoMatch => Ok(None),
        }
    }

    fn name(&self) -> &str {
        "grammar"
    }
}

/// A failed reasoning call is retried exactly once.
const REASONING_RETRIES: u32 = 1;
const REASONING_BACKOFF_MS: u64 = 500;

/// Delegates free-form commands to the reasoning collaborator.
pub struct ReasoningParser {
    reasoner: Arc<dyn Reasoner>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ReasoningParser {
    pub fn new(reasoner: Arc<dyn Reasoner>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self { reasoner, timeout, retry }
    }

    pub fn from_config(reasoner: Arc<dyn Reasoner>, config: &ReasoningConfig) -> Self {
        Self::new(
            reasoner,
            Duration::from_millis(config.timeout_ms),
            RetryPolicy::exponential(REASONING_RETRIES, REASONING_BACKOFF_MS),
        )
    }
}

#[async_trait]
impl PlanSource for ReasoningParser {
    async fn plan(&self, transcript: &Transcript, page: &PageState) -> Result<Option<ActionPlan>, ParseError> {
        let request = ReasoningRequest {
            transcript: transcript.text.clone(),
            page: page.clone(),
        };
        let timeout = self.timeout;
        let reasoner = &self.reasoner;
        let request = &request;

        let result = self
            .retry
            .run(
                "reasoning",
                |_attempt| async move {
                    match tokio::time::timeout(timeout, reasoner.plan(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ReasoningError::Timeout(format!("no answer within {}ms", timeout.as_millis()))),
                    }
                },
                ReasoningError::is_retryable,
            )
            .await;

        match result {
            Ok(steps) if steps.is_empty() => Err(ParseError::Unsupported(format!(
                "'{}' cannot be carried out in a browser",
                transcript.text
            ))),
            Ok(steps) => {
                info!(backend = self.reasoner.name(), steps = steps.len(), "Reasoning produced a plan");
                Ok(Some(ActionPlan::new(steps, PlanOrigin::Reasoning)))
            }
            Err(ReasoningError::Malformed(reason)) => Err(ParseError::Unsupported(reason)),
            Err(e) => Err(ParseError::ReasoningUnavailable(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        "reasoning"
    }
}

/// Transcript -> validated ActionPlan, trying each source in order.
pub struct IntentParser {
    sources: Vec<Box<dyn PlanSource>>,
    max_wait_ms: u64,
}

impl IntentParser {
    pub fn new(sources: Vec<Box<dyn PlanSource>>, max_wait_ms: u64) -> Self {
        Self { sources, max_wait_ms }
    }

    /// Grammar first, then the reasoner when one is configured.
    pub fn standard(
        reasoner: Option<Arc<dyn Reasoner>>,
        reasoning: &ReasoningConfig,
        automation: &AutomationConfig,
    ) -> Self {
        let mut sources: Vec<Box<dyn PlanSource>> = vec![Box::new(GrammarParser)];
        if let Some(reasoner) = reasoner {
            sources.push(Box::new(ReasoningParser::from_config(reasoner, reasoning)));
        }
        Self::new(sources, automation.max_wait_ms)
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn parse(&self, transcript: &Transcript, page: &PageState) -> Result<ActionPlan, ParseError> {
        for source in &self.sources {
            match source.plan(transcript, page).await? {
                Some(plan) => {
                    validate_plan(&plan, self.max_wait_ms)?;
                    debug!(source = source.name(), steps = plan.len(), "Transcript parsed");
                    return Ok(plan);
                }
                None => debug!(source = source.name(), "No match, trying next source"),
            }
        }
        warn!(text = %transcript.text, "No plan source understood the command");
        Err(ParseError::Unsupported(format!(
            "no command matched '{}' and no reasoning backend is available",
            transcript.text
        )))
    }
}

fn check_selector(raw: &str, index: usize) -> Result<(), ParseError> {
    Selector::parse(raw)
        .map(|_| ())
        .map_err(|e| ParseError::Unsupported(format!("step {}: {}", index, e)))
}

fn check_url(raw: &str, index: usize) -> Result<(), ParseError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ParseError::Unsupported(format!("step {}: invalid url '{}': {}", index, raw, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ParseError::Unsupported(format!(
            "step {}: only http(s) urls can be opened, got '{}'",
            index, raw
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ParseError::Unsupported(format!("step {}: url '{}' has no host", index, raw)));
    }
    Ok(())
}

fn check_postcondition(expect: Option<&Postcondition>, index: usize) -> Result<(), ParseError> {
    match expect {
        Some(Postcondition::UrlContains(value)) | Some(Postcondition::TextVisible(value)) if value.trim().is_empty() => {
            Err(ParseError::Unsupported(format!("step {}: empty post-condition", index)))
        }
        _ => Ok(()),
    }
}

/// Reject plans the executor could not carry out as written.
pub fn validate_plan(plan: &ActionPlan, max_wait_ms: u64) -> Result<(), ParseError> {
    if plan.is_empty() {
        return Err(ParseError::Unsupported("plan has no steps".to_string()));
    }
    for (index, step) in plan.steps.iter().enumerate() {
        match step {
            ActionStep::Navigate { url } => check_url(url, index)?,
            ActionStep::Click { selector, expect } | ActionStep::Type { selector, expect, .. } => {
                check_selector(selector, index)?;
                check_postcondition(expect.as_ref(), index)?;
            }
            ActionStep::Extract { selector } => check_selector(selector, index)?,
            ActionStep::Wait { condition, timeout_ms } => {
                if *timeout_ms == 0 || *timeout_ms > max_wait_ms {
                    return Err(ParseError::Unsupported(format!(
                        "step {}: wait timeout {}ms outside 1..={}ms",
                        index, timeout_ms, max_wait_ms
                    )));
                }
                match condition {
                    WaitCondition::Selector(selector) => check_selector(selector, index)?,
                    WaitCondition::Text(text) | WaitCondition::UrlContains(text) if text.trim().is_empty() => {
                        return Err(ParseError::Unsupported(format!("step {}: empty wait condition", index)));
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
