//! A single task's browser session driven over CDP.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use voxnav_core::error::ExecutionError;
use voxnav_core::types::{ActionStep, PageState, Postcondition, WaitCondition};
use voxnav_core::Selector;

use crate::cdp::{CdpClient, CdpError};
use crate::script;
use crate::{BrowserSession, StepFailure, StepObservation};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const CLOSE_GRACE: Duration = Duration::from_secs(3);

pub struct CdpSession {
    task_id: String,
    process: Option<Child>,
    cdp: CdpClient,
    user_data_dir: Option<PathBuf>,
    last_url: Option<String>,
    closed: bool,
}

fn to_execution_error(e: CdpError) -> ExecutionError {
    match e {
        CdpError::Closed(m) => ExecutionError::SessionLost(m),
        CdpError::Timeout(m) => ExecutionError::StepTimeout(m),
        CdpError::Protocol(m) => ExecutionError::StepNotFound(m),
    }
}

/// Errors raised once an action was dispatched leave its effect unknown,
/// except a script exception which means the action never ran.
fn action_failure(e: CdpError) -> StepFailure {
    let applied = !matches!(e, CdpError::Protocol(_));
    StepFailure {
        error: to_execution_error(e),
        effect_may_have_applied: applied,
    }
}

fn uncertain(e: CdpError) -> StepFailure {
    StepFailure::uncertain(to_execution_error(e))
}

fn found(value: &Value) -> bool {
    value.get("found").and_then(|v| v.as_bool()).unwrap_or(false)
}

impl CdpSession {
    pub fn new(task_id: &str, process: Child, cdp: CdpClient, user_data_dir: PathBuf) -> Self {
        Self {
            task_id: task_id.to_string(),
            process: Some(process),
            cdp,
            user_data_dir: Some(user_data_dir),
            last_url: None,
            closed: false,
        }
    }

    /// A session over an already running browser; nothing is torn down on close
    /// besides the connection.
    pub fn attach(task_id: &str, cdp: CdpClient) -> Self {
        Self {
            task_id: task_id.to_string(),
            process: None,
            cdp,
            user_data_dir: None,
            last_url: None,
            closed: false,
        }
    }

    /// Evaluate `expression` every 200ms until it yields `true` or the deadline
    /// passes. Script errors while a document is swapping count as "not yet".
    async fn poll_until(&self, expression: &str, deadline: Instant) -> Result<bool, CdpError> {
        loop {
            match self.cdp.evaluate_js(expression).await {
                Ok(Value::Bool(true)) => return Ok(true),
                Ok(_) => {}
                Err(CdpError::Protocol(e)) => debug!(error = %e, "Poll evaluation failed, retrying"),
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn wait_for_element(&self, selector: &Selector, deadline: Instant) -> Result<(), StepFailure> {
        let present = self
            .poll_until(&script::element_exists(selector), deadline)
            .await
            .map_err(|e| StepFailure::clean(to_execution_error(e)))?;
        if present {
            Ok(())
        } else {
            Err(StepFailure::clean(ExecutionError::StepTimeout(format!(
                "element '{}' did not appear",
                selector
            ))))
        }
    }

    async fn wait_condition(&self, condition: &WaitCondition, timeout: Duration) -> Result<(), StepFailure> {
        let deadline = Instant::now() + timeout;
        let expression = match condition {
            WaitCondition::Delay => {
                tokio::time::sleep(timeout).await;
                return Ok(());
            }
            WaitCondition::Selector(raw) => {
                let selector = parse_selector(raw)?;
                script::element_exists(&selector)
            }
            WaitCondition::Text(text) => script::text_visible(text),
            WaitCondition::UrlContains(fragment) => script::url_contains(fragment),
        };
        let met = self
            .poll_until(&expression, deadline)
            .await
            .map_err(|e| StepFailure::clean(to_execution_error(e)))?;
        if met {
            Ok(())
        } else {
            Err(StepFailure::clean(ExecutionError::StepTimeout(format!(
                "condition {:?} not met within {}ms",
                condition,
                timeout.as_millis()
            ))))
        }
    }

    /// Best effort: a page mid-navigation may not answer, in which case the
    /// last known url is reported.
    async fn observe(&mut self) -> PageState {
        match self.read_page_state().await {
            Ok(page) => page,
            Err(e) => {
                debug!(task_id = %self.task_id, error = %e, "Page state unavailable after step");
                PageState { url: self.last_url.clone(), ..Default::default() }
            }
        }
    }

    async fn read_page_state(&mut self) -> Result<PageState, CdpError> {
        let value = self.cdp.evaluate_js(script::PAGE_STATE).await?;
        let page: PageState = serde_json::from_value(value)
            .map_err(|e| CdpError::Protocol(format!("unexpected page state: {}", e)))?;
        if page.url.is_some() {
            self.last_url = page.url.clone();
        }
        Ok(page)
    }

    async fn run_step(&mut self, step: &ActionStep, timeout: Duration) -> Result<Option<String>, StepFailure> {
        let deadline = Instant::now() + timeout;
        match step {
            ActionStep::Navigate { url } => {
                let cdp = &self.cdp;
                let nav = tokio::time::timeout(timeout, cdp.navigate(url))
                    .await
                    .map_err(|_| StepFailure::clean(ExecutionError::StepTimeout(format!("navigation to {}", url))))?;
                nav.map_err(|e| StepFailure::clean(to_execution_error(e)))?;
                let ready = format!("{} === 'complete' || {} === 'interactive'", script::READY_STATE, script::READY_STATE);
                let loaded = self
                    .poll_until(&ready, deadline)
                    .await
                    .map_err(|e| StepFailure::clean(to_execution_error(e)))?;
                if !loaded {
                    return Err(StepFailure::clean(ExecutionError::StepTimeout(format!(
                        "{} did not finish loading",
                        url
                    ))));
                }
                Ok(None)
            }
            ActionStep::Click { selector, .. } => {
                let selector = parse_selector(selector)?;
                self.wait_for_element(&selector, deadline).await?;
                let result = self.cdp.evaluate_js(&script::click(&selector)).await.map_err(action_failure)?;
                if !found(&result) {
                    return Err(StepFailure::clean(ExecutionError::StepNotFound(selector.to_string())));
                }
                Ok(None)
            }
            ActionStep::Type { selector, text, .. } => {
                let selector = parse_selector(selector)?;
                self.wait_for_element(&selector, deadline).await?;
                let focused = self
                    .cdp
                    .evaluate_js(&script::focus_for_typing(&selector))
                    .await
                    .map_err(action_failure)?;
                if !found(&focused) {
                    return Err(StepFailure::clean(ExecutionError::StepNotFound(selector.to_string())));
                }
                self.cdp.insert_text(text).await.map_err(uncertain)?;
                self.cdp
                    .evaluate_js(&script::commit_typing(&selector))
                    .await
                    .map_err(uncertain)?;
                Ok(None)
            }
            ActionStep::Wait { condition, .. } => {
                self.wait_condition(condition, timeout).await?;
                Ok(None)
            }
            ActionStep::Extract { selector } => {
                let selector = parse_selector(selector)?;
                self.wait_for_element(&selector, deadline).await?;
                let result = self
                    .cdp
                    .evaluate_js(&script::extract(&selector))
                    .await
                    .map_err(|e| StepFailure::clean(to_execution_error(e)))?;
                if !found(&result) {
                    return Err(StepFailure::clean(ExecutionError::StepNotFound(selector.to_string())));
                }
                let value = result.get("value").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(Some(value.to_string()))
            }
        }
    }
}

fn parse_selector(raw: &str) -> Result<Selector, StepFailure> {
    Selector::parse(raw).map_err(|e| StepFailure::clean(ExecutionError::StepNotFound(e)))
}

#[async_trait]
impl BrowserSession for CdpSession {
    async fn perform(&mut self, step: &ActionStep, timeout: Duration) -> Result<StepObservation, StepFailure> {
        if self.closed || self.cdp.is_closed() {
            return Err(StepFailure::clean(ExecutionError::SessionLost(
                "browser connection is closed".to_string(),
            )));
        }
        debug!(task_id = %self.task_id, action = step.name(), timeout_ms = timeout.as_millis() as u64, "Performing step");
        let extracted = self.run_step(step, timeout).await?;
        let page = self.observe().await;
        Ok(StepObservation { page, extracted })
    }

    async fn verify(&mut self, condition: &Postcondition) -> Result<bool, ExecutionError> {
        let expression = match condition {
            Postcondition::UrlContains(fragment) => script::url_contains(fragment),
            Postcondition::TextVisible(text) => script::text_visible(text),
        };
        match self.cdp.evaluate_js(&expression).await {
            Ok(value) => Ok(value.as_bool().unwrap_or(false)),
            Err(CdpError::Protocol(e)) => {
                debug!(error = %e, "Post-condition check failed to evaluate");
                Ok(false)
            }
            Err(e) => Err(to_execution_error(e)),
        }
    }

    async fn page_state(&mut self) -> Result<PageState, ExecutionError> {
        self.read_page_state().await.map_err(to_execution_error)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.process.is_some() {
            match tokio::time::timeout(CLOSE_GRACE, self.cdp.send_command("Browser.close", json!({}))).await {
                Ok(Err(e)) => debug!("CDP Browser.close failed (may already be closed): {}", e),
                Err(_) => debug!("CDP Browser.close did not answer in time"),
                Ok(Ok(_)) => {}
            }
        }
        if let Some(mut process) = self.process.take() {
            let _ = process.kill().await;
        }
        if let Some(dir) = self.user_data_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %e, "Failed to remove browser profile");
            }
        }
        info!(task_id = %self.task_id, "Browser session closed");
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            let _ = process.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Fake page: `present` controls whether elements exist; every evaluated
    /// expression and inserted text is recorded.
    struct FakePage {
        present: bool,
        url: String,
        seen: Vec<String>,
    }

    async fn fake_browser(page: Arc<Mutex<FakePage>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let req: Value = serde_json::from_str(&text).unwrap();
                let id = req["id"].clone();
                let result = {
                    let mut page = page.lock().unwrap();
                    match req["method"].as_str().unwrap_or_default() {
                        "Page.navigate" => {
                            page.url = req["params"]["url"].as_str().unwrap_or_default().to_string();
                            json!({"frameId": "main"})
                        }
                        "Input.insertText" => {
                            let typed = req["params"]["text"].as_str().unwrap_or_default().to_string();
                            page.seen.push(format!("insert:{}", typed));
                            json!({})
                        }
                        "Runtime.evaluate" => {
                            let expr = req["params"]["expression"].as_str().unwrap_or_default().to_string();
                            page.seen.push(expr.clone());
                            let value = if expr.contains("document.readyState") {
                                json!(true)
                            } else if expr.starts_with("(function() { var seen") {
                                json!({"url": page.url, "title": "Fake", "labels": ["Search"]})
                            } else if expr.ends_with("!== null") {
                                json!(page.present)
                            } else if expr.contains("value: (v || '').trim()") {
                                json!({"found": page.present, "value": "42 results"})
                            } else if expr.contains("window.location.href.indexOf") {
                                json!(page.url.contains("results"))
                            } else {
                                json!({"found": page.present})
                            };
                            json!({"result": {"type": "object", "value": value}})
                        }
                        _ => json!({}),
                    }
                };
                ws.send(Message::Text(json!({"id": id, "result": result}).to_string()))
                    .await
                    .unwrap();
            }
        });
        format!("ws://{}", addr)
    }

    async fn session(present: bool) -> (CdpSession, Arc<Mutex<FakePage>>) {
        let page = Arc::new(Mutex::new(FakePage { present, url: "about:blank".into(), seen: vec![] }));
        let url = fake_browser(page.clone()).await;
        let cdp = CdpClient::connect(&url).await.unwrap();
        (CdpSession::attach("t1", cdp), page)
    }

    #[test]
    fn test_cdp_error_mapping() {
        assert!(matches!(to_execution_error(CdpError::Closed("x".into())), ExecutionError::SessionLost(_)));
        assert!(matches!(to_execution_error(CdpError::Timeout("x".into())), ExecutionError::StepTimeout(_)));
        assert!(matches!(to_execution_error(CdpError::Protocol("x".into())), ExecutionError::StepNotFound(_)));
        assert!(action_failure(CdpError::Timeout("x".into())).effect_may_have_applied);
        assert!(!action_failure(CdpError::Protocol("x".into())).effect_may_have_applied);
    }

    #[tokio::test]
    async fn test_navigate_reports_page_state() {
        let (mut s, _) = session(true).await;
        let obs = s
            .perform(&ActionStep::navigate("https://example.com/results"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(obs.page.url.as_deref(), Some("https://example.com/results"));
        assert_eq!(obs.page.labels, vec!["Search".to_string()]);
        assert!(s.verify(&Postcondition::UrlContains("results".into())).await.unwrap());
        s.close().await;
    }

    #[tokio::test]
    async fn test_type_inserts_text() {
        let (mut s, page) = session(true).await;
        s.perform(&ActionStep::type_text("input[name='q']", "rust"), Duration::from_secs(2))
            .await
            .unwrap();
        let seen = page.lock().unwrap().seen.clone();
        assert!(seen.contains(&"insert:rust".to_string()));
        assert!(seen.iter().any(|e| e.contains("new Event('change'")));
    }

    #[tokio::test]
    async fn test_extract_returns_value() {
        let (mut s, _) = session(true).await;
        let obs = s
            .perform(&ActionStep::extract("text=results"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(obs.extracted.as_deref(), Some("42 results"));
    }

    #[tokio::test]
    async fn test_missing_element_times_out() {
        let (mut s, _) = session(false).await;
        let failure = s
            .perform(&ActionStep::click("#submit"), Duration::from_millis(450))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ExecutionError::StepTimeout(_)));
        assert!(!failure.effect_may_have_applied);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_steps() {
        let (mut s, _) = session(true).await;
        s.close().await;
        s.close().await;
        let failure = s
            .perform(&ActionStep::click("#submit"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ExecutionError::SessionLost(_)));
    }
}
