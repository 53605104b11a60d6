//! Locating and launching a Chromium-family browser with remote debugging.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use voxnav_core::config::AutomationConfig;
use voxnav_core::error::ExecutionError;

use crate::cdp::CdpClient;
use crate::session::CdpSession;
use crate::{BrowserDriver, BrowserSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chrome,
    Edge,
    Chromium,
}

impl BrowserEngine {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chrome" | "google-chrome" => Some(Self::Chrome),
            "edge" | "msedge" => Some(Self::Edge),
            "chromium" => Some(Self::Chromium),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
            Self::Chromium => "chromium",
        }
    }

    fn candidates(&self) -> Vec<&'static str> {
        match self {
            Self::Chrome => {
                if cfg!(target_os = "macos") {
                    vec!["/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"]
                } else if cfg!(target_os = "linux") {
                    vec!["google-chrome", "google-chrome-stable", "/usr/bin/google-chrome"]
                } else {
                    vec![
                        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                    ]
                }
            }
            Self::Edge => {
                if cfg!(target_os = "macos") {
                    vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"]
                } else if cfg!(target_os = "linux") {
                    vec!["microsoft-edge", "microsoft-edge-stable", "/usr/bin/microsoft-edge"]
                } else {
                    vec![
                        r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                        r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                    ]
                }
            }
            Self::Chromium => {
                if cfg!(target_os = "macos") {
                    vec!["/Applications/Chromium.app/Contents/MacOS/Chromium"]
                } else if cfg!(target_os = "linux") {
                    vec!["chromium", "chromium-browser", "/usr/bin/chromium", "/snap/bin/chromium"]
                } else {
                    vec![r"C:\Program Files\Chromium\Application\chrome.exe"]
                }
            }
        }
    }
}

/// Find a browser binary on the system for the given engine.
pub fn find_browser_binary(engine: BrowserEngine) -> Option<PathBuf> {
    for candidate in engine.candidates() {
        let path = Path::new(candidate);
        if path.exists() {
            return Some(path.to_path_buf());
        }
        if !candidate.contains('/') && !candidate.contains('\\') {
            if let Ok(found) = which::which(candidate) {
                return Some(found);
            }
        }
    }
    None
}

pub fn list_available_browsers() -> Vec<(BrowserEngine, PathBuf)> {
    [BrowserEngine::Chrome, BrowserEngine::Chromium, BrowserEngine::Edge]
        .into_iter()
        .filter_map(|engine| find_browser_binary(engine).map(|p| (engine, p)))
        .collect()
}

/// First installed browser, in preference order.
pub fn detect_browser() -> Option<(BrowserEngine, PathBuf)> {
    list_available_browsers().into_iter().next()
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

async fn find_free_port() -> Result<u16, String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("Failed to bind to find free port: {}", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local addr: {}", e))?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll `/json/version` until the debugging endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> Result<(), String> {
    let start = std::time::Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);
    loop {
        if start.elapsed() > timeout {
            return Err(format!(
                "CDP not ready after {}ms on port {}",
                timeout.as_millis(),
                port
            ));
        }
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if body.get("webSocketDebuggerUrl").is_some() {
                    return Ok(());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// WebSocket URL of the first page target listed by `/json/list`.
async fn get_page_ws_url(port: u16) -> Result<String, String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);
    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        if let Some(ws_url) = page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }
    Err("No page target found after retries".to_string())
}

fn page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub engine: Option<BrowserEngine>,
    /// Explicit binary, bypassing detection.
    pub binary: Option<PathBuf>,
    pub headless: bool,
    /// Parent of the per-task profile directories.
    pub profile_root: PathBuf,
    pub launch_timeout: Duration,
}

impl DriverConfig {
    pub fn from_automation(cfg: &AutomationConfig, profile_root: PathBuf) -> Self {
        Self {
            engine: cfg.browser.as_deref().and_then(BrowserEngine::from_str),
            binary: cfg.browser_path.as_ref().map(PathBuf::from),
            headless: cfg.headless,
            profile_root,
            launch_timeout: Duration::from_secs(15),
        }
    }
}

/// Launches one isolated browser process per task.
pub struct ChromeDriver {
    config: DriverConfig,
}

impl ChromeDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    fn resolve_binary(&self) -> Result<(BrowserEngine, PathBuf), String> {
        if let Some(binary) = &self.config.binary {
            return Ok((self.config.engine.unwrap_or(BrowserEngine::Chrome), binary.clone()));
        }
        match self.config.engine {
            Some(engine) => find_browser_binary(engine)
                .map(|p| (engine, p))
                .ok_or_else(|| format!("{} not found. Please install it.", engine.name())),
            None => detect_browser()
                .ok_or_else(|| "No Chrome, Chromium or Edge installation found".to_string()),
        }
    }

    async fn launch(&self, task_id: &str) -> Result<CdpSession, String> {
        let (engine, binary) = self.resolve_binary()?;
        let user_data_dir = self.config.profile_root.join(task_id);
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| format!("Failed to create user data dir: {}", e))?;

        let debug_port = find_free_port().await?;
        let args = build_browser_args(debug_port, &user_data_dir, self.config.headless);

        info!(
            task_id,
            port = debug_port,
            headless = self.config.headless,
            browser = engine.name(),
            "Launching browser for task"
        );

        let mut child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to launch {}: {}", engine.name(), e))?;

        let connected = async {
            wait_for_cdp_ready(debug_port, self.config.launch_timeout).await?;
            let page_ws_url = get_page_ws_url(debug_port).await?;
            let cdp = CdpClient::connect(&page_ws_url).await.map_err(|e| e.to_string())?;
            for domain in ["Page", "Runtime", "DOM"] {
                cdp.enable_domain(domain).await.map_err(|e| e.to_string())?;
            }
            debug!(task_id, ws_url = %page_ws_url, "CDP connection established (page target)");
            Ok::<_, String>(cdp)
        }
        .await;

        match connected {
            Ok(cdp) => Ok(CdpSession::new(task_id, child, cdp, user_data_dir)),
            Err(e) => {
                let _ = child.kill().await;
                let _ = std::fs::remove_dir_all(&user_data_dir);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn open(&self, task_id: &str) -> Result<Box<dyn BrowserSession>, ExecutionError> {
        let session = self.launch(task_id).await.map_err(ExecutionError::SessionLost)?;
        Ok(Box::new(session))
    }

    fn name(&self) -> &str {
        "cdp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_names() {
        assert_eq!(BrowserEngine::from_str("MSEdge"), Some(BrowserEngine::Edge));
        assert_eq!(BrowserEngine::from_str("chromium"), Some(BrowserEngine::Chromium));
        assert_eq!(BrowserEngine::from_str("firefox"), None);
        assert_eq!(BrowserEngine::Chrome.name(), "chrome");
    }

    #[test]
    fn test_browser_args() {
        let args = build_browser_args(9333, Path::new("/tmp/profile"), true);
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));

        let headed = build_browser_args(9333, Path::new("/tmp/profile"), false);
        assert!(!headed.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn test_page_target_selection() {
        let targets = vec![
            json!({"type": "service_worker", "webSocketDebuggerUrl": "ws://sw"}),
            json!({"type": "page", "webSocketDebuggerUrl": "ws://page"}),
        ];
        assert_eq!(page_ws_url(&targets).as_deref(), Some("ws://page"));
        assert_eq!(page_ws_url(&[]), None);
    }

    #[tokio::test]
    async fn test_free_port() {
        let port = find_free_port().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_session_lost() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ChromeDriver::new(DriverConfig {
            engine: None,
            binary: Some(dir.path().join("no-such-browser")),
            headless: true,
            profile_root: dir.path().to_path_buf(),
            launch_timeout: Duration::from_millis(200),
        });
        let err = match driver.open("t1").await {
            Err(e) => e,
            Ok(_) => panic!("launch should fail"),
        };
        assert!(matches!(err, ExecutionError::SessionLost(_)));
    }
}
