//! Browser session: owns one headless browser per run and exposes the
//! atomic actions, DOM snapshots, screenshot/video capture, and the
//! accumulated console/network logs.
//!
//! The WebDriver wiring lives behind the `PageDriver` seam so the decision
//! engine, replay path, and tests all drive the same session surface.

pub mod driver;
pub mod testing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use driver::WebDriverPage;

/// Upper bound for every individual close/finalise step. `close` must
/// never hang; a stuck browser loses at most this much per step.
pub const CLOSE_STEP_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound for wait-for-network-idle.
pub const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("failed to start browser session: {0}")]
    Session(String),

    #[error("navigation to `{url}` failed: {message}")]
    Navigation { url: String, message: String },

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("element not visible: {0}")]
    ElementNotVisible(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("screenshot failed: {0}")]
    Screenshot(String),

    #[error("session is closed")]
    Closed,

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: String,
    pub text: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFailure {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub error: String,
    pub ts: DateTime<Utc>,
}

/// Console and network entries drained from the in-page capture shim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureBuffer {
    #[serde(default)]
    pub console: Vec<ConsoleEntry>,
    #[serde(default)]
    pub network: Vec<NetworkFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomHeading {
    pub level: u8,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomElement {
    pub tag: String,
    pub selector: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub element_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomFormField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomForm {
    pub selector: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub fields: Vec<DomFormField>,
}

/// Structured snapshot of the current page, capped to stay prompt-sized:
/// at most 50 interactive elements, 10 forms, 10 error messages, and a
/// 3000-character body preview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSnapshot {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub meta_description: Option<String>,
    #[serde(default)]
    pub headings: Vec<DomHeading>,
    #[serde(default)]
    pub interactive_elements: Vec<DomElement>,
    #[serde(default)]
    pub forms: Vec<DomForm>,
    #[serde(default)]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub body_text_preview: String,
    #[serde(default)]
    pub total_elements: u64,
}

/// Driver seam: one implementation speaks WebDriver, tests script their
/// own. Every method is one atomic page interaction.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;
    async fn submit(&self, selector: &str) -> Result<(), BrowserError>;
    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError>;
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), BrowserError>;
    async fn snapshot(&self) -> Result<DomSnapshot, BrowserError>;
    async fn drain_capture(&self) -> Result<CaptureBuffer, BrowserError>;
    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError>;
    async fn screenshot_element_png(&self, selector: &str) -> Result<Vec<u8>, BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VideoFrame {
    file: String,
    ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VideoManifest {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    frame_count: usize,
    frames: Vec<VideoFrame>,
}

/// One single-page browser session, alive for the duration of one run.
pub struct BrowserSession {
    run_id: String,
    driver: Arc<dyn PageDriver>,
    screenshot_dir: PathBuf,
    video_dir: PathBuf,
    shot_index: AtomicU32,
    frame_index: AtomicU32,
    console: Mutex<Vec<ConsoleEntry>>,
    network: Mutex<Vec<NetworkFailure>>,
    frames: Mutex<Vec<VideoFrame>>,
    started_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl BrowserSession {
    /// Connect to the WebDriver endpoint and start a fresh session.
    pub async fn launch(
        run_id: &str,
        webdriver_url: &str,
        data_dir: &std::path::Path,
    ) -> Result<Arc<Self>, BrowserError> {
        let driver = WebDriverPage::connect(webdriver_url).await?;
        Ok(Self::with_driver(run_id, Arc::new(driver), data_dir))
    }

    /// Wrap an existing driver (tests, replays against fakes).
    pub fn with_driver(
        run_id: &str,
        driver: Arc<dyn PageDriver>,
        data_dir: &std::path::Path,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            run_id: run_id.to_string(),
            driver,
            screenshot_dir: data_dir.join("screenshots"),
            video_dir: data_dir.join("videos"),
            shot_index: AtomicU32::new(0),
            frame_index: AtomicU32::new(0),
            console: Mutex::new(Vec::new()),
            network: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            closed: AtomicBool::new(false),
        });
        info!(run = run_id, "browser session started");
        session
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.is_closed() {
            return Err(BrowserError::Closed);
        }
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.driver.goto(url).await?;
        self.record_frame().await;
        self.sync_capture().await;
        Ok(())
    }

    pub async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.driver.click(selector).await?;
        self.record_frame().await;
        self.sync_capture().await;
        Ok(())
    }

    pub async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.driver.fill(selector, value).await?;
        self.sync_capture().await;
        Ok(())
    }

    pub async fn submit(&self, selector: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.driver.submit(selector).await?;
        self.record_frame().await;
        self.sync_capture().await;
        Ok(())
    }

    pub async fn check_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        self.ensure_open()?;
        self.driver.is_visible(selector).await
    }

    pub async fn wait_for_network_idle(&self) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.driver.wait_for_network_idle(NETWORK_IDLE_TIMEOUT).await?;
        self.sync_capture().await;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, BrowserError> {
        self.ensure_open()?;
        self.driver.current_url().await
    }

    /// Capture a screenshot into the evidence directory. Filenames are
    /// monotonic per run.
    pub async fn take_screenshot(
        &self,
        _full_page: bool,
        selector: Option<&str>,
    ) -> Result<PathBuf, BrowserError> {
        self.ensure_open()?;
        let png = match selector {
            Some(selector) => self.driver.screenshot_element_png(selector).await?,
            None => self.driver.screenshot_png().await?,
        };

        let index = self.shot_index.fetch_add(1, Ordering::SeqCst);
        let path = self
            .screenshot_dir
            .join(format!("{}_{index:04}.png", self.run_id));
        tokio::fs::write(&path, &png)
            .await
            .map_err(|e| BrowserError::Screenshot(e.to_string()))?;
        debug!(path = %path.display(), "screenshot captured");
        Ok(path)
    }

    pub async fn extract_dom(&self) -> Result<DomSnapshot, BrowserError> {
        self.ensure_open()?;
        let mut snapshot = self.driver.snapshot().await?;
        clamp_snapshot(&mut snapshot);
        Ok(snapshot)
    }

    /// Pull buffered console/network entries from the page into the
    /// session accumulators.
    async fn sync_capture(&self) {
        match self.driver.drain_capture().await {
            Ok(buffer) => {
                if !buffer.console.is_empty() {
                    self.console.lock().extend(buffer.console);
                }
                if !buffer.network.is_empty() {
                    self.network.lock().extend(buffer.network);
                }
            }
            Err(err) => debug!(error = %err, "capture drain failed; page may be mid-navigation"),
        }
    }

    pub fn console_logs(&self, clear: bool) -> Vec<ConsoleEntry> {
        let mut logs = self.console.lock();
        if clear {
            std::mem::take(&mut *logs)
        } else {
            logs.clone()
        }
    }

    pub fn network_errors(&self, clear: bool) -> Vec<NetworkFailure> {
        let mut errors = self.network.lock();
        if clear {
            std::mem::take(&mut *errors)
        } else {
            errors.clone()
        }
    }

    /// Record one video frame (screenshot under `videos/<run_id>/`).
    /// Frame capture is best-effort and never fails the triggering action.
    async fn record_frame(&self) {
        let png = match self.driver.screenshot_png().await {
            Ok(png) => png,
            Err(err) => {
                debug!(error = %err, "video frame skipped");
                return;
            }
        };
        let index = self.frame_index.fetch_add(1, Ordering::SeqCst);
        let frame_dir = self.video_dir.join(&self.run_id);
        if tokio::fs::create_dir_all(&frame_dir).await.is_err() {
            return;
        }
        let file = format!("{}/frame_{index:05}.png", self.run_id);
        let path = self.video_dir.join(&file);
        if tokio::fs::write(&path, &png).await.is_ok() {
            self.frames.lock().push(VideoFrame {
                file,
                ts: Utc::now(),
            });
        }
    }

    /// Close the session and finalise the video manifest. Every step is
    /// bounded by `CLOSE_STEP_TIMEOUT`; close never hangs and always
    /// yields the video path.
    pub async fn close(&self) -> Result<PathBuf, BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(self.video_path());
        }

        // final frame, best effort
        if let Ok(Ok(png)) =
            tokio::time::timeout(CLOSE_STEP_TIMEOUT, self.driver.screenshot_png()).await
        {
            let index = self.frame_index.fetch_add(1, Ordering::SeqCst);
            let frame_dir = self.video_dir.join(&self.run_id);
            let _ = tokio::fs::create_dir_all(&frame_dir).await;
            let file = format!("{}/frame_{index:05}.png", self.run_id);
            if tokio::fs::write(self.video_dir.join(&file), &png).await.is_ok() {
                self.frames.lock().push(VideoFrame {
                    file,
                    ts: Utc::now(),
                });
            }
        }

        match tokio::time::timeout(CLOSE_STEP_TIMEOUT, self.driver.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "browser close reported an error"),
            Err(_) => warn!(run = %self.run_id, "browser close timed out; abandoning driver"),
        }

        let manifest = VideoManifest {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            frame_count: self.frames.lock().len(),
            frames: self.frames.lock().clone(),
        };
        let path = self.video_path();
        let payload = serde_json::to_string_pretty(&manifest)
            .map_err(|e| BrowserError::Session(e.to_string()))?;
        match tokio::time::timeout(CLOSE_STEP_TIMEOUT, tokio::fs::write(&path, payload)).await {
            Ok(Ok(())) => info!(run = %self.run_id, video = %path.display(), "session finalised"),
            Ok(Err(err)) => warn!(error = %err, "video manifest write failed"),
            Err(_) => warn!("video manifest write timed out"),
        }
        Ok(path)
    }

    pub fn video_path(&self) -> PathBuf {
        self.video_dir.join(format!("{}.json", self.run_id))
    }
}

fn clamp_snapshot(snapshot: &mut DomSnapshot) {
    snapshot.interactive_elements.truncate(50);
    snapshot.forms.truncate(10);
    snapshot.error_messages.truncate(10);
    if snapshot.body_text_preview.len() > 3000 {
        let mut cut = 3000;
        while !snapshot.body_text_preview.is_char_boundary(cut) {
            cut -= 1;
        }
        snapshot.body_text_preview.truncate(cut);
    }
}

/// Session creation seam. The production factory speaks to a WebDriver
/// endpoint; tests hand out scripted sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, run_id: &str) -> Result<Arc<BrowserSession>, BrowserError>;
}

pub struct WebDriverSessionFactory {
    webdriver_url: String,
    data_dir: PathBuf,
}

impl WebDriverSessionFactory {
    pub fn new(webdriver_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            webdriver_url: webdriver_url.into(),
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for WebDriverSessionFactory {
    async fn create(&self, run_id: &str) -> Result<Arc<BrowserSession>, BrowserError> {
        BrowserSession::launch(run_id, &self.webdriver_url, &self.data_dir).await
    }
}

/// Per-process map of `run_id -> session`, so replays and the HTTP layer
/// can reuse a live session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<BrowserSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<BrowserSession>) {
        self.sessions
            .write()
            .insert(session.run_id().to_string(), session);
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<BrowserSession>> {
        self.sessions.read().get(run_id).cloned()
    }

    pub fn remove(&self, run_id: &str) -> Option<Arc<BrowserSession>> {
        self.sessions.write().remove(run_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedPage;
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("screenshots")).unwrap();
        std::fs::create_dir_all(dir.join("videos")).unwrap();
        dir
    }

    #[tokio::test]
    async fn screenshots_get_monotonic_names() {
        let dir = temp_dir();
        let page = Arc::new(ScriptedPage::new());
        let session = BrowserSession::with_driver("run-a", page, &dir);

        let first = session.take_screenshot(false, None).await.unwrap();
        let second = session.take_screenshot(false, None).await.unwrap();
        assert!(first.to_string_lossy().contains("run-a_0000"));
        assert!(second.to_string_lossy().contains("run-a_0001"));
        assert!(first.exists() && second.exists());
    }

    #[tokio::test]
    async fn close_yields_video_manifest_and_is_idempotent() {
        let dir = temp_dir();
        let page = Arc::new(ScriptedPage::new());
        let session = BrowserSession::with_driver("run-b", page, &dir);

        session.navigate("https://example.com").await.unwrap();
        let video = session.close().await.unwrap();
        assert!(video.exists());
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&video).unwrap()).unwrap();
        assert!(manifest["frame_count"].as_u64().unwrap() >= 1);

        // second close is a no-op returning the same path
        assert_eq!(session.close().await.unwrap(), video);
        assert!(session.navigate("https://example.com").await.is_err());
    }

    #[tokio::test]
    async fn console_and_network_accumulate_and_clear() {
        let dir = temp_dir();
        let page = Arc::new(ScriptedPage::new());
        page.push_console("error", "Uncaught TypeError: x is undefined");
        page.push_network_failure("https://example.com/api", Some(500), "server error");
        let session = BrowserSession::with_driver("run-c", page, &dir);

        session.navigate("https://example.com").await.unwrap();
        assert_eq!(session.console_logs(false).len(), 1);
        assert_eq!(session.network_errors(true).len(), 1);
        assert!(session.network_errors(false).is_empty());
        assert_eq!(session.console_logs(false).len(), 1);
    }

    #[tokio::test]
    async fn snapshot_caps_are_enforced() {
        let dir = temp_dir();
        let page = Arc::new(ScriptedPage::new());
        let mut dom = DomSnapshot::default();
        for i in 0..80 {
            dom.interactive_elements.push(DomElement {
                tag: "button".into(),
                selector: format!("#b{i}"),
                text: "go".into(),
                element_type: "button".into(),
            });
        }
        dom.body_text_preview = "x".repeat(5000);
        page.set_snapshot(dom);

        let session = BrowserSession::with_driver("run-d", page, &dir);
        let snapshot = session.extract_dom().await.unwrap();
        assert_eq!(snapshot.interactive_elements.len(), 50);
        assert_eq!(snapshot.body_text_preview.len(), 3000);
    }
}
