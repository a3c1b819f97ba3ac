//! Scripted `PageDriver` for tests.
//!
//! Deterministic stand-in for a real browser: queued DOM snapshots,
//! scripted failures per selector or URL, and a journal of performed
//! actions that assertions can read back.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use std::path::PathBuf;
use std::sync::Arc;

use super::{
    BrowserError, BrowserSession, CaptureBuffer, ConsoleEntry, DomSnapshot, NetworkFailure,
    PageDriver, SessionFactory,
};

/// Smallest valid-enough PNG payload for screenshot plumbing.
const FAKE_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Default)]
pub struct ScriptedPage {
    current_url: Mutex<String>,
    snapshots: Mutex<VecDeque<DomSnapshot>>,
    last_snapshot: Mutex<DomSnapshot>,
    pending_capture: Mutex<CaptureBuffer>,
    failing_selectors: Mutex<HashSet<String>>,
    failing_urls: Mutex<HashSet<String>>,
    hidden_selectors: Mutex<HashSet<String>>,
    actions: Mutex<Vec<String>>,
    action_delay: Mutex<Option<Duration>>,
    closed: Mutex<bool>,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed snapshot returned by every `snapshot()` call (unless queued
    /// snapshots are pending).
    pub fn set_snapshot(&self, snapshot: DomSnapshot) {
        *self.last_snapshot.lock() = snapshot;
    }

    /// Queue a snapshot consumed by the next `snapshot()` call.
    pub fn push_snapshot(&self, snapshot: DomSnapshot) {
        self.snapshots.lock().push_back(snapshot);
    }

    pub fn push_console(&self, level: &str, text: &str) {
        self.pending_capture.lock().console.push(ConsoleEntry {
            level: level.to_string(),
            text: text.to_string(),
            ts: Utc::now(),
        });
    }

    pub fn push_network_failure(&self, url: &str, status: Option<u16>, error: &str) {
        self.pending_capture.lock().network.push(NetworkFailure {
            url: url.to_string(),
            status,
            error: error.to_string(),
            ts: Utc::now(),
        });
    }

    /// Interactions against this selector fail with ElementNotFound.
    pub fn fail_selector(&self, selector: &str) {
        self.failing_selectors.lock().insert(selector.to_string());
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().insert(url.to_string());
    }

    pub fn hide_selector(&self, selector: &str) {
        self.hidden_selectors.lock().insert(selector.to_string());
    }

    /// Journal of performed actions, e.g. `click #login-button`.
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    /// Every page interaction sleeps this long first. Lets tests stop a
    /// run while a step is mid-flight.
    pub fn set_action_delay(&self, delay: Duration) {
        *self.action_delay.lock() = Some(delay);
    }

    async fn delay(&self) {
        let delay = *self.action_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn journal(&self, entry: String) {
        self.actions.lock().push(entry);
    }

    fn check_selector(&self, selector: &str) -> Result<(), BrowserError> {
        if self.failing_selectors.lock().contains(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), BrowserError> {
        if *self.closed.lock() {
            return Err(BrowserError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for ScriptedPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.check_open()?;
        self.delay().await;
        if self.failing_urls.lock().contains(url) {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                message: "navigation failed".to_string(),
            });
        }
        *self.current_url.lock() = url.to_string();
        self.journal(format!("goto {url}"));
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.check_open()?;
        Ok(self.current_url.lock().clone())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.check_open()?;
        self.delay().await;
        self.check_selector(selector)?;
        self.journal(format!("click {selector}"));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.check_open()?;
        self.delay().await;
        self.check_selector(selector)?;
        self.journal(format!("fill {selector}={value}"));
        Ok(())
    }

    async fn submit(&self, selector: &str) -> Result<(), BrowserError> {
        self.check_open()?;
        self.delay().await;
        self.check_selector(selector)?;
        self.journal(format!("submit {selector}"));
        Ok(())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        self.check_open()?;
        Ok(!self.hidden_selectors.lock().contains(selector))
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<(), BrowserError> {
        self.check_open()?;
        self.journal("wait_for_network_idle".to_string());
        Ok(())
    }

    async fn snapshot(&self) -> Result<DomSnapshot, BrowserError> {
        self.check_open()?;
        if let Some(queued) = self.snapshots.lock().pop_front() {
            *self.last_snapshot.lock() = queued.clone();
            return Ok(queued);
        }
        let mut snapshot = self.last_snapshot.lock().clone();
        if snapshot.url.is_empty() {
            snapshot.url = self.current_url.lock().clone();
        }
        Ok(snapshot)
    }

    async fn drain_capture(&self) -> Result<CaptureBuffer, BrowserError> {
        self.check_open()?;
        Ok(std::mem::take(&mut *self.pending_capture.lock()))
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError> {
        self.check_open()?;
        Ok(FAKE_PNG.to_vec())
    }

    async fn screenshot_element_png(&self, selector: &str) -> Result<Vec<u8>, BrowserError> {
        self.check_open()?;
        self.check_selector(selector)?;
        Ok(FAKE_PNG.to_vec())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        *self.closed.lock() = true;
        Ok(())
    }
}

/// Factory handing out sessions backed by scripted pages. Pre-seeded pages
/// are consumed in order; once exhausted, fresh default pages are created.
pub struct ScriptedSessionFactory {
    data_dir: PathBuf,
    queued: Mutex<Vec<Arc<ScriptedPage>>>,
    created_runs: Mutex<Vec<String>>,
}

impl ScriptedSessionFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            queued: Mutex::new(Vec::new()),
            created_runs: Mutex::new(Vec::new()),
        }
    }

    /// Queue a page for the next created session.
    pub fn push_page(&self, page: Arc<ScriptedPage>) {
        self.queued.lock().push(page);
    }

    /// Run ids of every session this factory created, in order.
    pub fn created_runs(&self) -> Vec<String> {
        self.created_runs.lock().clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.created_runs.lock().len()
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessionFactory {
    async fn create(&self, run_id: &str) -> Result<Arc<BrowserSession>, BrowserError> {
        let page = {
            let mut queued = self.queued.lock();
            if queued.is_empty() {
                Arc::new(ScriptedPage::new())
            } else {
                queued.remove(0)
            }
        };
        self.created_runs.lock().push(run_id.to_string());
        Ok(BrowserSession::with_driver(run_id, page, &self.data_dir))
    }
}
