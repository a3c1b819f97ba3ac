//! WebDriver-backed `PageDriver` implementation (fantoccini).
//!
//! Console and network capture: WebDriver has no portable log API, so a
//! small shim is installed after every navigation. It patches `console.*`,
//! `window.onerror`, `fetch`, and `XMLHttpRequest` to buffer entries (and
//! every HTTP response with status >= 400) in `window.__noema_capture`,
//! which `drain_capture` empties through `execute`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    BrowserError, CaptureBuffer, ConsoleEntry, DomSnapshot, NetworkFailure, PageDriver,
};

const NETWORK_IDLE_POLL: Duration = Duration::from_millis(250);

pub struct WebDriverPage {
    client: Mutex<Option<Client>>,
}

impl WebDriverPage {
    /// Connect to a WebDriver endpoint with headless Chrome capabilities.
    pub async fn connect(webdriver_url: &str) -> Result<Self, BrowserError> {
        let mut builder = ClientBuilder::rustls()
            .map_err(|e| BrowserError::Session(format!("rustls connector: {e}")))?;

        let caps = json!({
            "browserName": "chrome",
            "goog:chromeOptions": {
                "args": [
                    "--no-sandbox",
                    "--disable-dev-shm-usage",
                    "--disable-gpu",
                    "--headless=new",
                    "--window-size=1280,900",
                ]
            }
        });
        builder.capabilities(caps.as_object().cloned().unwrap_or_default());

        let client = builder
            .connect(webdriver_url.trim_end_matches('/'))
            .await
            .map_err(|e| {
                BrowserError::Session(format!("connect to WebDriver at {webdriver_url}: {e}"))
            })?;

        Ok(Self {
            client: Mutex::new(Some(client)),
        })
    }

    async fn client(&self) -> Result<Client, BrowserError> {
        self.client
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or(BrowserError::Closed)
    }

    async fn find(&self, selector: &str) -> Result<fantoccini::elements::Element, BrowserError> {
        let client = self.client().await?;
        client
            .wait()
            .at_most(Duration::from_secs(5))
            .for_element(Locator::Css(selector))
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))
    }
}

#[async_trait]
impl PageDriver for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        let client = self.client().await?;
        client.goto(url).await.map_err(|e| BrowserError::Navigation {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        // the shim does not survive navigation, reinstall every time
        client
            .execute(CAPTURE_SHIM, vec![])
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        debug!(url, "navigated");
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let client = self.client().await?;
        client
            .current_url()
            .await
            .map(|u| u.as_str().to_string())
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.find(selector)
            .await?
            .click()
            .await
            .map_err(|e| BrowserError::Script(format!("click {selector}: {e}")))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let element = self.find(selector).await?;
        let _ = element.clear().await;
        element
            .send_keys(value)
            .await
            .map_err(|e| BrowserError::Script(format!("fill {selector}: {e}")))
    }

    async fn submit(&self, selector: &str) -> Result<(), BrowserError> {
        let client = self.client().await?;
        let submitted = client
            .execute(SUBMIT_SCRIPT, vec![json!(selector)])
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        if submitted.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound(selector.to_string()))
        }
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        let client = self.client().await?;
        match client.find(Locator::Css(selector)).await {
            Ok(element) => element
                .is_displayed()
                .await
                .map_err(|e| BrowserError::Script(e.to_string())),
            Err(_) => Ok(false),
        }
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), BrowserError> {
        let client = self.client().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = client
                .execute(IDLE_PROBE, vec![])
                .await
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            let ready = state["ready"].as_bool().unwrap_or(false);
            let inflight = state["inflight"].as_u64().unwrap_or(0);
            if ready && inflight == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::Timeout("network idle".to_string()));
            }
            tokio::time::sleep(NETWORK_IDLE_POLL).await;
        }
    }

    async fn snapshot(&self) -> Result<DomSnapshot, BrowserError> {
        let client = self.client().await?;
        let value = client
            .execute(SNAPSHOT_SCRIPT, vec![])
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| BrowserError::Script(format!("snapshot: {e}")))
    }

    async fn drain_capture(&self) -> Result<CaptureBuffer, BrowserError> {
        let client = self.client().await?;
        let value = client
            .execute(DRAIN_SCRIPT, vec![])
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;

        let now = Utc::now();
        let mut buffer = CaptureBuffer::default();
        if let Some(entries) = value["console"].as_array() {
            for entry in entries {
                buffer.console.push(ConsoleEntry {
                    level: entry["level"].as_str().unwrap_or("log").to_string(),
                    text: entry["text"].as_str().unwrap_or_default().to_string(),
                    ts: now,
                });
            }
        }
        if let Some(entries) = value["network"].as_array() {
            for entry in entries {
                buffer.network.push(NetworkFailure {
                    url: entry["url"].as_str().unwrap_or_default().to_string(),
                    status: entry["status"].as_u64().map(|s| s as u16),
                    error: entry["error"].as_str().unwrap_or("http error").to_string(),
                    ts: now,
                });
            }
        }
        Ok(buffer)
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError> {
        let client = self.client().await?;
        client
            .screenshot()
            .await
            .map_err(|e| BrowserError::Screenshot(e.to_string()))
    }

    async fn screenshot_element_png(&self, selector: &str) -> Result<Vec<u8>, BrowserError> {
        let element = self.find(selector).await?;
        element
            .screenshot()
            .await
            .map_err(|e| BrowserError::Screenshot(e.to_string()))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if let Some(client) = self.client.lock().await.take() {
            client
                .close()
                .await
                .map_err(|e| BrowserError::Session(e.to_string()))?;
        }
        Ok(())
    }
}

const CAPTURE_SHIM: &str = r#"
(function() {
  if (window.__noema_capture) return;
  const cap = { console: [], network: [], inflight: 0 };
  window.__noema_capture = cap;

  for (const level of ['log', 'info', 'warn', 'error']) {
    const original = console[level].bind(console);
    console[level] = function(...args) {
      try {
        cap.console.push({ level, text: args.map(a => String(a)).join(' ').slice(0, 500) });
        if (cap.console.length > 200) cap.console.shift();
      } catch (e) {}
      original(...args);
    };
  }

  window.addEventListener('error', (ev) => {
    cap.console.push({ level: 'error', text: String(ev.message).slice(0, 500) });
  });

  const originalFetch = window.fetch ? window.fetch.bind(window) : null;
  if (originalFetch) {
    window.fetch = function(...args) {
      cap.inflight += 1;
      const url = typeof args[0] === 'string' ? args[0] : (args[0] && args[0].url) || '';
      return originalFetch(...args).then((res) => {
        cap.inflight -= 1;
        if (res.status >= 400) {
          cap.network.push({ url, status: res.status, error: 'HTTP ' + res.status });
        }
        return res;
      }).catch((err) => {
        cap.inflight -= 1;
        cap.network.push({ url, status: null, error: String(err).slice(0, 300) });
        throw err;
      });
    };
  }

  const originalOpen = XMLHttpRequest.prototype.open;
  const originalSend = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.open = function(method, url, ...rest) {
    this.__noema_url = url;
    return originalOpen.call(this, method, url, ...rest);
  };
  XMLHttpRequest.prototype.send = function(...args) {
    cap.inflight += 1;
    this.addEventListener('loadend', () => {
      cap.inflight -= 1;
      if (this.status >= 400 || this.status === 0) {
        cap.network.push({
          url: this.__noema_url || '',
          status: this.status || null,
          error: this.status ? 'HTTP ' + this.status : 'request failed',
        });
      }
    });
    return originalSend.apply(this, args);
  };
})();
"#;

const DRAIN_SCRIPT: &str = r#"
(function() {
  const cap = window.__noema_capture;
  if (!cap) return { console: [], network: [] };
  const out = { console: cap.console.splice(0), network: cap.network.splice(0) };
  return out;
})();
"#;

const IDLE_PROBE: &str = r#"
(function() {
  const cap = window.__noema_capture || { inflight: 0 };
  return { ready: document.readyState === 'complete', inflight: cap.inflight };
})();
"#;

const SUBMIT_SCRIPT: &str = r#"
(function(selector) {
  const el = document.querySelector(selector);
  if (!el) return false;
  const form = el.tagName === 'FORM' ? el : el.closest('form');
  if (!form) return false;
  if (typeof form.requestSubmit === 'function') { form.requestSubmit(); } else { form.submit(); }
  return true;
})(arguments[0]);
"#;

const SNAPSHOT_SCRIPT: &str = r#"
(function() {
  function cssPath(el) {
    if (el.id) return '#' + el.id;
    const name = el.getAttribute('name');
    if (name) return el.tagName.toLowerCase() + '[name="' + name + '"]';
    const dataTest = el.getAttribute('data-test') || el.getAttribute('data-testid');
    if (dataTest) return '[data-test="' + dataTest + '"]';
    let path = el.tagName.toLowerCase();
    if (el.className && typeof el.className === 'string') {
      const cls = el.className.trim().split(/\s+/)[0];
      if (cls) path += '.' + cls;
    }
    return path;
  }

  const headings = [];
  for (let level = 1; level <= 6; level++) {
    for (const h of document.querySelectorAll('h' + level)) {
      const text = (h.textContent || '').trim();
      if (text) headings.push({ level, text: text.slice(0, 120) });
    }
  }

  const interactive = [];
  for (const el of document.querySelectorAll('a, button, input, select, textarea, [role="button"]')) {
    if (interactive.length >= 50) break;
    interactive.push({
      tag: el.tagName.toLowerCase(),
      selector: cssPath(el),
      text: ((el.textContent || el.value || el.getAttribute('placeholder') || '').trim()).slice(0, 80),
      elementType: el.getAttribute('type') || el.tagName.toLowerCase(),
    });
  }

  const forms = [];
  for (const form of document.querySelectorAll('form')) {
    if (forms.length >= 10) break;
    const fields = [];
    for (const input of form.querySelectorAll('input, select, textarea')) {
      const type = (input.getAttribute('type') || input.tagName.toLowerCase()).toLowerCase();
      if (type === 'hidden' || type === 'submit') continue;
      let label = '';
      if (input.id) {
        const labelEl = document.querySelector('label[for="' + input.id + '"]');
        if (labelEl) label = (labelEl.textContent || '').trim().slice(0, 60);
      }
      fields.push({ name: input.getAttribute('name') || '', fieldType: type, label });
    }
    forms.push({ selector: cssPath(form), method: (form.method || 'get').toUpperCase(), fields });
  }

  const errorMessages = [];
  const errorSelectors = '[class*="error" i], [data-test*="error" i], [role="alert"], .invalid-feedback, .alert-danger';
  for (const el of document.querySelectorAll(errorSelectors)) {
    if (errorMessages.length >= 10) break;
    const text = (el.textContent || '').trim();
    if (text && !errorMessages.includes(text.slice(0, 200))) errorMessages.push(text.slice(0, 200));
  }

  const metaEl = document.querySelector('meta[name="description"]');
  return {
    title: document.title || '',
    url: window.location.href,
    metaDescription: metaEl ? metaEl.getAttribute('content') : null,
    headings,
    interactiveElements: interactive,
    forms,
    errorMessages,
    bodyTextPreview: (document.body ? document.body.innerText : '').replace(/\s+/g, ' ').slice(0, 3000),
    totalElements: document.getElementsByTagName('*').length,
  };
})();
"#;
