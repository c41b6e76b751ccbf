//! Headless browser seam and its Chrome implementation via chromiumoxide.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use site2docs_shared::{FallbackReason, RenderConfig, Result, Site2DocsError};

/// Interval between DOM-stability checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Attribute stamped on elements already activated during expansion.
const EXPANDED_MARKER: &str = "data-site2docs-expanded";

/// Request patterns blocked on the relaxed attempt. `file:`, `data:` and `about:` stay allowed.
const EXTERNAL_URL_PATTERNS: &[&str] = &["http://*", "https://*", "ws://*", "wss://*"];

// ---------------------------------------------------------------------------
// Attempt options & errors
// ---------------------------------------------------------------------------

/// Load condition a navigation waits for before the quiescence window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Full load with resource activity settled.
    NetworkIdle,
    /// DOM parsed; subresources may still be loading.
    DomContentLoaded,
}

/// Per-attempt render settings.
#[derive(Debug, Clone)]
pub struct AttemptOptions {
    /// 1 for the first attempt, 2 for the relaxed retry.
    pub attempt: u32,
    pub wait: WaitCondition,
    /// The DOM must stay unchanged this long to count as settled.
    pub quiescence: Duration,
    /// Upper bound on navigation plus settling.
    pub timeout: Duration,
    /// Block every request that is not `file:`, `data:` or `about:`.
    pub block_external: bool,
    pub expand_texts: Vec<String>,
    pub auto_expand_candidates: bool,
    pub max_scroll_iterations: u32,
    pub scroll_pause: Duration,
    pub max_expand_clicks: u32,
}

impl AttemptOptions {
    /// Settings for the first attempt.
    pub fn initial(config: &RenderConfig) -> Self {
        Self {
            attempt: 1,
            wait: WaitCondition::NetworkIdle,
            quiescence: Duration::from_millis(config.quiescence_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            block_external: false,
            expand_texts: config.expand_texts.clone(),
            auto_expand_candidates: config.auto_expand_candidates,
            max_scroll_iterations: config.max_scroll_iterations,
            scroll_pause: Duration::from_millis(config.scroll_pause_ms),
            max_expand_clicks: config.max_expand_clicks,
        }
    }

    /// Settings for the single relaxed retry.
    pub fn relaxed(config: &RenderConfig) -> Self {
        let timeout_ms = (config.timeout_ms as f64 * config.timeout_backoff_factor).round() as u64;
        Self {
            attempt: 2,
            wait: WaitCondition::DomContentLoaded,
            quiescence: Duration::from_millis(config.relaxed_quiescence_ms),
            timeout: Duration::from_millis(timeout_ms),
            block_external: true,
            ..Self::initial(config)
        }
    }
}

/// Why a single render attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrowserError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser session error: {0}")]
    Session(String),
}

impl BrowserError {
    /// Only timeouts and navigation failures earn the relaxed retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Navigation(_))
    }

    pub fn fallback_reason(&self) -> FallbackReason {
        match self {
            Self::Timeout(_) => FallbackReason::RenderTimeout,
            Self::Navigation(_) => FallbackReason::NavigationFailed,
            Self::Session(_) => FallbackReason::BrowserError,
        }
    }
}

/// Settled DOM of a rendered snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMarkup {
    pub html: String,
    /// Where the browser ended up (may differ from the file URL after redirects).
    pub final_url: Option<String>,
}

/// Anything able to turn a snapshot file into settled markup.
#[async_trait]
pub trait SnapshotBrowser: Send + Sync {
    async fn render(
        &self,
        snapshot: &Path,
        options: &AttemptOptions,
    ) -> std::result::Result<RenderedMarkup, BrowserError>;
}

// ---------------------------------------------------------------------------
// ChromiumBrowser
// ---------------------------------------------------------------------------

/// A shared headless Chrome instance; each render opens and closes its own tab.
pub struct ChromiumBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl ChromiumBrowser {
    /// Launch headless Chrome.
    pub async fn launch(config: &RenderConfig) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--allow-file-access-from-files")
            .arg("--headless=new");
        if let Some(executable) = &config.chrome_executable {
            builder = builder.chrome_executable(executable);
        }
        let browser_config = builder
            .build()
            .map_err(|e| Site2DocsError::Browser(format!("browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config).await.map_err(|e| {
            Site2DocsError::Browser(format!(
                "failed to launch Chrome (is Chrome/Chromium installed?): {e}"
            ))
        })?;

        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });
        info!("headless browser launched");

        Ok(Self { browser, handler })
    }

    /// Shut the browser down and stop its event loop.
    pub async fn close(mut self) -> Result<()> {
        self.browser
            .close()
            .await
            .map_err(|e| Site2DocsError::Browser(format!("failed to close browser: {e}")))?;
        let _ = self.browser.wait().await;
        self.handler.abort();
        Ok(())
    }
}

#[async_trait]
impl SnapshotBrowser for ChromiumBrowser {
    async fn render(
        &self,
        snapshot: &Path,
        options: &AttemptOptions,
    ) -> std::result::Result<RenderedMarkup, BrowserError> {
        let url = snapshot_url(snapshot)?;
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?;

        let result = drive_page(&page, url.as_str(), options).await;

        if let Err(e) = page.close().await {
            debug!(error = %e, "failed to close tab");
        }
        result
    }
}

/// `file://` URL for a snapshot on disk.
fn snapshot_url(snapshot: &Path) -> std::result::Result<Url, BrowserError> {
    let absolute = std::fs::canonicalize(snapshot)
        .map_err(|e| BrowserError::Navigation(format!("{}: {e}", snapshot.display())))?;
    Url::from_file_path(&absolute).map_err(|()| {
        BrowserError::Navigation(format!("not a file path: {}", absolute.display()))
    })
}

async fn drive_page(
    page: &Page,
    url: &str,
    options: &AttemptOptions,
) -> std::result::Result<RenderedMarkup, BrowserError> {
    if options.block_external {
        page.execute(EnableParams::default())
            .await
            .map_err(session_error)?;
        let patterns = EXTERNAL_URL_PATTERNS.iter().map(|p| p.to_string()).collect();
        page.execute(SetBlockedUrLsParams::new(patterns))
            .await
            .map_err(session_error)?;
    }

    let load = async {
        navigate(page, url, options.wait).await?;
        wait_for_quiescence(page, options.quiescence, options.wait).await
    };
    let deadline = tokio::time::Instant::now() + options.timeout;
    tokio::time::timeout_at(deadline, load)
        .await
        .map_err(|_| {
            BrowserError::Timeout(format!("page did not settle within {:?}", options.timeout))
        })??;

    // Scrolling and expansion share what is left of the attempt budget; the
    // page already settled, so running out keeps the DOM as it stands.
    let reveal = async {
        scroll_to_bottom(page, options).await?;
        expand_collapsed(page, options, deadline).await
    };
    if until_deadline(deadline, reveal).await?.is_none() {
        debug!("attempt budget spent while revealing content, capturing current DOM");
    }

    evaluate::<bool>(
        page,
        &format!(
            "(() => {{ document.querySelectorAll('[{EXPANDED_MARKER}]').forEach(e => e.removeAttribute('{EXPANDED_MARKER}')); return true; }})()"
        ),
    )
    .await?;

    let html = page.content().await.map_err(session_error)?;
    let final_url = page.url().await.ok().flatten();
    Ok(RenderedMarkup { html, final_url })
}

/// Run `work` until `deadline`; `Ok(None)` when the deadline hits first.
async fn until_deadline<T>(
    deadline: tokio::time::Instant,
    work: impl Future<Output = std::result::Result<T, BrowserError>>,
) -> std::result::Result<Option<T>, BrowserError> {
    match tokio::time::timeout_at(deadline, work).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

async fn navigate(
    page: &Page,
    url: &str,
    wait: WaitCondition,
) -> std::result::Result<(), BrowserError> {
    match wait {
        WaitCondition::NetworkIdle => {
            page.goto(url).await.map_err(navigation_error)?;
        }
        WaitCondition::DomContentLoaded => {
            let response = page
                .execute(NavigateParams::new(url))
                .await
                .map_err(navigation_error)?;
            if let Some(error_text) = &response.result.error_text {
                return Err(BrowserError::Navigation(error_text.clone()));
            }
        }
    }
    Ok(())
}

/// Poll until the DOM size and resource count hold still for `window`.
async fn wait_for_quiescence(
    page: &Page,
    window: Duration,
    wait: WaitCondition,
) -> std::result::Result<(), BrowserError> {
    const DOM_STATE: &str = "(() => [document.readyState, document.documentElement ? document.documentElement.outerHTML.length : 0, performance.getEntriesByType('resource').length])()";

    let mut last: Option<(u64, u64)> = None;
    let mut stable_since = Instant::now();
    loop {
        let (ready_state, dom_size, resources): (String, u64, u64) = evaluate(page, DOM_STATE).await?;
        let ready = match wait {
            WaitCondition::NetworkIdle => ready_state == "complete",
            WaitCondition::DomContentLoaded => ready_state != "loading",
        };
        let signature = (dom_size, resources);
        if last != Some(signature) {
            last = Some(signature);
            stable_since = Instant::now();
        } else if ready && stable_since.elapsed() >= window {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn scroll_to_bottom(
    page: &Page,
    options: &AttemptOptions,
) -> std::result::Result<(), BrowserError> {
    const HEIGHT: &str =
        "(() => document.scrollingElement ? document.scrollingElement.scrollHeight : 0)()";
    const SCROLL: &str = "(() => { window.scrollTo(0, document.scrollingElement ? document.scrollingElement.scrollHeight : 0); return true; })()";

    let mut height: u64 = evaluate(page, HEIGHT).await?;
    for iteration in 0..options.max_scroll_iterations {
        evaluate::<bool>(page, SCROLL).await?;
        tokio::time::sleep(options.scroll_pause).await;
        let next: u64 = evaluate(page, HEIGHT).await?;
        if next <= height {
            debug!(iteration, height, "page height settled");
            break;
        }
        height = next;
    }
    Ok(())
}

/// Activate one not-yet-activated candidate per call; returns `true` if something was activated.
const EXPAND_ONE: &str = r#"(texts, auto, marker) => {
  const wanted = texts.map(t => t.toLowerCase());
  const visible = el => { const r = el.getBoundingClientRect(); return r.width > 0 || r.height > 0; };
  const textMatch = el => {
    const t = (el.innerText || el.textContent || '').trim().toLowerCase();
    return t.length > 0 && wanted.some(w => t === w || (t.length <= 40 && t.includes(w)));
  };
  const disclosure = el => el.getAttribute('aria-expanded') === 'false'
    || el.hasAttribute('aria-controls')
    || el.hasAttribute('data-toggle')
    || /accordion|read-?more|expand|collaps|toggle/i.test(el.getAttribute('class') || '');
  if (auto) {
    for (const d of document.querySelectorAll('details:not([open])')) {
      if (d.hasAttribute(marker)) continue;
      d.setAttribute(marker, '1');
      d.open = true;
      return true;
    }
  }
  const selector = 'button, a, summary, [role="button"], [aria-expanded], [aria-controls], [data-toggle], [class*="accordion"], [class*="more"], [class*="expand"], [class*="collaps"], [class*="toggle"]';
  for (const el of document.querySelectorAll(selector)) {
    if (el.hasAttribute(marker) || !visible(el)) continue;
    if (!(textMatch(el) || (auto && disclosure(el)))) continue;
    el.setAttribute(marker, '1');
    if (el.tagName === 'A') {
      const href = el.getAttribute('href') || '';
      if (href && !href.startsWith('#') && !href.startsWith('javascript:')) continue;
    }
    el.click();
    return true;
  }
  return false;
}"#;

async fn expand_collapsed(
    page: &Page,
    options: &AttemptOptions,
    deadline: tokio::time::Instant,
) -> std::result::Result<(), BrowserError> {
    let texts = serde_json::to_string(&options.expand_texts)
        .map_err(|e| BrowserError::Session(e.to_string()))?;
    let call = format!(
        "({EXPAND_ONE})({texts}, {}, '{EXPANDED_MARKER}')",
        options.auto_expand_candidates
    );

    let mut clicks = 0;
    while clicks < options.max_expand_clicks {
        let activated: bool = evaluate(page, &call).await?;
        if !activated {
            break;
        }
        clicks += 1;
        let settle = wait_for_quiescence(page, options.quiescence, WaitCondition::DomContentLoaded);
        if tokio::time::timeout_at(deadline, settle).await.is_err() {
            debug!(clicks, "DOM still changing after expansion, continuing");
        }
    }
    if clicks > 0 {
        debug!(clicks, "expanded collapsed content");
    }
    Ok(())
}

async fn evaluate<T: serde::de::DeserializeOwned>(
    page: &Page,
    expression: &str,
) -> std::result::Result<T, BrowserError> {
    page.evaluate(expression)
        .await
        .map_err(session_error)?
        .into_value::<T>()
        .map_err(|e| BrowserError::Session(format!("unexpected script result: {e}")))
}

fn navigation_error(e: CdpError) -> BrowserError {
    match e {
        CdpError::Timeout => BrowserError::Timeout("navigation timed out".into()),
        other => BrowserError::Navigation(other.to_string()),
    }
}

fn session_error(e: CdpError) -> BrowserError {
    match e {
        CdpError::Timeout => BrowserError::Timeout("browser command timed out".into()),
        other => BrowserError::Session(other.to_string()),
    }
}
