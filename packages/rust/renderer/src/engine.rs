//! Bounded render engine: worker pool, relaxed retry, and fallback policy.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use encoding_rs::{Encoding, UTF_8};
use regex::bytes::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use site2docs_shared::{
    RenderConfig, RenderEventKind, RenderOutcome, RenderedPage, Result, Site2DocsError, Snapshot,
};

use crate::browser::{AttemptOptions, BrowserError, RenderedMarkup, SnapshotBrowser};

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// One render attempt notice (start, retry, success, fallback, failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderNotice {
    pub page_id: String,
    /// Snapshot path relative to the input directory.
    pub file: String,
    pub kind: RenderEventKind,
    pub attempt: u32,
    pub reason: Option<String>,
}

/// Receives render notices from workers. Implementations must only enqueue.
pub trait RenderReporter: Send + Sync {
    fn notice(&self, notice: RenderNotice);
}

/// No-op reporter for headless/test usage.
pub struct SilentRenderReporter;

impl RenderReporter for SilentRenderReporter {
    fn notice(&self, _notice: RenderNotice) {}
}

// ---------------------------------------------------------------------------
// Worker count
// ---------------------------------------------------------------------------

/// Hardware-derived ceiling on concurrent browser sessions.
pub fn auto_worker_count(cpus: usize) -> usize {
    match cpus {
        0 | 1 => 1,
        2..=4 => cpus - 1,
        _ => (cpus / 2 + 2).min(8),
    }
}

/// Effective worker count for `total` pages, clamped to `[1, total]`.
pub fn worker_count(explicit: Option<usize>, total: usize) -> usize {
    let wanted = explicit.unwrap_or_else(|| {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        auto_worker_count(cpus)
    });
    wanted.clamp(1, total.max(1))
}

// ---------------------------------------------------------------------------
// RenderEngine
// ---------------------------------------------------------------------------

/// Renders snapshots concurrently through a [`SnapshotBrowser`].
pub struct RenderEngine {
    browser: Arc<dyn SnapshotBrowser>,
    config: Arc<RenderConfig>,
}

impl RenderEngine {
    pub fn new(browser: Arc<dyn SnapshotBrowser>, config: RenderConfig) -> Self {
        Self {
            browser,
            config: Arc::new(config),
        }
    }

    /// Render every snapshot, returning results in input order.
    ///
    /// When a page exhausts its retry and fallback is disabled, remaining work is
    /// cancelled and [`Site2DocsError::Render`] names the offending file.
    #[instrument(skip_all, fields(pages = snapshots.len()))]
    pub async fn render_all(
        &self,
        snapshots: Vec<Snapshot>,
        reporter: Arc<dyn RenderReporter>,
    ) -> Result<Vec<RenderedPage>> {
        let total = snapshots.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let workers = worker_count(self.config.concurrency, total);
        info!(
            workers,
            allow_fallback = self.config.allow_fallback,
            "starting render"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for (index, snapshot) in snapshots.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let browser = self.browser.clone();
            let config = self.config.clone();
            let reporter = reporter.clone();
            tasks.spawn(async move {
                // A closed pool means another page already failed the run.
                let Ok(_permit) = semaphore.clone().acquire_owned().await else {
                    return None;
                };
                let page =
                    render_one(browser.as_ref(), &config, snapshot, reporter.as_ref()).await;
                if matches!(page.outcome, RenderOutcome::Failed(_)) {
                    semaphore.close();
                }
                Some((index, page))
            });
        }

        let mut slots: Vec<Option<RenderedPage>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, page) = match joined {
                Ok(Some(done)) => done,
                Ok(None) => continue,
                Err(e) => {
                    tasks.abort_all();
                    return Err(Site2DocsError::Browser(format!("render task failed: {e}")));
                }
            };
            if let RenderOutcome::Failed(reason) = &page.outcome {
                tasks.abort_all();
                return Err(Site2DocsError::Render {
                    path: page.snapshot.path.clone(),
                    attempts: page.attempts,
                    reason: reason.clone(),
                });
            }
            slots[index] = Some(page);
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

/// Render a single snapshot: first attempt, one relaxed retry, then the fallback policy.
async fn render_one(
    browser: &dyn SnapshotBrowser,
    config: &RenderConfig,
    snapshot: Snapshot,
    reporter: &dyn RenderReporter,
) -> RenderedPage {
    let notify = |kind, attempt, reason: Option<String>| {
        reporter.notice(RenderNotice {
            page_id: snapshot.page_id.clone(),
            file: snapshot.relative_path.clone(),
            kind,
            attempt,
            reason,
        });
    };

    notify(RenderEventKind::Start, 1, None);
    let mut attempts = 1;
    let mut error = match browser
        .render(&snapshot.path, &AttemptOptions::initial(config))
        .await
    {
        Ok(markup) => {
            notify(RenderEventKind::Success, attempts, None);
            return rendered(snapshot, markup, attempts);
        }
        Err(e) => e,
    };

    if error.is_retryable() {
        debug!(file = %snapshot.relative_path, error = %error, "retrying with relaxed waits");
        notify(RenderEventKind::Retry, 2, Some(error.to_string()));
        tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms)).await;
        attempts = 2;
        error = match browser
            .render(&snapshot.path, &AttemptOptions::relaxed(config))
            .await
        {
            Ok(markup) => {
                notify(RenderEventKind::Success, attempts, None);
                return rendered(snapshot, markup, attempts);
            }
            Err(e) => e,
        };
    }

    let reason = error.fallback_reason();
    if config.allow_fallback {
        match tokio::fs::read(&snapshot.path).await {
            Ok(bytes) => {
                warn!(file = %snapshot.relative_path, %reason, "using raw markup after render failure");
                notify(RenderEventKind::Fallback, attempts, Some(reason.to_string()));
                return RenderedPage {
                    snapshot,
                    outcome: RenderOutcome::RenderedWithFallback {
                        markup: decode_markup(&bytes),
                        reason,
                    },
                    final_url: None,
                    attempts,
                };
            }
            Err(io) => {
                error = BrowserError::Session(format!("{error}; fallback read failed: {io}"));
            }
        }
    }

    let detail = format!("{reason}: {error}");
    warn!(file = %snapshot.relative_path, %detail, "render failed");
    notify(RenderEventKind::Failure, attempts, Some(detail.clone()));
    RenderedPage {
        snapshot,
        outcome: RenderOutcome::Failed(detail),
        final_url: None,
        attempts,
    }
}

/// `charset` declared by a `<meta>` tag in the first kilobyte of a document.
static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i-u)<meta[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#).expect("valid regex")
});

/// Decode raw snapshot bytes as the browser would.
///
/// A byte-order mark wins, then a `<meta>` charset, then UTF-8. Bytes invalid in
/// the chosen encoding become U+FFFD.
fn decode_markup(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(1024)];
    let encoding = META_CHARSET
        .captures(head)
        .and_then(|c| c.get(1))
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!(encoding = used.name(), "replaced undecodable bytes in raw markup");
    }
    text.into_owned()
}

fn rendered(snapshot: Snapshot, markup: RenderedMarkup, attempts: u32) -> RenderedPage {
    RenderedPage {
        snapshot,
        outcome: RenderOutcome::Rendered(markup.html),
        final_url: markup.final_url,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use site2docs_shared::{FallbackReason, page_id_for};

    use super::*;

    fn snapshot(path: PathBuf, rel: &str) -> Snapshot {
        Snapshot {
            page_id: page_id_for(rel),
            path,
            relative_path: rel.to_string(),
            modified: None,
        }
    }

    fn test_config() -> RenderConfig {
        RenderConfig {
            retry_backoff_ms: 0,
            ..RenderConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        notices: Mutex<Vec<RenderNotice>>,
    }

    impl RenderReporter for RecordingReporter {
        fn notice(&self, notice: RenderNotice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    impl RecordingReporter {
        fn kinds(&self) -> Vec<(RenderEventKind, u32)> {
            self.notices
                .lock()
                .unwrap()
                .iter()
                .map(|n| (n.kind, n.attempt))
                .collect()
        }
    }

    /// Tracks in-flight renders; later inputs finish first.
    #[derive(Default)]
    struct CountingBrowser {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotBrowser for CountingBrowser {
        async fn render(
            &self,
            snapshot: &Path,
            _options: &AttemptOptions,
        ) -> std::result::Result<RenderedMarkup, BrowserError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let name = snapshot.display().to_string();
            let delay = if name.ends_with("0.html") { 40 } else { 10 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RenderedMarkup {
                html: format!("<html><body>{name}</body></html>"),
                final_url: None,
            })
        }
    }

    /// Times out on the first attempt, succeeds on the relaxed retry.
    #[derive(Default)]
    struct SlowFirstAttempt {
        seen: Mutex<Vec<AttemptOptions>>,
    }

    #[async_trait]
    impl SnapshotBrowser for SlowFirstAttempt {
        async fn render(
            &self,
            _snapshot: &Path,
            options: &AttemptOptions,
        ) -> std::result::Result<RenderedMarkup, BrowserError> {
            self.seen.lock().unwrap().push(options.clone());
            if options.attempt == 1 {
                Err(BrowserError::Timeout("network never idle".into()))
            } else {
                Ok(RenderedMarkup {
                    html: "<html><body>settled</body></html>".into(),
                    final_url: Some("https://example.com/a".into()),
                })
            }
        }
    }

    struct FailingBrowser(BrowserError);

    #[async_trait]
    impl SnapshotBrowser for FailingBrowser {
        async fn render(
            &self,
            _snapshot: &Path,
            _options: &AttemptOptions,
        ) -> std::result::Result<RenderedMarkup, BrowserError> {
            Err(self.0.clone())
        }
    }

    #[test]
    fn auto_worker_count_table() {
        assert_eq!(auto_worker_count(1), 1);
        assert_eq!(auto_worker_count(2), 1);
        assert_eq!(auto_worker_count(4), 3);
        assert_eq!(auto_worker_count(8), 6);
        assert_eq!(auto_worker_count(64), 8);
    }

    #[test]
    fn worker_count_clamps_to_page_total() {
        assert_eq!(worker_count(Some(16), 3), 3);
        assert_eq!(worker_count(Some(0), 3), 1);
        assert_eq!(worker_count(None, 1), 1);
        assert!(worker_count(None, 100) <= 8);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_order_preserved() {
        let browser = Arc::new(CountingBrowser::default());
        let config = RenderConfig {
            concurrency: Some(2),
            ..test_config()
        };
        let engine = RenderEngine::new(browser.clone(), config);
        let snapshots: Vec<Snapshot> = (0..6)
            .map(|i| snapshot(PathBuf::from(format!("site/p{i}.html")), &format!("p{i}.html")))
            .collect();

        let pages = engine
            .render_all(snapshots, Arc::new(SilentRenderReporter))
            .await
            .unwrap();

        assert!(browser.peak.load(Ordering::SeqCst) <= 2);
        let names: Vec<&str> = pages.iter().map(|p| p.snapshot.relative_path.as_str()).collect();
        assert_eq!(names, vec!["p0.html", "p1.html", "p2.html", "p3.html", "p4.html", "p5.html"]);
        assert!(
            pages
                .iter()
                .all(|p| matches!(p.outcome, RenderOutcome::Rendered(_)) && p.attempts == 1)
        );
    }

    #[tokio::test]
    async fn timeout_gets_one_relaxed_retry() {
        let browser = Arc::new(SlowFirstAttempt::default());
        let reporter = Arc::new(RecordingReporter::default());
        let engine = RenderEngine::new(browser.clone(), test_config());

        let pages = engine
            .render_all(
                vec![snapshot(PathBuf::from("site/a.html"), "a.html")],
                reporter.clone(),
            )
            .await
            .unwrap();

        assert_eq!(pages[0].attempts, 2);
        assert_eq!(
            pages[0].outcome,
            RenderOutcome::Rendered("<html><body>settled</body></html>".into())
        );
        assert_eq!(pages[0].final_url.as_deref(), Some("https://example.com/a"));

        let seen = browser.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].block_external);
        assert!(seen[1].block_external);
        assert!(seen[1].quiescence < seen[0].quiescence);
        assert!(seen[1].timeout > seen[0].timeout);

        assert_eq!(
            reporter.kinds(),
            vec![
                (RenderEventKind::Start, 1),
                (RenderEventKind::Retry, 2),
                (RenderEventKind::Success, 2),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_retry_falls_back_to_raw_markup_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.html");
        std::fs::write(&path, "<html><body>raw snapshot</body></html>").unwrap();

        let reporter = Arc::new(RecordingReporter::default());
        let config = RenderConfig {
            allow_fallback: true,
            ..test_config()
        };
        let engine = RenderEngine::new(
            Arc::new(FailingBrowser(BrowserError::Timeout("slow".into()))),
            config,
        );

        let pages = engine
            .render_all(vec![snapshot(path, "a.html")], reporter.clone())
            .await
            .unwrap();

        assert_eq!(
            pages[0].outcome,
            RenderOutcome::RenderedWithFallback {
                markup: "<html><body>raw snapshot</body></html>".into(),
                reason: FallbackReason::RenderTimeout,
            }
        );
        assert_eq!(pages[0].attempts, 2);
        assert_eq!(
            reporter.kinds().last(),
            Some(&(RenderEventKind::Fallback, 2))
        );
    }

    #[test]
    fn raw_markup_honours_declared_charset() {
        let html = "<html><head><meta charset=\"Shift_JIS\"></head><body>ヘルプ</body></html>";
        let (sjis, _, _) = encoding_rs::SHIFT_JIS.encode(html);
        assert_eq!(decode_markup(&sjis), html);

        let html = "<meta http-equiv=\"Content-Type\" content=\"text/html; charset=euc-jp\"><p>料金</p>";
        let (euc, _, _) = encoding_rs::EUC_JP.encode(html);
        assert_eq!(decode_markup(&euc), html);

        assert_eq!(decode_markup("<p>café</p>".as_bytes()), "<p>café</p>");
        assert_eq!(decode_markup(b"<p>\xff</p>"), "<p>\u{FFFD}</p>");
    }

    #[tokio::test]
    async fn exhausted_retry_is_fatal_without_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("b.html");
        std::fs::write(&bad, "<html></html>").unwrap();

        let reporter = Arc::new(RecordingReporter::default());
        let engine = RenderEngine::new(
            Arc::new(FailingBrowser(BrowserError::Navigation("net::ERR_FILE_NOT_FOUND".into()))),
            test_config(),
        );

        let err = engine
            .render_all(vec![snapshot(bad.clone(), "b.html")], reporter.clone())
            .await
            .unwrap_err();

        match err {
            Site2DocsError::Render {
                path,
                attempts,
                reason,
            } => {
                assert_eq!(path, bad);
                assert_eq!(attempts, 2);
                assert!(reason.starts_with("navigation_failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            reporter.kinds().last(),
            Some(&(RenderEventKind::Failure, 2))
        );
    }

    /// Fails every file named `bad*`; everything else renders slowly.
    #[derive(Default)]
    struct FirstPageFails {
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SnapshotBrowser for FirstPageFails {
        async fn render(
            &self,
            snapshot: &Path,
            _options: &AttemptOptions,
        ) -> std::result::Result<RenderedMarkup, BrowserError> {
            let name = snapshot
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.started.lock().unwrap().push(name.clone());
            if name.starts_with("bad") {
                return Err(BrowserError::Navigation("net::ERR_ABORTED".into()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(RenderedMarkup {
                html: format!("<html><body>{name}</body></html>"),
                final_url: None,
            })
        }
    }

    #[tokio::test]
    async fn fatal_failure_cancels_queued_pages() {
        let browser = Arc::new(FirstPageFails::default());
        let reporter = Arc::new(RecordingReporter::default());
        let config = RenderConfig {
            concurrency: Some(1),
            ..test_config()
        };
        let engine = RenderEngine::new(browser.clone(), config);
        let mut snapshots = vec![snapshot(PathBuf::from("site/bad.html"), "bad.html")];
        snapshots.extend(
            (1..=4).map(|i| snapshot(PathBuf::from(format!("site/p{i}.html")), &format!("p{i}.html"))),
        );

        let err = engine
            .render_all(snapshots, reporter.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, Site2DocsError::Render { attempts: 2, .. }));
        assert_eq!(
            *browser.started.lock().unwrap(),
            vec!["bad.html".to_string(), "bad.html".to_string()]
        );
        let notices = reporter.notices.lock().unwrap();
        assert!(notices.iter().all(|n| n.file == "bad.html"));
        assert!(
            !notices
                .iter()
                .any(|n| n.kind == RenderEventKind::Start && n.file != "bad.html")
        );
    }

    #[tokio::test]
    async fn session_errors_skip_the_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.html");
        std::fs::write(&path, "<p>raw</p>").unwrap();

        let reporter = Arc::new(RecordingReporter::default());
        let config = RenderConfig {
            allow_fallback: true,
            ..test_config()
        };
        let engine = RenderEngine::new(
            Arc::new(FailingBrowser(BrowserError::Session("target crashed".into()))),
            config,
        );

        let pages = engine
            .render_all(vec![snapshot(path, "a.html")], reporter.clone())
            .await
            .unwrap();

        assert_eq!(pages[0].attempts, 1);
        assert!(matches!(
            pages[0].outcome,
            RenderOutcome::RenderedWithFallback {
                reason: FallbackReason::BrowserError,
                ..
            }
        ));
        assert!(
            !reporter
                .kinds()
                .iter()
                .any(|(kind, _)| *kind == RenderEventKind::Retry)
        );
    }

    #[tokio::test]
    async fn empty_input_renders_nothing() {
        let engine = RenderEngine::new(Arc::new(CountingBrowser::default()), test_config());
        let pages = engine
            .render_all(Vec::new(), Arc::new(SilentRenderReporter))
            .await
            .unwrap();
        assert!(pages.is_empty());
    }
}
