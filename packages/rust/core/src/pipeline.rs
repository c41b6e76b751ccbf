//! End-to-end `build` pipeline: snapshots → render → extract → cluster → docs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use site2docs_extract::ContentExtractor;
use site2docs_renderer::{
    RenderEngine, RenderNotice, RenderReporter, SnapshotBrowser, discover_snapshots,
};
use site2docs_shared::{
    ExtractConfig, GraphConfig, Page, QualityConfig, RenderConfig, RenderEventKind, RenderOutcome,
    Result, RunId, Snapshot, Stage, StageCounters,
};

use crate::audit::HallucinationAuditor;
use crate::cluster::{ClusterEngine, validate_partition};
use crate::document::write_documents;
use crate::graph::LinkGraph;
use crate::manifest::{build_manifest, write_json};
use crate::tracker::{RenderLedger, StageTracker};

/// Report file written by the quality check.
pub const QUALITY_REPORT_FILE: &str = "quality_report.json";

/// Configuration for the `build` pipeline.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Directory of archived HTML snapshots.
    pub input_dir: PathBuf,
    /// Destination for `docs/`, `manifest.json` and `logs/`.
    pub output_dir: PathBuf,
    pub render: RenderConfig,
    pub extract: ExtractConfig,
    pub graph: GraphConfig,
    pub quality: QualityConfig,
    /// Tool version string recorded in the manifest.
    pub tool_version: String,
}

/// Result of the `build` pipeline.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub run_id: RunId,
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub pages: usize,
    pub clusters: usize,
    pub documents: usize,
    /// Pages built from raw markup after their render failed.
    pub fallback_pages: usize,
    /// Fallback count per reason (`render_timeout`, ...).
    pub fallback_reasons: BTreeMap<String, usize>,
    /// Finding count; `None` when the audit was disabled.
    pub findings: Option<usize>,
    pub elapsed: std::time::Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a page finishes rendering (or falls back).
    fn page_rendered(&self, file: &str, current: usize, total: usize);
    /// Called when a page is extracted.
    fn page_extracted(&self, file: &str, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, result: &BuildResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_rendered(&self, _file: &str, _current: usize, _total: usize) {}
    fn page_extracted(&self, _file: &str, _current: usize, _total: usize) {}
    fn done(&self, _result: &BuildResult) {}
}

/// Run the full `build` pipeline.
///
/// 1. Discover snapshots (an unreadable input aborts before the ledger opens)
/// 2. Render through the bounded engine
/// 3. Extract pages
/// 4. Build the link graph and cluster it
/// 5. Write documents and the manifest
/// 6. Audit (unless disabled)
///
/// Any fatal error appends a `failed` line to the ledger before returning.
#[instrument(skip_all, fields(input = %config.input_dir.display(), output = %config.output_dir.display()))]
pub async fn build_documents(
    config: &BuildConfig,
    browser: Arc<dyn SnapshotBrowser>,
    progress: Arc<dyn ProgressReporter>,
) -> Result<BuildResult> {
    let start = Instant::now();
    let run_id = RunId::new();

    let extractor = ContentExtractor::new(config.extract.clone())?;
    let cluster_engine = ClusterEngine::new(config.graph.clone())?;

    progress.phase("Discovering snapshots");
    let snapshots = discover_snapshots(&config.input_dir)?;
    if snapshots.is_empty() {
        warn!(input = %config.input_dir.display(), "no HTML snapshots found");
    }

    let mut tracker = StageTracker::start(run_id, &config.input_dir, &config.output_dir)?;
    info!(%run_id, snapshots = snapshots.len(), "starting build pipeline");

    let outcome = run_stages(
        config,
        run_id,
        snapshots,
        browser,
        &extractor,
        &cluster_engine,
        &progress,
        &mut tracker,
    )
    .await;

    match outcome {
        Ok(mut result) => {
            tracker.finish().await?;
            result.elapsed = start.elapsed();
            progress.done(&result);
            info!(
                %run_id,
                pages = result.pages,
                clusters = result.clusters,
                fallback_pages = result.fallback_pages,
                elapsed_ms = result.elapsed.as_millis(),
                "build pipeline complete"
            );
            Ok(result)
        }
        Err(e) => {
            let fatal = tracker.fail(e);
            if let Err(ledger) = tracker.finish().await {
                warn!(error = %ledger, "failed to flush ledger after fatal error");
            }
            Err(fatal)
        }
    }
}

async fn run_stages(
    config: &BuildConfig,
    run_id: RunId,
    snapshots: Vec<Snapshot>,
    browser: Arc<dyn SnapshotBrowser>,
    extractor: &ContentExtractor,
    cluster_engine: &ClusterEngine,
    progress: &Arc<dyn ProgressReporter>,
    tracker: &mut StageTracker,
) -> Result<BuildResult> {
    let run_started = Utc::now();
    let total_html = snapshots.len();

    tracker.advance(
        Stage::Discovered,
        StageCounters {
            total_html: Some(total_html),
            ..StageCounters::default()
        },
    )?;

    // --- Render ---
    progress.phase("Rendering snapshots");
    tracker.advance(
        Stage::Rendering,
        StageCounters {
            total_html: Some(total_html),
            ..StageCounters::default()
        },
    )?;
    let reporter: Arc<dyn RenderReporter> = Arc::new(RenderProgress {
        ledger: tracker.render_sink(),
        progress: Arc::clone(progress),
        total: total_html,
        finished: AtomicUsize::new(0),
    });
    let engine = RenderEngine::new(browser, config.render.clone());
    let rendered = engine.render_all(snapshots, reporter).await?;

    let mut fallback_reasons: BTreeMap<String, usize> = BTreeMap::new();
    for page in &rendered {
        if let RenderOutcome::RenderedWithFallback { reason, .. } = &page.outcome {
            *fallback_reasons.entry(reason.as_str().to_string()).or_default() += 1;
        }
    }
    let fallback_pages: usize = fallback_reasons.values().sum();
    tracker.advance(
        Stage::Rendered,
        StageCounters {
            total_html: Some(total_html),
            rendered: Some(rendered.len()),
            fallback_pages: Some(fallback_pages),
            fallback_reasons: Some(fallback_reasons.clone()),
            ..StageCounters::default()
        },
    )?;

    // --- Extract ---
    progress.phase("Extracting pages");
    tracker.advance(
        Stage::Extracting,
        StageCounters {
            rendered: Some(rendered.len()),
            ..StageCounters::default()
        },
    )?;
    let mut pages: Vec<Page> = Vec::with_capacity(rendered.len());
    let mut failed = 0;
    for (i, item) in rendered.iter().enumerate() {
        match extractor.extract(item, run_started) {
            Ok(page) => pages.push(page),
            Err(e) => {
                failed += 1;
                warn!(file = %item.snapshot.relative_path, error = %e, "extraction failed, skipping page");
            }
        }
        progress.page_extracted(&item.snapshot.relative_path, i + 1, rendered.len());
    }
    tracker.record(StageCounters {
        extracted: Some(pages.len()),
        failed: Some(failed),
        last_file: rendered.last().map(|p| p.snapshot.relative_path.clone()),
        ..StageCounters::default()
    })?;

    // --- Cluster ---
    progress.phase("Clustering pages");
    tracker.advance(
        Stage::Clustering,
        StageCounters {
            pages: Some(pages.len()),
            ..StageCounters::default()
        },
    )?;
    let graph = LinkGraph::build(&pages);
    let clusters = cluster_engine.cluster(&graph, &pages)?;
    validate_partition(&clusters, &pages)?;
    tracker.record(StageCounters {
        pages: Some(pages.len()),
        clusters: Some(clusters.len()),
        ..StageCounters::default()
    })?;

    // --- Write ---
    progress.phase("Writing documents");
    tracker.advance(
        Stage::Writing,
        StageCounters {
            clusters: Some(clusters.len()),
            ..StageCounters::default()
        },
    )?;
    let created_at = Utc::now();
    let documents = write_documents(
        &config.output_dir.join("docs"),
        &clusters,
        &pages,
        created_at,
        config.quality.summary_snippet_limit,
    )?;
    let manifest_path = config.output_dir.join("manifest.json");
    let manifest = build_manifest(&clusters, &pages, created_at, &config.tool_version);
    write_json(&manifest_path, &manifest)?;
    tracker.record(StageCounters {
        documents_count: Some(documents.len()),
        last_document: documents.last().map(|p| p.display().to_string()),
        manifest: Some(manifest_path.display().to_string()),
        ..StageCounters::default()
    })?;

    // --- Audit ---
    let findings = if config.quality.enabled {
        progress.phase("Checking quality");
        tracker.advance(
            Stage::QualityCheck,
            StageCounters {
                clusters: Some(clusters.len()),
                pages: Some(pages.len()),
                ..StageCounters::default()
            },
        )?;
        let report = HallucinationAuditor::new(config.quality.clone()).audit(&clusters, &pages);
        write_json(&config.output_dir.join("logs").join(QUALITY_REPORT_FILE), &report)?;
        tracker.record(StageCounters {
            findings: Some(report.findings.len()),
            ..StageCounters::default()
        })?;
        Some(report.findings.len())
    } else {
        None
    };

    tracker.advance(
        Stage::Completed,
        StageCounters {
            pages: Some(pages.len()),
            clusters: Some(clusters.len()),
            documents_count: Some(documents.len()),
            fallback_pages: Some(fallback_pages),
            fallback_reasons: Some(fallback_reasons.clone()),
            findings,
            manifest: Some(manifest_path.display().to_string()),
            ..StageCounters::default()
        },
    )?;

    Ok(BuildResult {
        run_id,
        output_dir: config.output_dir.clone(),
        manifest_path,
        pages: pages.len(),
        clusters: clusters.len(),
        documents: documents.len(),
        fallback_pages,
        fallback_reasons,
        findings,
        elapsed: std::time::Duration::ZERO,
    })
}

// ---------------------------------------------------------------------------
// Render progress adapter
// ---------------------------------------------------------------------------

/// Forwards render notices to the ledger and the progress reporter.
struct RenderProgress {
    ledger: RenderLedger,
    progress: Arc<dyn ProgressReporter>,
    total: usize,
    finished: AtomicUsize,
}

impl RenderReporter for RenderProgress {
    fn notice(&self, notice: RenderNotice) {
        if matches!(notice.kind, RenderEventKind::Success | RenderEventKind::Fallback) {
            let current = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
            self.progress.page_rendered(&notice.file, current, self.total);
        }
        self.ledger.notice(notice);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use site2docs_renderer::{AttemptOptions, BrowserError, RenderedMarkup};
    use site2docs_shared::{Manifest, RenderMode};

    use super::*;

    /// Serves snapshot files as-is; files named `broken*` always time out.
    struct FakeBrowser;

    #[async_trait]
    impl SnapshotBrowser for FakeBrowser {
        async fn render(
            &self,
            snapshot: &Path,
            _options: &AttemptOptions,
        ) -> std::result::Result<RenderedMarkup, BrowserError> {
            let name = snapshot.file_name().unwrap().to_string_lossy();
            if name.starts_with("broken") {
                return Err(BrowserError::Timeout("never settled".into()));
            }
            let html = std::fs::read_to_string(snapshot)
                .map_err(|e| BrowserError::Navigation(e.to_string()))?;
            Ok(RenderedMarkup {
                html,
                final_url: None,
            })
        }
    }

    fn write_page(root: &Path, rel: &str, canonical: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let html = format!(
            "<html><head><title>{rel}</title><link rel=\"canonical\" href=\"{canonical}\"></head>\
             <body><main>{body}</main></body></html>"
        );
        std::fs::write(path, html).unwrap();
    }

    fn support_site(root: &Path) {
        write_page(
            root,
            "support/index.html",
            "https://example.com/support/index.html",
            "<h1>Support</h1><p>Welcome to support. Read the <a href=\"faq.html\">FAQ</a> for answers.</p>",
        );
        write_page(
            root,
            "support/faq.html",
            "https://example.com/support/faq.html",
            "<h1>FAQ</h1><p>Frequently asked support questions and their answers.</p>",
        );
    }

    fn config(input: &Path, output: &Path) -> BuildConfig {
        BuildConfig {
            input_dir: input.to_path_buf(),
            output_dir: output.to_path_buf(),
            render: RenderConfig {
                retry_backoff_ms: 0,
                ..RenderConfig::default()
            },
            extract: ExtractConfig::default(),
            graph: GraphConfig::default(),
            quality: QualityConfig::default(),
            tool_version: "0.0.0-test".into(),
        }
    }

    fn ledger(output: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(output.join("logs").join("build_summary.jsonl"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    async fn run(config: &BuildConfig) -> Result<BuildResult> {
        build_documents(config, Arc::new(FakeBrowser), Arc::new(SilentProgress)).await
    }

    #[tokio::test]
    async fn two_support_pages_become_one_cluster() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        support_site(input.path());

        let result = run(&config(input.path(), output.path())).await.unwrap();
        assert_eq!(result.pages, 2);
        assert_eq!(result.clusters, 1);
        assert_eq!(result.documents, 1);
        assert_eq!(result.fallback_pages, 0);
        assert!(result.findings.is_some());

        let raw = std::fs::read_to_string(&result.manifest_path).unwrap();
        let manifest: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest.clusters.len(), 1);
        let cluster = &manifest.clusters[0];
        assert_eq!(cluster.label, "Support");
        assert_eq!(cluster.cluster_id, "cl_support");
        assert_eq!(cluster.page_ids.len(), 2);
        assert!(manifest.pages.iter().all(|p| p.cluster_id == "cl_support"));

        let doc = std::fs::read_to_string(output.path().join("docs").join("support.md")).unwrap();
        assert!(doc.contains("# Support"));
        assert!(doc.contains("https://example.com/support/faq.html"));

        let lines = ledger(output.path());
        let stages: Vec<&str> = lines.iter().map(|l| l["stage"].as_str().unwrap()).collect();
        assert_eq!(stages.last(), Some(&"completed"));
        let mut position = 0;
        for stage in Stage::ORDER {
            let found = stages[position..]
                .iter()
                .position(|s| *s == stage.as_str())
                .unwrap_or_else(|| panic!("{stage} missing from ledger"));
            position += found;
        }
        let completed = lines.last().unwrap();
        assert_eq!(completed["documents_count"], 1);
        assert_eq!(completed["clusters"], 1);
        assert!(output.path().join("logs").join(QUALITY_REPORT_FILE).exists());
    }

    #[tokio::test]
    async fn exhausted_render_without_fallback_writes_nothing() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        support_site(input.path());
        write_page(input.path(), "support/broken.html", "https://example.com/support/broken.html", "<p>x</p>");

        let err = run(&config(input.path(), output.path())).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("rendering stage failed"), "{message}");
        assert!(message.contains("last completed stage: discovered"), "{message}");
        assert!(message.contains("last file: support/broken.html"), "{message}");
        match err {
            site2docs_shared::Site2DocsError::Fatal { cause, .. } => {
                assert!(matches!(*cause, site2docs_shared::Site2DocsError::Render { attempts: 2, .. }));
            }
            other => panic!("expected a fatal error, got {other:?}"),
        }
        assert!(!output.path().join("docs").exists());
        assert!(!output.path().join("manifest.json").exists());

        let lines = ledger(output.path());
        let last = lines.last().unwrap();
        assert_eq!(last["stage"], "failed");
        assert_eq!(last["failed_stage"], "rendering");
        assert_eq!(last["last_completed_stage"], "discovered");
        assert_eq!(last["last_file"], "support/broken.html");
    }

    #[tokio::test]
    async fn exhausted_render_with_fallback_completes() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        support_site(input.path());
        write_page(
            input.path(),
            "support/broken.html",
            "https://example.com/support/broken.html",
            "<p>Raw support markup kept on disk.</p>",
        );

        let mut config = config(input.path(), output.path());
        config.render.allow_fallback = true;
        let result = run(&config).await.unwrap();

        assert_eq!(result.pages, 3);
        assert_eq!(result.fallback_pages, 1);
        assert_eq!(result.fallback_reasons.get("render_timeout"), Some(&1));

        let raw = std::fs::read_to_string(&result.manifest_path).unwrap();
        let manifest: Manifest = serde_json::from_str(&raw).unwrap();
        let broken = manifest
            .pages
            .iter()
            .find(|p| p.file_path == "support/broken.html")
            .unwrap();
        assert_eq!(broken.render_mode, RenderMode::Fallback);

        let lines = ledger(output.path());
        assert!(lines.iter().any(|l| l["event"] == "fallback"));
        assert_eq!(lines.last().unwrap()["fallback_reasons"]["render_timeout"], 1);
    }

    #[tokio::test]
    async fn disabled_audit_skips_report_and_stage() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        support_site(input.path());

        let mut config = config(input.path(), output.path());
        config.quality.enabled = false;
        let result = run(&config).await.unwrap();

        assert_eq!(result.findings, None);
        assert!(!output.path().join("logs").join(QUALITY_REPORT_FILE).exists());
        let lines = ledger(output.path());
        assert!(lines.iter().all(|l| l["stage"] != "quality_check"));
        assert_eq!(lines.last().unwrap()["stage"], "completed");
        assert!(lines.last().unwrap().get("findings").is_none());
    }

    #[tokio::test]
    async fn missing_input_fails_before_the_ledger_opens() {
        let output = tempfile::tempdir().unwrap();
        let config = config(&output.path().join("nope"), output.path());
        let err = run(&config).await.unwrap_err();
        assert!(matches!(err, site2docs_shared::Site2DocsError::Input { .. }));
        assert!(!output.path().join("logs").exists());
    }
}
