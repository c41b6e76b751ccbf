//! Core domain types for a site2docs run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current schema version for the `manifest.json` format.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Snapshots & pages
// ---------------------------------------------------------------------------

/// Stable page identity: `pg_` + 12 hex chars of SHA-256 over the `/`-separated relative path.
pub fn page_id_for(relative_path: &str) -> String {
    let digest = Sha256::digest(relative_path.as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("pg_{hex}")
}

/// Render a path relative to `root` with `/` separators, whatever the platform.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// One archived HTML file discovered under the input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Stable identity derived from `relative_path`.
    pub page_id: String,
    /// Absolute (or input-rooted) path on disk.
    pub path: PathBuf,
    /// Path relative to the input directory, `/`-separated.
    pub relative_path: String,
    /// File modification time, when the filesystem reports one.
    pub modified: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Build a snapshot record for `path` found under `root`.
    pub fn new(root: &Path, path: PathBuf, modified: Option<DateTime<Utc>>) -> Self {
        let relative_path = relative_slash_path(root, &path);
        Self {
            page_id: page_id_for(&relative_path),
            path,
            relative_path,
            modified,
        }
    }
}

/// A heading found in a page, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    /// 1 for `h1` through 6 for `h6`.
    pub level: u8,
    pub text: String,
}

/// An extracted page. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub page_id: String,
    /// Canonical URL (recovered or synthesized).
    pub url: String,
    /// Path relative to the input directory.
    pub file_path: String,
    pub title: String,
    /// Readable text in Markdown form.
    pub text: String,
    pub headings: Vec<Heading>,
    /// Every resolved link target found on the page, internal or not.
    pub outbound_links: BTreeSet<String>,
    pub captured_at: DateTime<Utc>,
    pub render_mode: RenderMode,
}

impl Page {
    /// True when the canonical URL points at a live web location.
    pub fn has_web_url(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

// ---------------------------------------------------------------------------
// Render outcomes
// ---------------------------------------------------------------------------

/// How a page's markup was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// A browser produced a settled DOM.
    Rendered,
    /// Raw on-disk markup was used after rendering failed.
    Fallback,
}

/// Why rendering gave up on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    RenderTimeout,
    NavigationFailed,
    BrowserError,
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RenderTimeout => "render_timeout",
            Self::NavigationFailed => "navigation_failed",
            Self::BrowserError => "browser_error",
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of rendering one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Stable markup from the browser.
    Rendered(String),
    /// Raw on-disk markup, used because rendering failed and fallback is allowed.
    RenderedWithFallback {
        markup: String,
        reason: FallbackReason,
    },
    /// Rendering failed and fallback is not allowed.
    Failed(String),
}

impl RenderOutcome {
    /// The usable markup, if any.
    pub fn markup(&self) -> Option<&str> {
        match self {
            Self::Rendered(markup) | Self::RenderedWithFallback { markup, .. } => Some(markup),
            Self::Failed(_) => None,
        }
    }

    pub fn mode(&self) -> Option<RenderMode> {
        match self {
            Self::Rendered(_) => Some(RenderMode::Rendered),
            Self::RenderedWithFallback { .. } => Some(RenderMode::Fallback),
            Self::Failed(_) => None,
        }
    }
}

/// A snapshot together with its render outcome.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub snapshot: Snapshot,
    pub outcome: RenderOutcome,
    /// URL the browser ended up on, when a browser attempt succeeded.
    pub final_url: Option<String>,
    /// Attempts made (1 or 2).
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Clusters & findings
// ---------------------------------------------------------------------------

/// A group of topically related pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub label: String,
    /// URL-safe, unique within a run.
    pub slug: String,
    /// Ordered by (url, page_id).
    pub member_page_ids: Vec<String>,
}

/// Category of an advisory audit finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    EmptyCluster,
    UnderLengthPage,
    MissingSourceUrl,
    UnsupportedLabelToken,
    SummaryNotInSource,
    InsufficientSummaryCoverage,
}

/// An advisory audit result. Never blocks output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    pub kind: FindingKind,
    pub detail: String,
}

/// The `logs/quality_report.json` structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub inspected_clusters: usize,
    pub inspected_pages: usize,
    pub findings: Vec<Finding>,
}

// ---------------------------------------------------------------------------
// Stage ledger
// ---------------------------------------------------------------------------

/// Pipeline stage, in canonical forward order. `Failed` is terminal and outside the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Rendering,
    Rendered,
    Extracting,
    Clustering,
    Writing,
    QualityCheck,
    Completed,
    Failed,
}

impl Stage {
    /// Every non-terminal-failure stage, in order.
    pub const ORDER: [Stage; 8] = [
        Stage::Discovered,
        Stage::Rendering,
        Stage::Rendered,
        Stage::Extracting,
        Stage::Clustering,
        Stage::Writing,
        Stage::QualityCheck,
        Stage::Completed,
    ];

    /// Position in [`Stage::ORDER`]; `None` for `Failed`.
    pub fn rank(self) -> Option<usize> {
        Self::ORDER.iter().position(|s| *s == self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Rendering => "rendering",
            Self::Rendered => "rendered",
            Self::Extracting => "extracting",
            Self::Clustering => "clustering",
            Self::Writing => "writing",
            Self::QualityCheck => "quality_check",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of render attempt notice carried by `rendering` ledger lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderEventKind {
    Start,
    Retry,
    Success,
    Fallback,
    Failure,
}

/// Stage-specific counters. Only the meaningful ones are set (and serialized).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCounters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<RenderEventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_html: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_pages: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reasons: Option<BTreeMap<String, usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One self-contained ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    pub input_dir: String,
    pub output_dir: String,
    pub stage: Stage,
    #[serde(flatten)]
    pub counters: StageCounters,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Per-page manifest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPage {
    pub page_id: String,
    pub url: String,
    pub file_path: String,
    pub title: String,
    pub cluster_id: String,
    pub captured_at: DateTime<Utc>,
    pub render_mode: RenderMode,
}

/// Per-cluster manifest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestCluster {
    pub cluster_id: String,
    pub label: String,
    pub slug: String,
    pub page_ids: Vec<String>,
}

/// The `manifest.json` structure stored at the root of the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    /// Tool version that produced the output.
    pub tool_version: String,
    pub pages: Vec<ManifestPage>,
    pub clusters: Vec<ManifestCluster>,
}
