//! Application configuration for site2docs.
//!
//! User config lives at `~/.site2docs/site2docs.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, Site2DocsError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "site2docs.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".site2docs";

/// Button/link phrases that trigger expansion of collapsed content.
///
/// User-supplied phrases are merged onto this list, never substituted for it.
pub const DEFAULT_EXPAND_TEXTS: &[&str] = &[
    "more",
    "show more",
    "show all",
    "read more",
    "load more",
    "view more",
    "see more",
    "expand",
    "open all",
    "ver mas",
    "ver más",
    "mostrar mas",
    "weiterlesen",
    "もっと見る",
    "さらに表示",
    "詳細",
    "詳細を見る",
    "すべて表示",
    "全て表示",
    "続きを読む",
    "続きを見る",
    "展開",
    "折りたたみ解除",
];

// ---------------------------------------------------------------------------
// Config structs (matching site2docs.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rendering behaviour.
    #[serde(default)]
    pub render: RenderSection,

    /// Extraction behaviour.
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Link graph and clustering.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Hallucination audit.
    #[serde(default)]
    pub quality: QualityConfig,
}

/// `[render]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSection {
    /// Extra expansion phrases, merged onto [`DEFAULT_EXPAND_TEXTS`].
    #[serde(default)]
    pub extra_expand_texts: Vec<String>,

    /// Fixed number of concurrent browser sessions (auto-derived when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Use the raw on-disk markup when rendering fails after the retry.
    #[serde(default)]
    pub allow_fallback: bool,

    /// Navigation timeout for the first attempt.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long the DOM must stay unchanged to count as settled.
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,

    /// Quiescence window for the relaxed retry.
    #[serde(default = "default_relaxed_quiescence_ms")]
    pub relaxed_quiescence_ms: u64,

    /// Timeout multiplier applied to the relaxed retry.
    #[serde(default = "default_timeout_backoff_factor")]
    pub timeout_backoff_factor: f64,

    /// Pause before the relaxed retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on scroll-to-bottom iterations.
    #[serde(default = "default_max_scroll_iterations")]
    pub max_scroll_iterations: u32,

    /// Pause between scrolls.
    #[serde(default = "default_scroll_pause_ms")]
    pub scroll_pause_ms: u64,

    /// Upper bound on expansion clicks per page.
    #[serde(default = "default_max_expand_clicks")]
    pub max_expand_clicks: u32,

    /// Also activate disclosure widgets found by ARIA/class heuristics.
    #[serde(default = "default_true")]
    pub auto_expand_candidates: bool,

    /// Chrome/Chromium executable (auto-detected when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_executable: Option<String>,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            extra_expand_texts: Vec::new(),
            concurrency: None,
            allow_fallback: false,
            timeout_ms: default_timeout_ms(),
            quiescence_ms: default_quiescence_ms(),
            relaxed_quiescence_ms: default_relaxed_quiescence_ms(),
            timeout_backoff_factor: default_timeout_backoff_factor(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_scroll_iterations: default_max_scroll_iterations(),
            scroll_pause_ms: default_scroll_pause_ms(),
            max_expand_clicks: default_max_expand_clicks(),
            auto_expand_candidates: true,
            chrome_executable: None,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_quiescence_ms() -> u64 {
    500
}
fn default_relaxed_quiescence_ms() -> u64 {
    150
}
fn default_timeout_backoff_factor() -> f64 {
    1.6
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_max_scroll_iterations() -> u32 {
    20
}
fn default_scroll_pause_ms() -> u64 {
    200
}
fn default_max_expand_clicks() -> u32 {
    200
}
fn default_true() -> bool {
    true
}

/// `[extract]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Content containers tried in order before falling back to `<body>`.
    #[serde(default = "default_content_selectors")]
    pub content_selectors: Vec<String>,

    /// A container with less plain text than this is ignored in favour of `<body>`.
    #[serde(default = "default_min_content_characters")]
    pub min_content_characters: usize,

    /// Collect `h1`–`h6` headings.
    #[serde(default = "default_true")]
    pub preserve_headings: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            content_selectors: default_content_selectors(),
            min_content_characters: default_min_content_characters(),
            preserve_headings: true,
        }
    }
}

fn default_content_selectors() -> Vec<String> {
    ["article", "main", "[role=\"main\"]", ".content"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_min_content_characters() -> usize {
    40
}

/// What to do with clusters smaller than `min_cluster_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmallClusterPolicy {
    /// Pool small groups per host; leftovers join one catch-all cluster.
    #[default]
    Merge,
    /// Keep small groups (including singletons) as they are.
    Keep,
}

/// `[graph]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Minimum members for a cluster to stand on its own.
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    /// Policy for clusters below `min_cluster_size`.
    #[serde(default)]
    pub small_cluster_policy: SmallClusterPolicy,

    /// Communities larger than this are split by URL pattern.
    #[serde(default = "default_max_network_cluster_size")]
    pub max_network_cluster_size: usize,

    /// Number of normalized path segments used for URL-pattern splitting.
    #[serde(default = "default_url_pattern_depth")]
    pub url_pattern_depth: usize,

    /// Share of members that must carry a path prefix for it to become the label.
    #[serde(default = "default_label_prefix_fraction")]
    pub label_prefix_fraction: f64,

    /// Shortest token considered for TF-IDF labels.
    #[serde(default = "default_label_min_token_length")]
    pub label_min_token_length: usize,

    /// Number of TF-IDF terms joined into a label.
    #[serde(default = "default_label_terms")]
    pub label_terms: usize,

    /// Tokenizer rule for label terms.
    #[serde(default = "default_label_token_pattern")]
    pub label_token_pattern: String,

    /// Stop words added to the built-in English/Japanese lists.
    #[serde(default)]
    pub label_stop_words: Vec<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: default_min_cluster_size(),
            small_cluster_policy: SmallClusterPolicy::default(),
            max_network_cluster_size: default_max_network_cluster_size(),
            url_pattern_depth: default_url_pattern_depth(),
            label_prefix_fraction: default_label_prefix_fraction(),
            label_min_token_length: default_label_min_token_length(),
            label_terms: default_label_terms(),
            label_token_pattern: default_label_token_pattern(),
            label_stop_words: Vec::new(),
        }
    }
}

fn default_min_cluster_size() -> usize {
    2
}
fn default_max_network_cluster_size() -> usize {
    12
}
fn default_url_pattern_depth() -> usize {
    3
}
fn default_label_prefix_fraction() -> f64 {
    0.6
}
fn default_label_min_token_length() -> usize {
    3
}
fn default_label_terms() -> usize {
    3
}
fn default_label_token_pattern() -> String {
    r"(?u)[\w一-龥ぁ-んァ-ヶー]+".into()
}

/// `[quality]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Run the hallucination audit and write its report.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pages with less extracted text than this are flagged.
    #[serde(default = "default_min_page_characters")]
    pub min_page_characters: usize,

    /// Shortest label token that must be grounded in member text.
    #[serde(default = "default_quality_min_token_length")]
    pub label_min_token_length: usize,

    /// Flag pages without a resolvable http(s) source URL.
    #[serde(default = "default_true")]
    pub require_source_url: bool,

    /// Number of summary snippets expected per cluster document.
    #[serde(default = "default_summary_snippet_limit")]
    pub summary_snippet_limit: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_page_characters: default_min_page_characters(),
            label_min_token_length: default_quality_min_token_length(),
            require_source_url: true,
            summary_snippet_limit: default_summary_snippet_limit(),
        }
    }
}

fn default_min_page_characters() -> usize {
    120
}
fn default_quality_min_token_length() -> usize {
    4
}
fn default_summary_snippet_limit() -> usize {
    3
}

// ---------------------------------------------------------------------------
// Render config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime render configuration, merged from config file and CLI flags.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Expansion trigger phrases (defaults ∪ user additions).
    pub expand_texts: Vec<String>,
    /// Explicit concurrency override.
    pub concurrency: Option<usize>,
    /// Degrade to raw markup instead of aborting the run.
    pub allow_fallback: bool,
    pub timeout_ms: u64,
    pub quiescence_ms: u64,
    pub relaxed_quiescence_ms: u64,
    pub timeout_backoff_factor: f64,
    pub retry_backoff_ms: u64,
    pub max_scroll_iterations: u32,
    pub scroll_pause_ms: u64,
    pub max_expand_clicks: u32,
    pub auto_expand_candidates: bool,
    pub chrome_executable: Option<String>,
}

impl RenderConfig {
    /// Merge additional expansion phrases onto the current list.
    pub fn add_expand_texts<I, S>(&mut self, extras: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extras: Vec<String> = extras
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self.expand_texts = merge_expand_texts(&self.expand_texts, &extras);
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RenderConfig {
    fn from(config: &AppConfig) -> Self {
        let section = &config.render;
        let defaults: Vec<String> = DEFAULT_EXPAND_TEXTS.iter().map(|s| s.to_string()).collect();
        Self {
            expand_texts: merge_expand_texts(&defaults, &section.extra_expand_texts),
            concurrency: section.concurrency,
            allow_fallback: section.allow_fallback,
            timeout_ms: section.timeout_ms,
            quiescence_ms: section.quiescence_ms,
            relaxed_quiescence_ms: section.relaxed_quiescence_ms,
            timeout_backoff_factor: section.timeout_backoff_factor,
            retry_backoff_ms: section.retry_backoff_ms,
            max_scroll_iterations: section.max_scroll_iterations,
            scroll_pause_ms: section.scroll_pause_ms,
            max_expand_clicks: section.max_expand_clicks,
            auto_expand_candidates: section.auto_expand_candidates,
            chrome_executable: section.chrome_executable.clone(),
        }
    }
}

/// Union of two phrase lists, case-insensitive, keeping first-seen order and spelling.
pub fn merge_expand_texts(defaults: &[String], extras: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::with_capacity(defaults.len() + extras.len());
    for text in defaults.iter().chain(extras) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            merged.push(trimmed.to_string());
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.site2docs/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Site2DocsError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.site2docs/site2docs.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| Site2DocsError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        Site2DocsError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values that would make a run meaningless.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.render.concurrency == Some(0) {
        return Err(Site2DocsError::config("render.concurrency must be at least 1"));
    }
    if config.render.timeout_backoff_factor < 1.0 {
        return Err(Site2DocsError::config(
            "render.timeout_backoff_factor must be >= 1.0",
        ));
    }
    let fraction = config.graph.label_prefix_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(Site2DocsError::config(
            "graph.label_prefix_fraction must be in (0, 1]",
        ));
    }
    if config.graph.min_cluster_size == 0 {
        return Err(Site2DocsError::config("graph.min_cluster_size must be at least 1"));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| Site2DocsError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| Site2DocsError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| Site2DocsError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
