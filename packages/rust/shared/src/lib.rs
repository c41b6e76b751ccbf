//! Shared types, error model, and configuration for site2docs.
//!
//! This crate is the foundation depended on by all other site2docs crates.
//! It provides:
//! - [`Site2DocsError`], the unified error type
//! - Domain types ([`Page`], [`RenderOutcome`], [`Cluster`], [`Finding`], [`StageEvent`], [`Manifest`])
//! - Configuration ([`AppConfig`], [`RenderConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEFAULT_EXPAND_TEXTS, ExtractConfig, GraphConfig, QualityConfig, RenderConfig,
    RenderSection, SmallClusterPolicy, config_dir, config_file_path, init_config, load_config,
    load_config_from, merge_expand_texts, validate_config,
};
pub use error::{Result, Site2DocsError};
pub use types::{
    AuditReport, Cluster, FallbackReason, Finding, FindingKind, Heading, MANIFEST_SCHEMA_VERSION,
    Manifest, ManifestCluster, ManifestPage, Page, RenderEventKind, RenderMode, RenderOutcome,
    RenderedPage, RunId, Snapshot, Stage, StageCounters, StageEvent, page_id_for,
    relative_slash_path,
};
