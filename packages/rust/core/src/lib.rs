//! Core pipeline orchestration and domain logic for site2docs.
//!
//! This crate ties together snapshot rendering, extraction, link-graph
//! clustering, document writing, and auditing into the `build` workflow,
//! with every stage transition recorded in the run ledger.

pub mod audit;
pub mod cluster;
pub mod document;
pub mod graph;
pub mod label;
pub mod manifest;
pub mod pipeline;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use audit::HallucinationAuditor;
pub use cluster::{ClusterEngine, greedy_modularity, validate_partition};
pub use graph::{LinkGraph, LinkStats};
pub use label::{Labeler, slugify, unique_slug};
pub use pipeline::{BuildConfig, BuildResult, ProgressReporter, SilentProgress, build_documents};
pub use tracker::{RenderLedger, StageTracker};
