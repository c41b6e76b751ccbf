//! Snapshot discovery and the bounded rendering stage for site2docs.
//!
//! Rendering is driven through the [`SnapshotBrowser`] seam so the worker pool,
//! retry and fallback policy can be exercised without a real browser.

pub mod browser;
pub mod discover;
pub mod engine;

pub use browser::{
    AttemptOptions, BrowserError, ChromiumBrowser, RenderedMarkup, SnapshotBrowser, WaitCondition,
};
pub use discover::discover_snapshots;
pub use engine::{
    RenderEngine, RenderNotice, RenderReporter, SilentRenderReporter, auto_worker_count,
    worker_count,
};
