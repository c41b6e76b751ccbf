//! `manifest.json` builder and JSON file helpers.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::debug;

use site2docs_shared::{
    Cluster, MANIFEST_SCHEMA_VERSION, Manifest, ManifestCluster, ManifestPage, Page, Result,
    Site2DocsError,
};

/// Build the run manifest. Pages are listed in cluster order, then member order.
pub fn build_manifest(
    clusters: &[Cluster],
    pages: &[Page],
    created_at: DateTime<Utc>,
    tool_version: &str,
) -> Manifest {
    let lookup: BTreeMap<&str, &Page> = pages.iter().map(|p| (p.page_id.as_str(), p)).collect();

    let mut manifest_pages = Vec::with_capacity(pages.len());
    for cluster in clusters {
        for id in &cluster.member_page_ids {
            let Some(page) = lookup.get(id.as_str()) else {
                continue;
            };
            manifest_pages.push(ManifestPage {
                page_id: page.page_id.clone(),
                url: page.url.clone(),
                file_path: page.file_path.clone(),
                title: page.title.clone(),
                cluster_id: cluster.cluster_id.clone(),
                captured_at: page.captured_at,
                render_mode: page.render_mode,
            });
        }
    }

    Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        created_at,
        tool_version: tool_version.to_string(),
        pages: manifest_pages,
        clusters: clusters
            .iter()
            .map(|c| ManifestCluster {
                cluster_id: c.cluster_id.clone(),
                label: c.label.clone(),
                slug: c.slug.clone(),
                page_ids: c.member_page_ids.clone(),
            })
            .collect(),
    }
}

/// Write a JSON file (pretty-printed).
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Site2DocsError::validation(format!("JSON serialization failed: {e}")))?;
    std::fs::write(path, json).map_err(|e| Site2DocsError::io(path, e))?;
    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}
