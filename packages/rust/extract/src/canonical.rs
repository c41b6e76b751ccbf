//! Canonical URL recovery for archived snapshots.
//!
//! Priority: `<link rel="canonical">`, then `og:url` / `twitter:url`, then a URL
//! synthesized from the archive directory layout, then the browser's final
//! http(s) URL, then the snapshot's `file://` URI.

use std::path::Path;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

/// Directory name some archivers place above the host directory.
const ARCHIVE_MARKER: &str = "site_backup";

/// File extensions that can never be a host directory.
const PAGE_EXTENSIONS: &[&str] = &[".html", ".htm", ".php", ".asp", ".aspx", ".jsp"];

static CANONICAL_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="canonical"][href]"#).expect("valid selector"));
static META_URL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[property="og:url"][content], meta[name="twitter:url"][content], meta[property="twitter:url"][content]"#)
        .expect("valid selector")
});

/// Resolve the canonical URL for a snapshot.
pub fn canonical_url(
    doc: &Html,
    relative_path: &str,
    final_url: Option<&str>,
    file_path: &Path,
) -> String {
    let host = archive_host(relative_path);

    if let Some(url) = metadata_url(doc, host.as_deref()) {
        return url;
    }
    if let Some(url) = archive_url(relative_path) {
        return url;
    }
    if let Some(url) = final_url.and_then(web_url) {
        return url;
    }
    file_uri(file_path, relative_path)
}

/// Canonical link first, social metadata second. Relative values resolve against the inferred host.
fn metadata_url(doc: &Html, host: Option<&str>) -> Option<String> {
    let candidates = doc
        .select(&CANONICAL_LINK)
        .filter_map(|el| el.value().attr("href"))
        .chain(doc.select(&META_URL).filter_map(|el| el.value().attr("content")));

    for raw in candidates {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if let Some(url) = web_url(raw) {
            return Some(url);
        }
        if let Some(host) = host {
            let joined = Url::parse(&format!("https://{host}/")).and_then(|base| base.join(raw));
            if let Ok(joined) = joined {
                return Some(without_fragment(joined));
            }
        }
    }
    None
}

/// Host directory in an archive layout: the last dotted, non-page path component,
/// searched after the `site_backup` marker when one is present.
pub fn archive_host(relative_path: &str) -> Option<String> {
    archive_host_index(relative_path).map(|(_, host)| host.to_string())
}

fn archive_host_index(relative_path: &str) -> Option<(usize, &str)> {
    let parts: Vec<&str> = relative_path.split('/').filter(|p| !p.is_empty()).collect();
    let start = parts
        .iter()
        .rposition(|p| *p == ARCHIVE_MARKER)
        .map_or(0, |i| i + 1);

    parts
        .iter()
        .enumerate()
        .skip(start)
        .filter(|(_, segment)| {
            let lowered = segment.to_lowercase();
            segment.contains('.') && !PAGE_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
        })
        .last()
        .map(|(i, segment)| (i, *segment))
}

/// `https://<host>/<rest of path>` for an archive layout, if a host directory exists.
pub fn archive_url(relative_path: &str) -> Option<String> {
    let (index, host) = archive_host_index(relative_path)?;
    let rest: Vec<&str> = relative_path
        .split('/')
        .filter(|p| !p.is_empty())
        .skip(index + 1)
        .collect();
    let url = Url::parse(&format!("https://{host}/{}", rest.join("/"))).ok()?;
    Some(without_fragment(url))
}

fn web_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| without_fragment(url))
}

fn without_fragment(mut url: Url) -> String {
    url.set_fragment(None);
    url.to_string()
}

fn file_uri(file_path: &Path, relative_path: &str) -> String {
    std::path::absolute(file_path)
        .ok()
        .and_then(|p| Url::from_file_path(p).ok())
        .map(String::from)
        .unwrap_or_else(|| format!("file:///{relative_path}"))
}
