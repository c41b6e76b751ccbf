//! Markdown document writer.
//!
//! One `docs/<slug>.md` per cluster: YAML front matter, a short summary
//! built from each page's first significant line, a contents list, then
//! every member page with its citation block.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, instrument};

use site2docs_shared::{Cluster, Page, Result, Site2DocsError};

/// Longest summary snippet, in characters, including the ellipsis.
pub const SNIPPET_MAX_CHARS: usize = 120;

const ELLIPSIS: &str = "...";

/// A summary line and the page it was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarySnippet {
    pub page_id: String,
    pub text: String,
}

impl SummarySnippet {
    /// The part of the snippet that must appear verbatim in the source page.
    pub fn grounded_text(&self) -> &str {
        self.text.strip_suffix(ELLIPSIS).unwrap_or(&self.text)
    }
}

/// First non-blank, non-heading line of `text`, truncated to [`SNIPPET_MAX_CHARS`].
pub fn first_significant_line(text: &str) -> Option<String> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("```"))?;

    if line.chars().count() <= SNIPPET_MAX_CHARS {
        return Some(line.to_string());
    }
    let kept: String = line
        .chars()
        .take(SNIPPET_MAX_CHARS - ELLIPSIS.len())
        .collect();
    Some(format!("{}{ELLIPSIS}", kept.trim_end()))
}

/// Up to `limit` snippets, one per member page, in member order.
pub fn summary_snippets(members: &[&Page], limit: usize) -> Vec<SummarySnippet> {
    members
        .iter()
        .filter_map(|page| {
            first_significant_line(&page.text).map(|text| SummarySnippet {
                page_id: page.page_id.clone(),
                text,
            })
        })
        .take(limit)
        .collect()
}

/// Resolve a cluster's member ids to pages, keeping member order.
pub fn cluster_members<'a>(cluster: &Cluster, lookup: &BTreeMap<&str, &'a Page>) -> Vec<&'a Page> {
    cluster
        .member_page_ids
        .iter()
        .filter_map(|id| lookup.get(id.as_str()).copied())
        .collect()
}

/// Render the Markdown document for one cluster.
pub fn render_document(
    cluster: &Cluster,
    members: &[&Page],
    created_at: DateTime<Utc>,
    snippet_limit: usize,
) -> String {
    let mut doc = String::new();

    // Front matter
    doc.push_str("---\n");
    let _ = writeln!(doc, "doc_id: \"doc_{}\"", cluster.slug);
    let _ = writeln!(doc, "cluster_id: \"{}\"", cluster.cluster_id);
    let _ = writeln!(doc, "cluster_label: \"{}\"", escape_yaml_string(&cluster.label));
    let _ = writeln!(doc, "cluster_slug: \"{}\"", cluster.slug);
    let source_urls: Vec<&str> = members
        .iter()
        .filter(|p| p.has_web_url())
        .map(|p| p.url.as_str())
        .collect();
    if source_urls.is_empty() {
        doc.push_str("source_urls: []\n");
    } else {
        doc.push_str("source_urls:\n");
        for url in &source_urls {
            let _ = writeln!(doc, "  - \"{}\"", escape_yaml_string(url));
        }
    }
    let _ = writeln!(
        doc,
        "created_at: \"{}\"",
        created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let _ = writeln!(doc, "pages: [{}]", cluster.member_page_ids.join(", "));
    doc.push_str("---\n\n");

    let _ = writeln!(doc, "# {}\n", cluster.label);

    let snippets = summary_snippets(members, snippet_limit);
    if !snippets.is_empty() {
        doc.push_str("## Summary\n\n");
        for snippet in &snippets {
            let _ = writeln!(doc, "- {}", snippet.text);
        }
        doc.push('\n');
    }

    if members.iter().any(|p| !p.headings.is_empty()) {
        doc.push_str("## Contents\n\n");
        for page in members {
            for heading in &page.headings {
                let indent = "  ".repeat(usize::from(heading.level.saturating_sub(1)));
                let _ = writeln!(doc, "{indent}- {}", heading.text);
            }
        }
        doc.push('\n');
    }

    for page in members {
        let title = if page.title.trim().is_empty() {
            page.page_id.as_str()
        } else {
            page.title.as_str()
        };
        let _ = writeln!(doc, "## {title}\n");
        let _ = writeln!(doc, "> Source URL: {}", page.url);
        let _ = writeln!(doc, "> File: {}", page.file_path);
        let _ = writeln!(doc, "> Captured: {}\n", page.captured_at.format("%Y-%m-%d"));
        let body = page.text.trim();
        if !body.is_empty() {
            doc.push_str(body);
            doc.push_str("\n\n");
        }
    }

    let trimmed = doc.trim_end().len();
    doc.truncate(trimmed);
    doc.push('\n');
    doc
}

/// Write one document per cluster into `docs_dir`. Returns the written paths in cluster order.
#[instrument(skip_all, fields(docs_dir = %docs_dir.display(), clusters = clusters.len()))]
pub fn write_documents(
    docs_dir: &Path,
    clusters: &[Cluster],
    pages: &[Page],
    created_at: DateTime<Utc>,
    snippet_limit: usize,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(docs_dir).map_err(|e| Site2DocsError::io(docs_dir, e))?;
    let lookup: BTreeMap<&str, &Page> = pages.iter().map(|p| (p.page_id.as_str(), p)).collect();

    let mut written = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let members = cluster_members(cluster, &lookup);
        let markdown = render_document(cluster, &members, created_at, snippet_limit);
        let path = docs_dir.join(format!("{}.md", cluster.slug));
        std::fs::write(&path, markdown).map_err(|e| Site2DocsError::io(&path, e))?;
        debug!(path = %path.display(), pages = members.len(), "wrote document");
        written.push(path);
    }

    info!(documents = written.len(), "documents written");
    Ok(written)
}

/// Escape special characters in a YAML string value.
fn escape_yaml_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_time, text_page};
    use site2docs_shared::Heading;

    fn cluster(ids: &[&str]) -> Cluster {
        Cluster {
            cluster_id: "cl_support".into(),
            label: "Support".into(),
            slug: "support".into(),
            member_page_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn significant_line_skips_headings_and_blanks() {
        let text = "# Title\n\n  \n## Sub\nFirst real line.\nSecond.";
        assert_eq!(first_significant_line(text).as_deref(), Some("First real line."));
        assert_eq!(first_significant_line("# only\n\n"), None);
    }

    #[test]
    fn long_lines_are_truncated_with_ellipsis() {
        let line = "word ".repeat(60);
        let snippet = first_significant_line(&line).unwrap();
        assert!(snippet.ends_with("..."));
        assert!(snippet.chars().count() <= SNIPPET_MAX_CHARS);
        let s = SummarySnippet { page_id: "pg".into(), text: snippet };
        assert!(line.contains(s.grounded_text()));
    }

    #[test]
    fn snippets_respect_limit() {
        let a = text_page("pg_a", "https://e.com/a", "Alpha text");
        let b = text_page("pg_b", "https://e.com/b", "");
        let c = text_page("pg_c", "https://e.com/c", "Gamma text");
        let d = text_page("pg_d", "https://e.com/d", "Delta text");
        let snippets = summary_snippets(&[&a, &b, &c, &d], 2);
        assert_eq!(snippets.len(), 2);
        assert_eq!(snippets[0].page_id, "pg_a");
        assert_eq!(snippets[1].page_id, "pg_c");
    }

    #[test]
    fn document_layout() {
        let mut a = text_page("pg_a", "https://example.com/support/faq.html", "Frequently asked.\n\nMore.");
        a.title = "FAQ".into();
        a.headings = vec![
            Heading { level: 1, text: "FAQ".into() },
            Heading { level: 2, text: "Billing".into() },
        ];
        let b = text_page("pg_b", "file:///tmp/x.html", "Contact us.");

        let doc = render_document(&cluster(&["pg_a", "pg_b"]), &[&a, &b], fixed_time(), 3);

        assert!(doc.starts_with("---\ndoc_id: \"doc_support\"\ncluster_id: \"cl_support\"\n"));
        assert!(doc.contains("source_urls:\n  - \"https://example.com/support/faq.html\"\n"));
        assert!(!doc.contains("  - \"file:///tmp/x.html\""));
        assert!(doc.contains("created_at: \"2024-05-01T12:00:00Z\""));
        assert!(doc.contains("pages: [pg_a, pg_b]"));
        assert!(doc.contains("# Support\n"));
        assert!(doc.contains("## Summary\n\n- Frequently asked.\n- Contact us.\n"));
        assert!(doc.contains("## Contents\n\n- FAQ\n  - Billing\n"));
        assert!(doc.contains("## FAQ\n\n> Source URL: https://example.com/support/faq.html\n> File: pg_a.html\n> Captured: 2024-05-01\n"));
        assert!(doc.contains("## pg_b\n"));
        assert!(doc.ends_with("Contact us.\n"));
    }

    #[test]
    fn write_documents_uses_slugs() {
        let tmp = tempfile::tempdir().unwrap();
        let docs = tmp.path().join("docs");
        let pages = vec![text_page("pg_a", "https://e.com/support/a", "Hello there")];
        let written =
            write_documents(&docs, &[cluster(&["pg_a"])], &pages, fixed_time(), 3).unwrap();
        assert_eq!(written, vec![docs.join("support.md")]);
        let content = std::fs::read_to_string(&written[0]).unwrap();
        assert!(content.contains("Hello there"));
    }
}
