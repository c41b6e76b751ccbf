//! Hallucination auditor.
//!
//! Re-reads each cluster's label and summary against the text of its member
//! pages. Findings are advisory and never alter written output.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, instrument};

use site2docs_shared::{AuditReport, Cluster, Finding, FindingKind, Page, QualityConfig};

use crate::document::{cluster_members, summary_snippets};

static LABEL_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-/|,_]+").expect("valid regex"));

static GENERIC_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^cluster-\d+$").expect("valid regex"));

pub struct HallucinationAuditor {
    config: QualityConfig,
}

impl HallucinationAuditor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    #[instrument(skip_all, fields(clusters = clusters.len()))]
    pub fn audit(&self, clusters: &[Cluster], pages: &[Page]) -> AuditReport {
        let lookup: BTreeMap<&str, &Page> = pages.iter().map(|p| (p.page_id.as_str(), p)).collect();
        let mut report = AuditReport {
            inspected_clusters: clusters.len(),
            ..AuditReport::default()
        };

        for cluster in clusters {
            let members = cluster_members(cluster, &lookup);
            report.inspected_pages += members.len();
            if members.is_empty() {
                report.findings.push(finding(
                    cluster,
                    None,
                    FindingKind::EmptyCluster,
                    "cluster has no member pages".into(),
                ));
                continue;
            }
            self.check_pages(cluster, &members, &mut report.findings);
            self.check_provenance(cluster, &members, &mut report.findings);
            self.check_label(cluster, &members, &mut report.findings);
            self.check_summary(cluster, &members, &mut report.findings);
        }

        info!(findings = report.findings.len(), "audit complete");
        report
    }

    fn check_pages(&self, cluster: &Cluster, members: &[&Page], findings: &mut Vec<Finding>) {
        for page in members {
            let length = page.text.trim().chars().count();
            if length < self.config.min_page_characters {
                findings.push(finding(
                    cluster,
                    Some(page.page_id.as_str()),
                    FindingKind::UnderLengthPage,
                    format!(
                        "page text has {length} characters, below the threshold of {}",
                        self.config.min_page_characters
                    ),
                ));
            }
        }
    }

    fn check_provenance(&self, cluster: &Cluster, members: &[&Page], findings: &mut Vec<Finding>) {
        if !self.config.require_source_url {
            return;
        }
        let mut sourced = 0;
        for page in members {
            if page.has_web_url() {
                sourced += 1;
            } else {
                findings.push(finding(
                    cluster,
                    Some(page.page_id.as_str()),
                    FindingKind::MissingSourceUrl,
                    format!("no web source URL recovered (have {})", page.url),
                ));
            }
        }
        if sourced == 0 {
            findings.push(finding(
                cluster,
                None,
                FindingKind::MissingSourceUrl,
                "cluster records no source URLs".into(),
            ));
        }
    }

    /// One finding per label token that no member page mentions.
    fn check_label(&self, cluster: &Cluster, members: &[&Page], findings: &mut Vec<Finding>) {
        if cluster.label.trim().is_empty() || GENERIC_LABEL_RE.is_match(&cluster.label) {
            return;
        }
        let combined = members
            .iter()
            .map(|p| p.text.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");

        let min_length = self.config.label_min_token_length.max(1);
        let lowered = cluster.label.to_lowercase();
        let mut reported: Vec<&str> = Vec::new();
        for token in LABEL_SPLIT_RE.split(&lowered) {
            if token.chars().count() < min_length || reported.contains(&token) {
                continue;
            }
            if !combined.contains(token) {
                reported.push(token);
                findings.push(finding(
                    cluster,
                    None,
                    FindingKind::UnsupportedLabelToken,
                    format!("label token '{token}' does not appear in any member page"),
                ));
            }
        }
    }

    fn check_summary(&self, cluster: &Cluster, members: &[&Page], findings: &mut Vec<Finding>) {
        let limit = self.config.summary_snippet_limit;
        let snippets = summary_snippets(members, limit);
        for snippet in &snippets {
            let Some(page) = members.iter().find(|p| p.page_id == snippet.page_id) else {
                continue;
            };
            if !page.text.contains(snippet.grounded_text()) {
                findings.push(finding(
                    cluster,
                    Some(page.page_id.as_str()),
                    FindingKind::SummaryNotInSource,
                    format!("summary line '{}' not found in page text", snippet.text),
                ));
            }
        }
        let expected = members.len().min(limit);
        if snippets.len() < expected {
            findings.push(finding(
                cluster,
                None,
                FindingKind::InsufficientSummaryCoverage,
                format!("{} of {expected} expected summary lines", snippets.len()),
            ));
        }
    }
}

fn finding(cluster: &Cluster, page_id: Option<&str>, kind: FindingKind, detail: String) -> Finding {
    Finding {
        cluster_id: cluster.cluster_id.clone(),
        page_id: page_id.map(str::to_string),
        kind,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::text_page;

    fn cluster(label: &str, ids: &[&str]) -> Cluster {
        Cluster {
            cluster_id: "cl_x".into(),
            label: label.into(),
            slug: "x".into(),
            member_page_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn kinds(report: &AuditReport, kind: FindingKind) -> Vec<&Finding> {
        report.findings.iter().filter(|f| f.kind == kind).collect()
    }

    fn long_text(words: &str) -> String {
        format!("{words} {}", "lorem ipsum dolor sit amet ".repeat(6))
    }

    #[test]
    fn unsupported_label_token_reported_once() {
        let pages = vec![
            text_page("pg_a", "https://e.com/a", &long_text("Shipping rates")),
            text_page("pg_b", "https://e.com/b", &long_text("Delivery times")),
        ];
        let report = HallucinationAuditor::new(QualityConfig::default())
            .audit(&[cluster("Billing", &["pg_a", "pg_b"])], &pages);

        let unsupported = kinds(&report, FindingKind::UnsupportedLabelToken);
        assert_eq!(unsupported.len(), 1);
        assert_eq!(unsupported[0].cluster_id, "cl_x");
        assert!(unsupported[0].detail.contains("billing"));
    }

    #[test]
    fn supported_label_tokens_pass() {
        let pages = vec![text_page("pg_a", "https://e.com/a", &long_text("Billing and invoices"))];
        let report = HallucinationAuditor::new(QualityConfig::default())
            .audit(&[cluster("Billing / Invoices", &["pg_a"])], &pages);
        assert!(kinds(&report, FindingKind::UnsupportedLabelToken).is_empty());
    }

    #[test]
    fn short_page_is_flagged_once() {
        let text = "x".repeat(50);
        let pages = vec![text_page("pg_a", "https://e.com/a", &text)];
        let config = QualityConfig {
            min_page_characters: 120,
            ..QualityConfig::default()
        };
        let report = HallucinationAuditor::new(config).audit(&[cluster("cluster-1", &["pg_a"])], &pages);

        let short = kinds(&report, FindingKind::UnderLengthPage);
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].page_id.as_deref(), Some("pg_a"));
        assert!(kinds(&report, FindingKind::UnsupportedLabelToken).is_empty());
    }

    #[test]
    fn missing_source_urls() {
        let pages = vec![text_page("pg_a", "file:///tmp/a.html", &long_text("Local"))];
        let report = HallucinationAuditor::new(QualityConfig::default())
            .audit(&[cluster("Local", &["pg_a"])], &pages);
        let missing = kinds(&report, FindingKind::MissingSourceUrl);
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].page_id.as_deref(), Some("pg_a"));
        assert_eq!(missing[1].page_id, None);

        let lenient = QualityConfig {
            require_source_url: false,
            ..QualityConfig::default()
        };
        let report = HallucinationAuditor::new(lenient).audit(&[cluster("Local", &["pg_a"])], &pages);
        assert!(kinds(&report, FindingKind::MissingSourceUrl).is_empty());
    }

    #[test]
    fn empty_cluster_and_counts() {
        let report = HallucinationAuditor::new(QualityConfig::default())
            .audit(&[cluster("Ghost", &[])], &[]);
        assert_eq!(report.inspected_clusters, 1);
        assert_eq!(report.inspected_pages, 0);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::EmptyCluster);
    }

    #[test]
    fn summary_coverage_counts_pages_without_text() {
        let pages = vec![
            text_page("pg_a", "https://e.com/a", &long_text("Alpha")),
            text_page("pg_b", "https://e.com/b", "# Heading only"),
        ];
        let report = HallucinationAuditor::new(QualityConfig::default())
            .audit(&[cluster("cluster-1", &["pg_a", "pg_b"])], &pages);
        assert_eq!(kinds(&report, FindingKind::InsufficientSummaryCoverage).len(), 1);
        assert!(kinds(&report, FindingKind::SummaryNotInSource).is_empty());
        assert_eq!(report.inspected_pages, 2);
    }
}
