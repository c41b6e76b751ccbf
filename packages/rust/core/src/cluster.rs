//! Cluster engine: community detection, size policy, labels and slugs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, instrument};
use url::Url;

use site2docs_shared::{Cluster, GraphConfig, Page, Result, Site2DocsError, SmallClusterPolicy};

use crate::graph::LinkGraph;
use crate::label::{Labeler, unique_slug};

/// Modularity gains at or below this are treated as zero.
const GAIN_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// ClusterEngine
// ---------------------------------------------------------------------------

/// Partitions the link graph into labelled clusters.
pub struct ClusterEngine {
    config: GraphConfig,
    labeler: Labeler,
}

impl ClusterEngine {
    pub fn new(config: GraphConfig) -> Result<Self> {
        let labeler = Labeler::new(&config)?;
        Ok(Self { config, labeler })
    }

    /// Partition every page into exactly one cluster.
    ///
    /// Clusters are ordered by their smallest member page id; members are
    /// ordered by `(url, page_id)`.
    #[instrument(skip_all, fields(pages = pages.len(), edges = graph.edges().len()))]
    pub fn cluster(&self, graph: &LinkGraph, pages: &[Page]) -> Result<Vec<Cluster>> {
        let lookup: BTreeMap<&str, &Page> = pages.iter().map(|p| (p.page_id.as_str(), p)).collect();

        let communities: Vec<Vec<String>> = greedy_modularity(&graph.undirected_adjacency())
            .into_iter()
            .map(|community| {
                community
                    .into_iter()
                    .map(|index| graph.nodes()[index].clone())
                    .collect()
            })
            .collect();
        debug!(communities = communities.len(), "community detection complete");

        let mut groups = self.split_oversized(communities, &lookup);
        if self.config.small_cluster_policy == SmallClusterPolicy::Merge {
            groups = self.merge_small(groups, &lookup);
        }

        let mut ordered: Vec<Vec<&Page>> = groups
            .into_iter()
            .filter(|g| !g.is_empty())
            .map(|group| {
                let mut members: Vec<&Page> =
                    group.iter().filter_map(|id| lookup.get(id.as_str()).copied()).collect();
                members.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.page_id.cmp(&b.page_id)));
                members
            })
            .collect();
        ordered.sort_by_key(|members| {
            members
                .iter()
                .map(|p| p.page_id.as_str())
                .min()
                .unwrap_or_default()
                .to_string()
        });

        let mut used = BTreeSet::new();
        let clusters: Vec<Cluster> = ordered
            .iter()
            .enumerate()
            .map(|(index, members)| {
                let ordinal = index + 1;
                let label = self.labeler.label(members, ordinal);
                let slug = unique_slug(&label, ordinal, &mut used);
                Cluster {
                    cluster_id: format!("cl_{slug}"),
                    label,
                    slug,
                    member_page_ids: members.iter().map(|p| p.page_id.clone()).collect(),
                }
            })
            .collect();

        info!(clusters = clusters.len(), "clustering complete");
        Ok(clusters)
    }

    /// Split communities above the size cap into URL-pattern buckets.
    fn split_oversized(
        &self,
        communities: Vec<Vec<String>>,
        lookup: &BTreeMap<&str, &Page>,
    ) -> Vec<Vec<String>> {
        let cap = self
            .config
            .max_network_cluster_size
            .max(self.config.min_cluster_size);
        let mut refined = Vec::new();
        for community in communities {
            if community.len() <= cap {
                refined.push(community);
                continue;
            }
            let before = community.len();
            let parts = self.split_by_url_pattern(community, lookup);
            debug!(size = before, parts = parts.len(), "split oversized community");
            refined.extend(parts);
        }
        refined
    }

    fn split_by_url_pattern(
        &self,
        members: Vec<String>,
        lookup: &BTreeMap<&str, &Page>,
    ) -> Vec<Vec<String>> {
        let min_size = self.config.min_cluster_size.max(1);
        for depth in (1..=self.config.url_pattern_depth.max(1)).rev() {
            let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for id in &members {
                let pattern = lookup
                    .get(id.as_str())
                    .and_then(|page| url_pattern(&page.url, depth));
                if let Some(pattern) = pattern {
                    buckets.entry(pattern).or_default().push(id.clone());
                }
            }
            if !buckets.values().any(|b| b.len() >= 2) {
                continue;
            }

            let mut groups: Vec<Vec<String>> = buckets
                .into_values()
                .filter(|bucket| bucket.len() >= min_size)
                .collect();
            if groups.is_empty() {
                continue;
            }
            let assigned: BTreeSet<&String> = groups.iter().flatten().collect();
            let remainder: Vec<String> = members
                .iter()
                .filter(|id| !assigned.contains(id))
                .cloned()
                .collect();
            if !remainder.is_empty() {
                groups.push(remainder);
            }
            return groups;
        }
        vec![members]
    }

    /// Pool undersized groups per URL host; leftovers share one catch-all group.
    fn merge_small(
        &self,
        groups: Vec<Vec<String>>,
        lookup: &BTreeMap<&str, &Page>,
    ) -> Vec<Vec<String>> {
        let threshold = self.config.min_cluster_size;
        if threshold <= 1 {
            return groups;
        }

        let (mut kept, small): (Vec<Vec<String>>, Vec<Vec<String>>) =
            groups.into_iter().partition(|g| g.len() >= threshold);
        if small.is_empty() {
            return kept;
        }

        let mut by_host: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for id in small.into_iter().flatten() {
            let host = lookup
                .get(id.as_str())
                .and_then(|page| Url::parse(&page.url).ok())
                .and_then(|url| url.host_str().map(str::to_string))
                .unwrap_or_default();
            by_host.entry(host).or_default().push(id);
        }

        let mut leftovers = Vec::new();
        for (_, members) in by_host {
            if members.len() >= threshold {
                kept.push(members);
            } else {
                leftovers.extend(members);
            }
        }
        if !leftovers.is_empty() {
            debug!(pages = leftovers.len(), "gathered leftovers into catch-all cluster");
            kept.push(leftovers);
        }
        kept
    }
}

// ---------------------------------------------------------------------------
// Community detection
// ---------------------------------------------------------------------------

/// Deterministic greedy modularity agglomeration (Clauset–Newman–Moore).
///
/// Every step merges the adjacent pair with the largest positive modularity
/// gain; ties go to the smallest `(i, j)` pair. Isolated nodes stay singletons.
pub fn greedy_modularity(adjacency: &[BTreeSet<usize>]) -> Vec<Vec<usize>> {
    let n = adjacency.len();
    let degree_sum: usize = adjacency.iter().map(BTreeSet::len).sum();
    if degree_sum == 0 {
        return (0..n).map(|i| vec![i]).collect();
    }
    let two_m = degree_sum as f64;

    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut a: Vec<f64> = adjacency.iter().map(|nb| nb.len() as f64 / two_m).collect();
    let mut e: Vec<BTreeMap<usize, f64>> = adjacency
        .iter()
        .map(|nb| nb.iter().map(|&j| (j, 1.0 / two_m)).collect())
        .collect();

    loop {
        let mut best: Option<(f64, usize, usize)> = None;
        for i in 0..n {
            for (&j, &e_ij) in e[i].range(i + 1..) {
                let gain = 2.0 * (e_ij - a[i] * a[j]);
                if gain <= GAIN_EPSILON {
                    continue;
                }
                if best.is_none_or(|(top, _, _)| gain > top + GAIN_EPSILON) {
                    best = Some((gain, i, j));
                }
            }
        }
        let Some((_, i, j)) = best else {
            break;
        };

        let merged = std::mem::take(&mut e[j]);
        for (k, e_jk) in merged {
            if k == i {
                continue;
            }
            *e[i].entry(k).or_default() += e_jk;
            e[k].remove(&j);
            *e[k].entry(i).or_default() += e_jk;
        }
        e[i].remove(&j);
        a[i] += a[j];
        a[j] = 0.0;
        let moved = std::mem::take(&mut members[j]);
        members[i].extend(moved);
    }

    members
        .into_iter()
        .filter(|m| !m.is_empty())
        .map(|mut m| {
            m.sort_unstable();
            m
        })
        .collect()
}

// ---------------------------------------------------------------------------
// URL patterns
// ---------------------------------------------------------------------------

/// `host/seg1/seg2/...` over the first `depth` normalized path segments of an http(s) URL.
pub fn url_pattern(raw: &str, depth: usize) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") || depth == 0 {
        return None;
    }
    let segments: Vec<String> = url
        .path()
        .split('/')
        .map(normalize_segment)
        .filter(|s| !s.is_empty())
        .take(depth)
        .collect();
    if segments.is_empty() {
        return None;
    }
    Some(format!("{}/{}", url.host_str().unwrap_or_default(), segments.join("/")))
}

/// Collapse ids and numbers so sibling pages share a pattern.
fn normalize_segment(segment: &str) -> String {
    static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("valid regex")
    });
    static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));
    static INVALID_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^a-z0-9{}-]+").expect("valid regex"));

    let lowered = segment.trim().to_lowercase();
    let stem = lowered.split('.').next().unwrap_or_default();
    if stem.is_empty() {
        return String::new();
    }
    if UUID_RE.is_match(stem) {
        return "{uuid}".into();
    }
    let digits = stem.chars().filter(char::is_ascii_digit).count();
    let length = stem.chars().count();
    if digits == length {
        return "{num}".into();
    }
    let stem = if digits >= 3 && digits * 2 >= length {
        DIGITS_RE.replace_all(stem, "{num}").into_owned()
    } else {
        stem.to_string()
    };
    INVALID_RE
        .replace_all(&stem, "-")
        .trim_matches('-')
        .to_string()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check that `clusters` partitions `pages`: non-empty clusters, known ids,
/// every page exactly once, unique slugs.
pub fn validate_partition(clusters: &[Cluster], pages: &[Page]) -> Result<()> {
    let known: BTreeSet<&str> = pages.iter().map(|p| p.page_id.as_str()).collect();
    let mut offending: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut slugs: BTreeSet<&str> = BTreeSet::new();

    for cluster in clusters {
        if cluster.member_page_ids.is_empty() {
            offending.entry(cluster.cluster_id.clone()).or_default();
        }
        if !slugs.insert(cluster.slug.as_str()) {
            offending
                .entry(cluster.cluster_id.clone())
                .or_default()
                .push(format!("duplicate slug {}", cluster.slug));
        }
        for id in &cluster.member_page_ids {
            if !known.contains(id.as_str()) || !seen.insert(id.as_str()) {
                offending
                    .entry(cluster.cluster_id.clone())
                    .or_default()
                    .push(id.clone());
            }
        }
    }

    let unassigned: Vec<String> = known
        .iter()
        .filter(|id| !seen.contains(*id))
        .map(|id| id.to_string())
        .collect();
    if !unassigned.is_empty() {
        offending.insert("<unassigned>".into(), unassigned);
    }

    if offending.is_empty() {
        Ok(())
    } else {
        Err(Site2DocsError::ClusterValidation { missing: offending })
    }
}
