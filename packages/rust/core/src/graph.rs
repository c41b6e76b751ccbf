//! Link graph over extracted pages.
//!
//! Nodes are page ids in sorted order; an edge `(a, b)` exists when page `a`
//! links to a URL whose join key belongs to page `b`. Construction only reads
//! sorted inputs, so the node and edge sets are identical across runs.

use std::collections::{BTreeMap, BTreeSet};

use url::Url;

use site2docs_shared::Page;

/// Per-page link statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Every outbound link on the page.
    pub outbound: usize,
    /// Distinct other pages this page links to; equals its out-degree.
    pub internal: usize,
    /// Links that resolve to no known page.
    pub unresolved: usize,
}

/// Directed link graph. No duplicate edges, no self-loops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkGraph {
    nodes: Vec<String>,
    edges: BTreeSet<(String, String)>,
    stats: BTreeMap<String, LinkStats>,
}

impl LinkGraph {
    /// Build the graph from the full page set.
    pub fn build(pages: &[Page]) -> Self {
        let mut sorted: Vec<&Page> = pages.iter().collect();
        sorted.sort_by(|a, b| a.page_id.cmp(&b.page_id));

        // Smallest page id owns a shared join key.
        let mut owners: BTreeMap<String, &str> = BTreeMap::new();
        for page in &sorted {
            owners
                .entry(join_key(&page.url))
                .or_insert(page.page_id.as_str());
        }

        let mut edges = BTreeSet::new();
        let mut stats = BTreeMap::new();
        for page in &sorted {
            let mut targets: BTreeSet<&str> = BTreeSet::new();
            let mut unresolved = 0;
            for link in &page.outbound_links {
                match owners.get(&join_key(link)) {
                    Some(&target) if target == page.page_id => {}
                    Some(&target) => {
                        if targets.insert(target) {
                            edges.insert((page.page_id.clone(), target.to_string()));
                        }
                    }
                    None => unresolved += 1,
                }
            }
            stats.insert(
                page.page_id.clone(),
                LinkStats {
                    outbound: page.outbound_links.len(),
                    internal: targets.len(),
                    unresolved,
                },
            );
        }

        Self {
            nodes: sorted.iter().map(|p| p.page_id.clone()).collect(),
            edges,
            stats,
        }
    }

    /// Page ids, sorted.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &BTreeSet<(String, String)> {
        &self.edges
    }

    pub fn link_stats(&self, page_id: &str) -> Option<LinkStats> {
        self.stats.get(page_id).copied()
    }

    /// Position of `page_id` in [`LinkGraph::nodes`].
    pub fn index_of(&self, page_id: &str) -> Option<usize> {
        self.nodes.binary_search_by(|n| n.as_str().cmp(page_id)).ok()
    }

    /// Undirected projection as neighbour sets indexed by node position.
    pub fn undirected_adjacency(&self) -> Vec<BTreeSet<usize>> {
        let mut adjacency = vec![BTreeSet::new(); self.nodes.len()];
        for (source, target) in &self.edges {
            if let (Some(a), Some(b)) = (self.index_of(source), self.index_of(target)) {
                adjacency[a].insert(b);
                adjacency[b].insert(a);
            }
        }
        adjacency
    }
}

/// Normalized form of a URL used to join links to pages.
///
/// Drops the fragment, lower-cases the host, removes a trailing `index.html` /
/// `index.htm`, and removes a trailing slash except on the root path.
pub fn join_key(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return raw.trim().split('#').next().unwrap_or_default().to_string();
    };
    url.set_fragment(None);

    let mut path = url.path().to_string();
    let lowered = path.to_ascii_lowercase();
    for index in ["index.html", "index.htm"] {
        if lowered.ends_with(&format!("/{index}")) {
            path.truncate(path.len() - index.len());
            break;
        }
    }
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    url.set_path(&path);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::page;

    #[test]
    fn join_key_normalization() {
        assert_eq!(join_key("https://Example.com/support/"), "https://example.com/support");
        assert_eq!(
            join_key("https://example.com/support/index.html#top"),
            "https://example.com/support"
        );
        assert_eq!(join_key("https://example.com/index.htm"), "https://example.com/");
        assert_eq!(join_key("https://example.com"), "https://example.com/");
        assert_eq!(
            join_key("https://example.com/a/?q=1"),
            "https://example.com/a?q=1"
        );
    }

    #[test]
    fn edges_resolve_through_join_keys() {
        let pages = vec![
            page("pg_b", "https://example.com/support/faq.html", &[
                "https://example.com/support/",
                "https://elsewhere.org/",
            ]),
            page("pg_a", "https://example.com/support/index.html", &[
                "https://example.com/support/faq.html",
                "https://example.com/support/faq.html#billing",
                "https://example.com/support/index.html",
            ]),
        ];
        let graph = LinkGraph::build(&pages);

        assert_eq!(graph.nodes(), &["pg_a".to_string(), "pg_b".to_string()]);
        let edges: Vec<(&str, &str)> = graph
            .edges()
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .collect();
        assert_eq!(edges, vec![("pg_a", "pg_b"), ("pg_b", "pg_a")]);

        assert_eq!(
            graph.link_stats("pg_b"),
            Some(LinkStats { outbound: 2, internal: 1, unresolved: 1 })
        );
        // Fragment variants collapse to one target; the self-link through
        // index.html is neither internal nor unresolved.
        assert_eq!(
            graph.link_stats("pg_a"),
            Some(LinkStats { outbound: 3, internal: 1, unresolved: 0 })
        );
    }

    #[test]
    fn duplicate_join_key_goes_to_smallest_page_id() {
        let pages = vec![
            page("pg_2", "https://example.com/docs/", &[]),
            page("pg_1", "https://example.com/docs/index.html", &[]),
            page("pg_3", "https://example.com/other", &["https://example.com/docs"]),
        ];
        let graph = LinkGraph::build(&pages);
        assert!(graph.edges().contains(&("pg_3".to_string(), "pg_1".to_string())));
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn build_is_order_independent() {
        let a = page("pg_a", "https://example.com/a", &["https://example.com/b"]);
        let b = page("pg_b", "https://example.com/b", &["https://example.com/a"]);
        let forward = LinkGraph::build(&[a.clone(), b.clone()]);
        let reverse = LinkGraph::build(&[b, a]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn undirected_projection_is_symmetric() {
        let pages = vec![
            page("pg_a", "https://example.com/a", &["https://example.com/b"]),
            page("pg_b", "https://example.com/b", &[]),
            page("pg_c", "https://example.com/c", &[]),
        ];
        let adjacency = LinkGraph::build(&pages).undirected_adjacency();
        assert!(adjacency[0].contains(&1));
        assert!(adjacency[1].contains(&0));
        assert!(adjacency[2].is_empty());
    }
}
