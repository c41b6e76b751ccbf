//! Cluster labels and slugs.
//!
//! Preference order: a URL path prefix shared by enough members, then the top
//! TF-IDF terms of member text, then a generic `cluster-N`.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use url::Url;

use site2docs_shared::{GraphConfig, Page, Result, Site2DocsError};

const ENGLISH_STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "all", "also", "and", "any", "are", "because",
    "been", "before", "being", "below", "between", "both", "but", "can", "could", "did", "does",
    "doing", "down", "during", "each", "few", "for", "from", "further", "had", "has", "have",
    "having", "her", "here", "hers", "herself", "him", "himself", "his", "how", "into", "its",
    "itself", "just", "more", "most", "myself", "nor", "not", "now", "off", "once", "only",
    "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she", "should", "some",
    "such", "than", "that", "the", "their", "theirs", "them", "themselves", "then", "there",
    "these", "they", "this", "those", "through", "too", "under", "until", "very", "was", "were",
    "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would",
    "you", "your", "yours", "yourself", "yourselves",
];

const JAPANESE_STOP_WORDS: &[&str] = &[
    "こと", "ため", "よう", "です", "ます", "する", "いる", "ある", "なる", "この", "その", "それ",
    "そして", "また", "など", "さらに", "しかし",
];

// ---------------------------------------------------------------------------
// Labeler
// ---------------------------------------------------------------------------

/// Derives human-readable cluster labels.
#[derive(Debug, Clone)]
pub struct Labeler {
    token_re: Regex,
    stop_words: BTreeSet<String>,
    prefix_fraction: f64,
    min_token_length: usize,
    terms: usize,
}

impl Labeler {
    pub fn new(config: &GraphConfig) -> Result<Self> {
        let token_re = Regex::new(&config.label_token_pattern).map_err(|e| {
            Site2DocsError::config(format!("invalid graph.label_token_pattern: {e}"))
        })?;
        let stop_words = ENGLISH_STOP_WORDS
            .iter()
            .chain(JAPANESE_STOP_WORDS)
            .map(|w| w.to_string())
            .chain(config.label_stop_words.iter().map(|w| w.to_lowercase()))
            .collect();

        Ok(Self {
            token_re,
            stop_words,
            prefix_fraction: config.label_prefix_fraction,
            min_token_length: config.label_min_token_length,
            terms: config.label_terms.max(1),
        })
    }

    /// Label for a cluster; `ordinal` is its 1-based position in the run.
    pub fn label(&self, members: &[&Page], ordinal: usize) -> String {
        self.path_prefix_label(members)
            .or_else(|| self.tfidf_label(members))
            .unwrap_or_else(|| format!("cluster-{ordinal}"))
    }

    /// Longest directory prefix shared by at least `prefix_fraction` of members.
    /// Equal-length prefixes: higher coverage first, then lexicographic order.
    pub fn path_prefix_label(&self, members: &[&Page]) -> Option<String> {
        if members.is_empty() {
            return None;
        }
        let directories: Vec<Vec<String>> = members
            .iter()
            .map(|page| directory_segments(&page.url))
            .collect();
        let longest = directories.iter().map(Vec::len).max().unwrap_or(0);
        let needed = self.prefix_fraction * members.len() as f64;

        for length in (1..=longest).rev() {
            let mut counts: BTreeMap<&[String], usize> = BTreeMap::new();
            for dirs in directories.iter().filter(|d| d.len() >= length) {
                *counts.entry(&dirs[..length]).or_default() += 1;
            }
            let best = counts
                .into_iter()
                .filter(|(_, count)| *count as f64 + 1e-9 >= needed)
                .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| b.cmp(a)));
            if let Some((prefix, _)) = best {
                return Some(
                    prefix
                        .iter()
                        .map(|s| title_case(s))
                        .collect::<Vec<_>>()
                        .join(" / "),
                );
            }
        }
        None
    }

    /// Top TF-IDF terms over member text, joined by spaces.
    pub fn tfidf_label(&self, members: &[&Page]) -> Option<String> {
        let documents: Vec<BTreeMap<String, usize>> = members
            .iter()
            .map(|page| self.term_counts(&page.text))
            .filter(|counts| !counts.is_empty())
            .collect();
        if documents.is_empty() {
            return None;
        }

        let n = documents.len() as f64;
        let mut document_frequency: BTreeMap<&str, usize> = BTreeMap::new();
        for counts in &documents {
            for term in counts.keys() {
                *document_frequency.entry(term.as_str()).or_default() += 1;
            }
        }

        let mut scores: BTreeMap<&str, f64> = BTreeMap::new();
        for counts in &documents {
            let weights: Vec<(&str, f64)> = counts
                .iter()
                .map(|(term, tf)| {
                    let df = document_frequency[term.as_str()] as f64;
                    let idf = ((1.0 + n) / (1.0 + df)).ln() + 1.0;
                    (term.as_str(), *tf as f64 * idf)
                })
                .collect();
            let norm = weights.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
            if norm == 0.0 {
                continue;
            }
            for (term, weight) in weights {
                *scores.entry(term).or_default() += weight / norm;
            }
        }

        let mut ranked: Vec<(&str, f64)> = scores.into_iter().collect();
        ranked.sort_by(|(ta, sa), (tb, sb)| sb.total_cmp(sa).then_with(|| ta.cmp(tb)));
        let top: Vec<&str> = ranked.iter().take(self.terms).map(|(t, _)| *t).collect();
        (!top.is_empty()).then(|| top.join(" "))
    }

    fn term_counts(&self, text: &str) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for token in self.token_re.find_iter(text) {
            let token = token.as_str().to_lowercase();
            if token.chars().count() < self.min_token_length
                || token.chars().all(char::is_numeric)
                || self.stop_words.contains(&token)
            {
                continue;
            }
            *counts.entry(token).or_default() += 1;
        }
        counts
    }
}

/// Percent-decoded directory segments of an http(s) URL.
fn directory_segments(raw: &str) -> Vec<String> {
    let Ok(url) = Url::parse(raw) else {
        return Vec::new();
    };
    if !matches!(url.scheme(), "http" | "https") {
        return Vec::new();
    }
    let path = url.path();
    let mut segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(decode_segment)
        .collect();
    if !path.ends_with('/') {
        segments.pop();
    }
    segments
}

/// Invalid UTF-8 after decoding is replaced rather than rejected.
fn decode_segment(segment: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(segment.as_bytes())).into_owned()
}

fn title_case(segment: &str) -> String {
    segment
        .split(['-', '_', ' ', '+'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Slugs
// ---------------------------------------------------------------------------

/// ASCII kebab-case form of a label. Non-ASCII characters are dropped.
pub fn slugify(label: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else if ch.is_ascii() || ch.is_whitespace() {
            pending_dash = true;
        }
    }
    slug
}

/// Slug for `label`, unique among `used` (`-2`, `-3`, ... on collision).
pub fn unique_slug(label: &str, ordinal: usize, used: &mut BTreeSet<String>) -> String {
    let mut base = slugify(label);
    if base.is_empty() {
        base = format!("cluster-{ordinal}");
    }
    let mut candidate = base.clone();
    let mut suffix = 2;
    while used.contains(&candidate) {
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
    used.insert(candidate.clone());
    candidate
}
