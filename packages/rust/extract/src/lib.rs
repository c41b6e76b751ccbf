//! Page extraction: rendered markup → [`Page`].
//!
//! Recovers the canonical URL, title, readable Markdown text, headings and
//! outbound links from a rendered snapshot.

pub mod canonical;
mod cleanup;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument, warn};
use url::Url;

use site2docs_shared::{ExtractConfig, Heading, Page, RenderedPage, Result, Site2DocsError};

/// Elements dropped before Markdown conversion.
const CHROME_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "noscript", "svg", "iframe",
];

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").expect("valid selector"));
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static HEADINGS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").expect("valid selector"));
static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").expect("valid selector"));
static ANCHORS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

// ---------------------------------------------------------------------------
// ContentExtractor
// ---------------------------------------------------------------------------

/// Turns rendered markup into [`Page`] records.
pub struct ContentExtractor {
    config: ExtractConfig,
    content_selectors: Vec<Selector>,
    converter: htmd::HtmlToMarkdown,
}

impl ContentExtractor {
    /// Build an extractor; fails on an invalid content selector.
    pub fn new(config: ExtractConfig) -> Result<Self> {
        let content_selectors = config
            .content_selectors
            .iter()
            .map(|s| {
                Selector::parse(s)
                    .map_err(|e| Site2DocsError::config(format!("invalid content selector {s:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(CHROME_TAGS.to_vec())
            .build();

        Ok(Self {
            config,
            content_selectors,
            converter,
        })
    }

    /// Extract one page. `run_started` stands in for the capture time when the
    /// snapshot has no modification time.
    #[instrument(skip_all, fields(file = %rendered.snapshot.relative_path))]
    pub fn extract(&self, rendered: &RenderedPage, run_started: DateTime<Utc>) -> Result<Page> {
        let snapshot = &rendered.snapshot;
        let (Some(markup), Some(render_mode)) = (rendered.outcome.markup(), rendered.outcome.mode())
        else {
            return Err(Site2DocsError::extraction(format!(
                "{} has no rendered markup",
                snapshot.relative_path
            )));
        };

        let doc = Html::parse_document(markup);
        let url = canonical::canonical_url(
            &doc,
            &snapshot.relative_path,
            rendered.final_url.as_deref(),
            &snapshot.path,
        );
        let base = Url::parse(&url).ok();

        let content = self.content_root(&doc);
        let text = self.readable_text(content, base.as_ref());
        let headings = if self.config.preserve_headings {
            headings(content)
        } else {
            Vec::new()
        };

        let page = Page {
            page_id: snapshot.page_id.clone(),
            title: title(&doc),
            outbound_links: outbound_links(&doc, base.as_ref()),
            url,
            file_path: snapshot.relative_path.clone(),
            text,
            headings,
            captured_at: snapshot.modified.unwrap_or(run_started),
            render_mode,
        };

        debug!(
            url = %page.url,
            chars = page.text.chars().count(),
            links = page.outbound_links.len(),
            "extracted page"
        );
        Ok(page)
    }

    /// First configured container with enough text, else `<body>`.
    fn content_root<'a>(&self, doc: &'a Html) -> ElementRef<'a> {
        for selector in &self.content_selectors {
            if let Some(el) = doc.select(selector).next() {
                if plain_text(el).chars().count() >= self.config.min_content_characters {
                    return el;
                }
            }
        }
        doc.select(&BODY)
            .next()
            .unwrap_or_else(|| doc.root_element())
    }

    fn readable_text(&self, root: ElementRef<'_>, base: Option<&Url>) -> String {
        match self.converter.convert(&root.inner_html()) {
            Ok(md) => cleanup::run_pipeline(&md, base),
            Err(e) => {
                warn!(error = %e, "markdown conversion failed, using plain text");
                plain_text(root)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `<title>`, else the first `<h1>`, else empty.
fn title(doc: &Html) -> String {
    doc.select(&TITLE)
        .next()
        .map(collapse_text)
        .filter(|t| !t.is_empty())
        .or_else(|| doc.select(&H1).next().map(collapse_text))
        .unwrap_or_default()
}

fn headings(root: ElementRef<'_>) -> Vec<Heading> {
    root.select(&HEADINGS)
        .filter_map(|el| {
            let level = el.value().name().strip_prefix('h')?.parse::<u8>().ok()?;
            let text = collapse_text(el);
            (!text.is_empty()).then_some(Heading { level, text })
        })
        .collect()
}

/// Every `a[href]` resolved against the canonical URL, fragments stripped, self-links removed.
fn outbound_links(doc: &Html, base: Option<&Url>) -> BTreeSet<String> {
    let Some(base) = base else {
        return BTreeSet::new();
    };
    let mut own = base.clone();
    own.set_fragment(None);

    doc.select(&ANCHORS)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| {
            !href.is_empty()
                && !href.starts_with('#')
                && !["javascript:", "mailto:", "tel:"]
                    .iter()
                    .any(|scheme| href.to_ascii_lowercase().starts_with(scheme))
        })
        .filter_map(|href| base.join(href).ok())
        .filter_map(|mut target| {
            target.set_fragment(None);
            (target != own).then(|| target.to_string())
        })
        .collect()
}

/// Plain text of an element, one line per text run, blank runs removed.
fn plain_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
