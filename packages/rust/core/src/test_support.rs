//! Builders shared by unit tests.

use chrono::{DateTime, TimeZone, Utc};

use site2docs_shared::{Page, RenderMode};

pub(crate) fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A page with no text; `links` become its outbound links.
pub(crate) fn page(id: &str, url: &str, links: &[&str]) -> Page {
    Page {
        page_id: id.to_string(),
        url: url.to_string(),
        file_path: format!("{id}.html"),
        title: id.to_string(),
        text: String::new(),
        headings: Vec::new(),
        outbound_links: links.iter().map(|l| l.to_string()).collect(),
        captured_at: fixed_time(),
        render_mode: RenderMode::Rendered,
    }
}

/// A page with text and no links.
pub(crate) fn text_page(id: &str, url: &str, text: &str) -> Page {
    Page {
        text: text.to_string(),
        ..page(id, url, &[])
    }
}
