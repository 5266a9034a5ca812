use std::sync::Arc;

use caddie_core::error::AppError;
use htmd::HtmlToMarkdown;
use scraper::{Html, Selector};

/// HTML-to-Markdown cleaner using htmd.
///
/// Converts raw HTML into Markdown text, stripping non-content elements
/// (script, style, nav, etc.) so stored page content stays small.
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for HtmdCleaner {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl HtmdCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }

    pub fn clean(&self, html: &str) -> Result<String, AppError> {
        self.converter
            .convert(html)
            .map_err(|e| AppError::Generic(format!("HTML conversion failed: {e}")))
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

/// Text of the document's `<title>`, whitespace-collapsed.
pub fn page_title(html: &str) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let document = Html::parse_document(html);
    let raw: String = document.select(&selector).next()?.text().collect();
    let title = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}
