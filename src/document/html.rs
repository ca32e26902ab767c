//! HTML documents: extraction with `scraper`, rewriting with `lol_html`.

use std::cell::Cell;
use std::path::Path;

use lol_html::{HtmlRewriter, Settings, element};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use super::{Document, DocumentLoader, ParseError};
use crate::urls::{LinkMap, resolve_link};

/// Elements carrying navigable or embedded resources, and the attribute holding the URL.
const LINK_ATTRIBUTES: [(&str, &str); 9] = [
    ("a[href]", "href"),
    ("area[href]", "href"),
    ("link[href]", "href"),
    ("img[src]", "src"),
    ("script[src]", "src"),
    ("iframe[src]", "src"),
    ("frame[src]", "src"),
    ("embed[src]", "src"),
    ("source[src]", "src"),
];

/// Loads files as [`HtmlDocument`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlLoader;

impl DocumentLoader for HtmlLoader {
    fn load(&self, url: &str, path: &Path) -> Result<Box<dyn Document>, ParseError> {
        let bytes = std::fs::read(path).map_err(|e| ParseError::read(path, e))?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Box::new(HtmlDocument::parse(url, html)?))
    }
}

/// An HTML page held as text.
#[derive(Debug, Clone)]
pub struct HtmlDocument {
    url: String,
    base: Url,
    html: String,
}

impl HtmlDocument {
    /// Wraps `html` fetched from `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidBaseUrl`] when `url` does not parse.
    pub fn parse(url: &str, html: String) -> Result<Self, ParseError> {
        let base = Url::parse(url).map_err(|_| ParseError::InvalidBaseUrl {
            url: url.to_string(),
        })?;
        Ok(Self {
            url: url.to_string(),
            base,
            html,
        })
    }

    #[must_use]
    pub fn html(&self) -> &str {
        &self.html
    }
}

impl Document for HtmlDocument {
    fn url(&self) -> &str {
        &self.url
    }

    fn title(&self) -> Option<String> {
        let document = Html::parse_document(&self.html);
        let selector = Selector::parse("title").ok()?;
        document
            .select(&selector)
            .next()
            .map(|title| title.text().collect::<String>().trim().to_string())
            .filter(|title| !title.is_empty())
    }

    fn extract_links(&self) -> LinkMap {
        let document = Html::parse_document(&self.html);
        let mut links = LinkMap::new();
        for (selector, attribute) in LINK_ATTRIBUTES {
            let Ok(selector) = Selector::parse(selector) else {
                continue;
            };
            for element in document.select(&selector) {
                let Some(url) = element
                    .value()
                    .attr(attribute)
                    .and_then(|href| resolve_link(&self.base, href))
                else {
                    continue;
                };
                links.insert(url, suggested_name(&element));
            }
        }
        debug!(url = %self.url, links = links.len(), "extracted links");
        links
    }

    fn rewrite_links(&mut self, links: &LinkMap) -> Result<bool, ParseError> {
        let rewritten = Cell::new(0_usize);
        let base = &self.base;
        let mut output = Vec::with_capacity(self.html.len());

        let handlers = LINK_ATTRIBUTES
            .iter()
            .map(|&(selector, attribute)| {
                let rewritten = &rewritten;
                element!(selector, move |el| {
                    let Some(href) = el.get_attribute(attribute) else {
                        return Ok(());
                    };
                    let Some(target) = resolve_link(base, &href).and_then(|url| links.get(&url))
                    else {
                        return Ok(());
                    };
                    let replacement = match href.split_once('#') {
                        Some((_, fragment)) if !fragment.is_empty() => {
                            format!("{target}#{fragment}")
                        }
                        _ => target.to_string(),
                    };
                    if replacement != href {
                        el.set_attribute(attribute, &replacement)?;
                        rewritten.set(rewritten.get() + 1);
                    }
                    Ok(())
                })
            })
            .collect();

        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: handlers,
                ..Settings::default()
            },
            |chunk: &[u8]| output.extend_from_slice(chunk),
        );
        rewriter
            .write(self.html.as_bytes())
            .map_err(|e| ParseError::rewrite(&self.url, e))?;
        rewriter
            .end()
            .map_err(|e| ParseError::rewrite(&self.url, e))?;

        let count = rewritten.get();
        debug!(url = %self.url, rewritten = count, "rewrote links");
        if count == 0 {
            return Ok(false);
        }
        self.html = String::from_utf8_lossy(&output).into_owned();
        Ok(true)
    }

    fn save(&self, path: &Path) -> Result<(), ParseError> {
        std::fs::write(path, self.html.as_bytes()).map_err(|e| ParseError::write(path, e))
    }
}

/// First non-empty text line of the element, else its `alt` or `title`.
fn suggested_name(element: &ElementRef<'_>) -> String {
    let text: String = element.text().collect();
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .or_else(|| {
            ["alt", "title"]
                .iter()
                .find_map(|attribute| element.value().attr(attribute))
                .map(|value| value.trim().to_string())
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<html><head><title> Index </title>
        <link rel="stylesheet" href="/style.css">
        </head><body>
        <a href="docs/guide">
            User Guide
            (PDF)
        </a>
        <a href="HTTP://EXAMPLE.COM/docs/guide">duplicate</a>
        <a href="#top">top</a>
        <a href="mailto:someone@example.com">mail</a>
        <img src="/img/logo.png" alt="Logo">
        <a href="https://other.org/page#part">other</a>
        </body></html>"##;

    fn page() -> HtmlDocument {
        HtmlDocument::parse("http://example.com/index", PAGE.to_string()).unwrap()
    }

    #[test]
    fn test_title_is_trimmed() {
        assert_eq!(page().title().as_deref(), Some("Index"));
    }

    #[test]
    fn test_extract_links_resolves_and_deduplicates() {
        let links = page().extract_links();

        assert_eq!(links.len(), 4);
        assert_eq!(links.get("http://example.com/docs/guide"), Some("User Guide"));
        assert_eq!(links.get("http://example.com/img/logo.png"), Some("Logo"));
        assert_eq!(links.get("http://example.com/style.css"), Some(""));
        assert!(links.contains("https://other.org/page"));
    }

    #[test]
    fn test_rewrite_links_substitutes_mapped_urls_and_keeps_fragments() {
        let mut document = page();
        let mut map = LinkMap::new();
        map.insert("http://example.com/docs/guide", "../files/guide.pdf");
        map.insert("https://other.org/page", "other.html");

        assert!(document.rewrite_links(&map).unwrap());

        let html = document.html();
        assert!(html.contains(r#"href="../files/guide.pdf""#));
        assert!(html.contains(r#"href="other.html#part""#));
        assert!(html.contains(r#"src="/img/logo.png""#));
        assert!(html.contains(r##"href="#top""##));
    }

    #[test]
    fn test_rewrite_links_without_matches_reports_no_change() {
        let mut document = page();
        let mut map = LinkMap::new();
        map.insert("http://example.com/unrelated", "x.html");

        assert!(!document.rewrite_links(&map).unwrap());
        assert_eq!(document.html(), PAGE);
    }

    #[test]
    fn test_loader_reads_and_saves() {
        let temp = tempfile::TempDir::new().unwrap();
        let source = temp.path().join("index.html");
        std::fs::write(&source, PAGE).unwrap();

        let document = HtmlLoader.load("http://example.com/index", &source).unwrap();
        assert_eq!(document.url(), "http://example.com/index");

        let copy = temp.path().join("copy.html");
        document.save(&copy).unwrap();
        assert_eq!(std::fs::read_to_string(copy).unwrap(), PAGE);
    }

    #[test]
    fn test_loader_rejects_missing_file() {
        let err = HtmlLoader
            .load("http://example.com/x", Path::new("/nonexistent/x.html"))
            .err()
            .unwrap();
        assert!(matches!(err, ParseError::Read { .. }));
    }
}
