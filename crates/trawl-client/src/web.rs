//! Generic web page extractor.
//!
//! Items come from `<article>` elements when the page has them. Pages without
//! articles (link lists, index pages) yield one item per headed link instead.

use std::collections::HashSet;

use futures::FutureExt;
use futures::future::BoxFuture;
use scraper::{ElementRef, Html, Selector};
use trawl_core::error::AppError;
use trawl_core::job::ScrapedItem;
use trawl_core::traits::Extractor;
use url::Url;

use crate::http::{HttpFetcher, parse_target};

const MAX_CONTENT_CHARS: usize = 4_000;

/// Harvests articles or headed links from an HTML page.
#[derive(Clone)]
pub struct WebExtractor {
    fetcher: HttpFetcher,
}

impl WebExtractor {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    async fn run(&self, target: &str, limit: u32) -> Result<Vec<ScrapedItem>, AppError> {
        let url = parse_target(target)?;
        let html = self.fetcher.get_text(&url).await?;
        let items = parse_items(&html, &url, limit as usize);
        tracing::debug!(url = %url, items = items.len(), "Parsed web page");
        Ok(items)
    }
}

impl Extractor for WebExtractor {
    fn extract<'a>(
        &'a self,
        target: &'a str,
        limit: u32,
    ) -> BoxFuture<'a, Result<Vec<ScrapedItem>, AppError>> {
        self.run(target, limit).boxed()
    }
}

/// Extract up to `limit` items from `html`, resolving links against `base`.
pub fn parse_items(html: &str, base: &Url, limit: usize) -> Vec<ScrapedItem> {
    let document = Html::parse_document(html);
    let articles = from_articles(&document, base, limit);
    if !articles.is_empty() {
        return articles;
    }
    from_headed_links(&document, base, limit)
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css)
        .inspect_err(|e| tracing::error!(css, error = %e, "Invalid selector"))
        .ok()
}

fn from_articles(document: &Html, base: &Url, limit: usize) -> Vec<ScrapedItem> {
    let (Some(article_sel), Some(heading_sel), Some(link_sel), Some(author_sel)) = (
        selector("article"),
        selector("h1, h2, h3"),
        selector("a[href]"),
        selector("[rel='author'], .author, .byline"),
    ) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for (index, article) in document.select(&article_sel).enumerate() {
        if items.len() >= limit {
            break;
        }
        let content = truncate(&element_text(article), MAX_CONTENT_CHARS);
        if content.is_empty() {
            continue;
        }

        let heading = article.select(&heading_sel).next();
        let link = heading
            .and_then(|h| h.select(&link_sel).next())
            .or_else(|| article.select(&link_sel).next())
            .and_then(|a| resolve(base, a.value().attr("href")?));

        let id = link
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| format!("{base}#article-{index}"));
        let mut item = ScrapedItem::new(id, content);
        if let Some(title) = heading.map(element_text).filter(|t| !t.is_empty()) {
            item = item.with_title(title);
        }
        if let Some(link) = link {
            item = item.with_url(link.to_string());
        }
        if let Some(author) = article
            .select(&author_sel)
            .next()
            .map(element_text)
            .filter(|a| !a.is_empty())
        {
            item = item.with_author(author);
        }
        items.push(item);
    }
    items
}

fn from_headed_links(document: &Html, base: &Url, limit: usize) -> Vec<ScrapedItem> {
    let Some(link_sel) = selector("h1 a[href], h2 a[href], h3 a[href]") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();

    document
        .select(&link_sel)
        .filter_map(|a| {
            let url = resolve(base, a.value().attr("href")?)?;
            let title = element_text(a);
            if title.is_empty() || !seen.insert(url.clone()) {
                return None;
            }
            Some(
                ScrapedItem::new(url.to_string(), title.clone())
                    .with_title(title)
                    .with_url(url.to_string()),
            )
        })
        .take(limit)
        .collect()
}

fn resolve(base: &Url, href: &str) -> Option<Url> {
    let url = base.join(href.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Visible text with whitespace collapsed.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://blog.example.com/posts/").unwrap()
    }

    const ARTICLES: &str = r#"
        <html><body>
          <nav><a href="/">Home</a></nav>
          <article>
            <h2><a href="first-post">First   post</a></h2>
            <span class="author">Ada</span>
            <p>Hello
               world.</p>
          </article>
          <article>
            <h2>Second post</h2>
            <p>No link here.</p>
          </article>
          <article>   </article>
          <article><h2><a href="https://other.example/third">Third</a></h2><p>More.</p></article>
        </body></html>
    "#;

    #[test]
    fn articles_become_items() {
        let items = parse_items(ARTICLES, &base(), 10);
        assert_eq!(items.len(), 3);

        let first = &items[0];
        assert_eq!(first.title.as_deref(), Some("First post"));
        assert_eq!(
            first.url.as_deref(),
            Some("https://blog.example.com/posts/first-post")
        );
        assert_eq!(first.author.as_deref(), Some("Ada"));
        assert!(first.content.contains("Hello world."));

        assert!(items[1].url.is_none());
        assert!(items[1].id.ends_with("#article-1"));
    }

    #[test]
    fn limit_caps_items() {
        let items = parse_items(ARTICLES, &base(), 2);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn headed_links_are_the_fallback() {
        let html = r#"
            <h1><a href="/a">Alpha</a></h1>
            <h2><a href="/b">Beta</a></h2>
            <h2><a href="/a">Alpha again</a></h2>
            <h3><a href="mailto:x@example.com">Mail</a></h3>
            <p><a href="/c">Not headed</a></p>
        "#;
        let items = parse_items(html, &base(), 10);
        let urls: Vec<_> = items.iter().filter_map(|i| i.url.as_deref()).collect();
        assert_eq!(
            urls,
            vec!["https://blog.example.com/a", "https://blog.example.com/b"]
        );
    }

    #[test]
    fn empty_page_yields_nothing() {
        assert!(parse_items("<html></html>", &base(), 5).is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[tokio::test]
    async fn invalid_target_is_rejected_before_fetching() {
        let extractor = WebExtractor::new(HttpFetcher::new().unwrap());
        let err = extractor.extract("not a url", 5).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }
}
