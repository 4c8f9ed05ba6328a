//! Search-page scraping into the raw stage.
//!
//! The browser is a port: anything that can return the rendered HTML of a
//! search URL after a selector has appeared. Production runs drive a
//! headless Chrome; tests feed fixture HTML through the same path.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gigwatch_core::RawPosting;
use gigwatch_store::RawStore;
use headless_chrome::{Browser, LaunchOptions};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gigwatch-scraper";

pub const MARKETPLACE_BASE: &str = "https://www.upwork.com";

/// Selector the search page is considered "rendered" by.
pub const RESULTS_CONTAINER: &str = "section.card-list-container";

const JOB_TILE: &str = r#"article[class^="job-tile"]"#;
const POSTED_TEXT: &str = r#"small[class^="text-light"]"#;
const TYPE_LEVEL: &str = r#"li[data-test="job-type-label"]"#;
const EXPERIENCE_LEVEL: &str = r#"li[data-test="experience-level"]"#;
const IS_FIXED_PRICE: &str = r#"li[data-test="is-fixed-price"]"#;
const DURATION_LABEL: &str = r#"li[data-test="duration-label"]"#;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/113.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector '{0}'")]
    Selector(String),
    #[error("results container '{RESULTS_CONTAINER}' not present in page")]
    MissingContainer,
    #[error("job tile is missing its title element")]
    MissingTitle,
    #[error("job tile '{0}' is missing its link element")]
    MissingLink(String),
    #[error("no job id token in url '{0}'")]
    JobId(String),
}

/// The marketplace job id is the token between the last `~` in the posting
/// URL and the `/` that follows it.
pub fn job_id_from_url(url: &str) -> Result<String, ExtractError> {
    let tilde = url.rfind('~').ok_or_else(|| ExtractError::JobId(url.to_string()))?;
    let id = url[tilde + 1..]
        .split('/')
        .next()
        .unwrap_or_default()
        .trim();
    if id.is_empty() {
        return Err(ExtractError::JobId(url.to_string()));
    }
    Ok(id.to_string())
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|_| ExtractError::Selector(selector.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|node| text_or_none(node.text().collect::<String>())))
}

fn first_attr(
    scope: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|node| node.value().attr(attr))
        .and_then(|value| text_or_none(value.to_string())))
}

fn absolute_url(href: &str) -> String {
    if href.starts_with('/') {
        format!("{MARKETPLACE_BASE}{href}")
    } else {
        href.to_string()
    }
}

/// Extract one [`RawPosting`] per job tile in the rendered search page.
///
/// A missing title or link element fails the whole batch. The optional
/// sub-fields map to `None`. Duplicate ids inside one page (pagination
/// overlap) keep the first occurrence only.
pub fn extract_postings(
    html: &str,
    scraped_at: DateTime<Utc>,
) -> Result<Vec<RawPosting>, ExtractError> {
    let document = Html::parse_document(html);
    let container_sel = parse_selector(RESULTS_CONTAINER)?;
    let container = document
        .select(&container_sel)
        .next()
        .ok_or(ExtractError::MissingContainer)?;

    let tile_sel = parse_selector(JOB_TILE)?;
    let mut seen = HashSet::new();
    let mut postings = Vec::new();
    for tile in container.select(&tile_sel) {
        let title = first_text(tile, "h2")?.ok_or(ExtractError::MissingTitle)?;
        let href =
            first_attr(tile, "h2 a", "href")?.ok_or_else(|| ExtractError::MissingLink(title.clone()))?;
        let url = absolute_url(&href);
        let id = job_id_from_url(&url)?;
        if !seen.insert(id.clone()) {
            continue;
        }

        postings.push(RawPosting {
            id,
            title,
            url,
            description: first_text(tile, "p")?,
            posted_relative_text: first_text(tile, POSTED_TEXT)?,
            type_level: first_text(tile, TYPE_LEVEL)?,
            experience_level: first_text(tile, EXPERIENCE_LEVEL)?,
            is_fixed_price: tile.select(&parse_selector(IS_FIXED_PRICE)?).next().is_some(),
            duration_label: first_text(tile, DURATION_LABEL)?,
            scraped_at,
        });
    }
    Ok(postings)
}

/// Anything that can load a search URL and hand back its rendered HTML once
/// `wait_selector` has appeared.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn fetch_rendered(&self, url: &str, wait_selector: &str) -> anyhow::Result<String>;
}

/// Headless Chrome implementation of [`BrowserPage`]. The browser process
/// lives for the duration of a single call; the synchronous devtools client
/// runs on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessBrowser;

#[async_trait]
impl BrowserPage for HeadlessBrowser {
    async fn fetch_rendered(&self, url: &str, wait_selector: &str) -> anyhow::Result<String> {
        let url = url.to_string();
        let wait_selector = wait_selector.to_string();
        tokio::task::spawn_blocking(move || fetch_rendered_blocking(&url, &wait_selector))
            .await
            .context("joining browser task")?
    }
}

fn fetch_rendered_blocking(url: &str, wait_selector: &str) -> anyhow::Result<String> {
    let options = LaunchOptions {
        headless: true,
        sandbox: false,
        idle_browser_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let browser = Browser::new(options).context("launching headless chrome")?;
    let tab = browser.new_tab().context("opening tab")?;
    tab.set_user_agent(USER_AGENT, Some("en-US"), None)
        .context("setting user agent")?;
    tab.navigate_to(url).with_context(|| format!("navigating to {url}"))?;
    tab.wait_for_element(wait_selector)
        .with_context(|| format!("waiting for '{wait_selector}' on {url}"))?;
    let html = tab.get_content().context("reading rendered page content")?;
    Ok(html)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeSummary {
    /// Tiles extracted from the page.
    pub found: usize,
    /// Ids already present in the raw store.
    pub known: usize,
    /// New rows appended.
    pub appended: usize,
}

/// Load one search URL, extract its postings, drop ids already present in
/// the raw store and append the rest as a single batch.
pub async fn scrape_into_raw(
    browser: &dyn BrowserPage,
    query_url: &str,
    raw: &RawStore,
) -> anyhow::Result<ScrapeSummary> {
    info!(url = query_url, "scraping search page");
    let html = browser.fetch_rendered(query_url, RESULTS_CONTAINER).await?;
    let postings = extract_postings(&html, Utc::now())?;
    let found = postings.len();

    let known_ids = raw.distinct_ids()?;
    let fresh: Vec<RawPosting> = postings
        .into_iter()
        .filter(|posting| !known_ids.contains(&posting.id))
        .collect();
    let appended = fresh.len();
    if fresh.is_empty() {
        warn!(url = query_url, found, "no new postings");
    } else {
        raw.append(&fresh)?;
        info!(url = query_url, found, appended, "appended new postings");
    }

    Ok(ScrapeSummary {
        found,
        known: known_ids.len(),
        appended,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SEARCH_PAGE: &str = r#"
    <html><body>
      <section class="card-list-container">
        <article class="job-tile cursor-pointer">
          <small class="text-light mb-1">Posted 2 days ago</small>
          <h2 class="job-tile-title"><a href="/jobs/Build-scraper_~021234567890abcdef/">Build a price scraper</a></h2>
          <p>Scrape product prices into a dashboard.</p>
          <ul>
            <li data-test="job-type-label">Hourly: $30-$60</li>
            <li data-test="experience-level">Expert</li>
            <li data-test="duration-label">1 to 3 months</li>
          </ul>
        </article>
        <article class="job-tile cursor-pointer">
          <small class="text-light mb-1">Posted yesterday</small>
          <h2 class="job-tile-title"><a href="/jobs/Dashboards_~03fedcba9876543210/">Analytics dashboards</a></h2>
          <ul>
            <li data-test="is-fixed-price">Fixed price</li>
          </ul>
        </article>
        <article class="job-tile cursor-pointer">
          <small class="text-light mb-1">Posted 2 days ago</small>
          <h2 class="job-tile-title"><a href="/jobs/Build-scraper_~021234567890abcdef/">Build a price scraper</a></h2>
          <p>Duplicate tile from pagination overlap.</p>
        </article>
      </section>
    </body></html>
    "#;

    const PAGE_MISSING_LINK: &str = r#"
    <html><body>
      <section class="card-list-container">
        <article class="job-tile cursor-pointer">
          <h2 class="job-tile-title">No anchor here</h2>
        </article>
      </section>
    </body></html>
    "#;

    struct FixtureBrowser(&'static str);

    #[async_trait]
    impl BrowserPage for FixtureBrowser {
        async fn fetch_rendered(&self, _url: &str, _wait: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn extracts_job_id_from_posting_url() {
        assert_eq!(
            job_id_from_url("/jobs/~021234567890abcdef/apply").unwrap(),
            "021234567890abcdef"
        );
        assert_eq!(
            job_id_from_url("https://www.upwork.com/jobs/Title_~03aa/").unwrap(),
            "03aa"
        );
        assert!(matches!(job_id_from_url("/jobs/no-tilde/"), Err(ExtractError::JobId(_))));
        assert!(matches!(job_id_from_url("/jobs/~/apply"), Err(ExtractError::JobId(_))));
    }

    #[test]
    fn extracts_postings_and_drops_in_batch_duplicates() {
        let scraped_at = Utc::now();
        let postings = extract_postings(SEARCH_PAGE, scraped_at).unwrap();
        assert_eq!(postings.len(), 2);

        let scraper_job = &postings[0];
        assert_eq!(scraper_job.id, "021234567890abcdef");
        assert_eq!(scraper_job.title, "Build a price scraper");
        assert_eq!(
            scraper_job.url,
            "https://www.upwork.com/jobs/Build-scraper_~021234567890abcdef/"
        );
        assert_eq!(
            scraper_job.description.as_deref(),
            Some("Scrape product prices into a dashboard.")
        );
        assert_eq!(scraper_job.posted_relative_text.as_deref(), Some("Posted 2 days ago"));
        assert_eq!(scraper_job.type_level.as_deref(), Some("Hourly: $30-$60"));
        assert_eq!(scraper_job.experience_level.as_deref(), Some("Expert"));
        assert!(!scraper_job.is_fixed_price);
        assert_eq!(scraper_job.duration_label.as_deref(), Some("1 to 3 months"));
        assert_eq!(scraper_job.scraped_at, scraped_at);

        let dashboards = &postings[1];
        assert_eq!(dashboards.id, "03fedcba9876543210");
        assert_eq!(dashboards.description, None);
        assert!(dashboards.is_fixed_price);
        assert_eq!(dashboards.experience_level, None);
    }

    #[test]
    fn missing_link_fails_the_batch() {
        let err = extract_postings(PAGE_MISSING_LINK, Utc::now()).unwrap_err();
        assert!(matches!(err, ExtractError::MissingLink(_)));
    }

    #[test]
    fn page_without_container_fails() {
        let err = extract_postings("<html><body></body></html>", Utc::now()).unwrap_err();
        assert!(matches!(err, ExtractError::MissingContainer));
    }

    #[tokio::test]
    async fn rescraping_an_unchanged_page_appends_nothing() {
        let dir = tempdir().unwrap();
        let raw = RawStore::new(dir.path().join("raw"));
        let browser = FixtureBrowser(SEARCH_PAGE);

        let first = scrape_into_raw(&browser, "https://www.upwork.com/nx/search/jobs/?q=x", &raw)
            .await
            .unwrap();
        assert_eq!(first.found, 2);
        assert_eq!(first.appended, 2);

        let second = scrape_into_raw(&browser, "https://www.upwork.com/nx/search/jobs/?q=x", &raw)
            .await
            .unwrap();
        assert_eq!(second.found, 2);
        assert_eq!(second.known, 2);
        assert_eq!(second.appended, 0);
        assert_eq!(raw.distinct_ids().unwrap().len(), 2);
    }
}
