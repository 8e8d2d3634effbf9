use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use regex::Regex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::classifier::{category_from_hint, Classifier};
use crate::db::{Database, NewArticle, Source};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// One item pulled from an upstream source, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedItem {
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub score: i64,
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub saved: usize,
    pub skipped: usize,
    pub uncategorized: usize,
    pub total_fetched: usize,
    pub hint_categorized: usize,
    pub model_categorized: usize,
    pub source_stats: BTreeMap<String, usize>,
    pub started_at: String,
    pub finished_at: String,
}

pub struct Fetcher {
    client: Client,
    db: Arc<Database>,
    classifier: Option<Arc<dyn Classifier>>,
    refreshing: Arc<RwLock<bool>>,
    last_report: RwLock<Option<RefreshReport>>,
}

impl Fetcher {
    pub fn new(db: Arc<Database>, classifier: Option<Arc<dyn Classifier>>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            db,
            classifier,
            refreshing: Arc::new(RwLock::new(false)),
            last_report: RwLock::new(None),
        })
    }

    pub async fn is_refreshing(&self) -> bool {
        *self.refreshing.read().await
    }

    pub async fn last_report(&self) -> Option<RefreshReport> {
        self.last_report.read().await.clone()
    }

    /// Run one fetch → classify → store cycle over every source.
    ///
    /// Returns `Ok(None)` without doing anything if another cycle is in flight.
    pub async fn refresh_all(&self) -> anyhow::Result<Option<RefreshReport>> {
        if !self.try_begin_refresh().await {
            info!("Refresh already in progress, skipping");
            return Ok(None);
        }

        self.run_claimed_refresh().await.map(Some)
    }

    /// Claim the refresh flag. Returns `false` if a cycle already holds it.
    ///
    /// A successful claim must be followed by [`Fetcher::run_claimed_refresh`],
    /// which releases the flag when the cycle ends.
    pub async fn try_begin_refresh(&self) -> bool {
        let mut refreshing = self.refreshing.write().await;
        if *refreshing {
            return false;
        }
        *refreshing = true;
        true
    }

    /// Run a cycle whose flag was claimed by [`Fetcher::try_begin_refresh`].
    pub async fn run_claimed_refresh(&self) -> anyhow::Result<RefreshReport> {
        let result = self.do_refresh_all().await;

        // Clear refreshing flag
        {
            let mut refreshing = self.refreshing.write().await;
            *refreshing = false;
        }

        let report = result?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn do_refresh_all(&self) -> anyhow::Result<RefreshReport> {
        let mut report = RefreshReport {
            started_at: Utc::now().to_rfc3339(),
            ..Default::default()
        };

        let sources = self.db.get_all_sources().await?;
        let categories: Vec<String> = self
            .db
            .get_categories()
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        info!(
            "Refreshing {} sources into {} categories",
            sources.len(),
            categories.len()
        );

        if self.classifier.is_none() {
            warn!("No classifier configured; only sources with a specific category hint will be stored");
        }

        for source in sources {
            match self.fetch_source(&source).await {
                Ok(items) => {
                    info!("Fetched {} items from '{}'", items.len(), source.name);
                    report.total_fetched += items.len();
                    report.source_stats.insert(source.name.clone(), items.len());

                    self.store_items(&source, items, &categories, &mut report).await;
                    let _ = self.db.update_source_fetched(source.id, None).await;
                }
                Err(e) => {
                    error!("Failed to fetch source '{}': {}", source.name, e);
                    report.source_stats.insert(source.name.clone(), 0);
                    let _ = self
                        .db
                        .update_source_fetched(source.id, Some(&e.to_string()))
                        .await;
                }
            }
        }

        report.finished_at = Utc::now().to_rfc3339();
        info!(
            "Refresh complete: saved {}, skipped {}, uncategorized {}, fetched {} (hint {}, model {})",
            report.saved,
            report.skipped,
            report.uncategorized,
            report.total_fetched,
            report.hint_categorized,
            report.model_categorized
        );
        Ok(report)
    }

    async fn store_items(
        &self,
        source: &Source,
        items: Vec<FetchedItem>,
        categories: &[String],
        report: &mut RefreshReport,
    ) {
        let hinted = source
            .category_hint
            .as_deref()
            .and_then(|hint| category_from_hint(hint, categories));

        for item in items {
            let title = item.title.trim();
            let url = item.url.trim();
            if title.is_empty() || url.is_empty() {
                report.skipped += 1;
                continue;
            }

            if !is_web_url(url) {
                warn!("Skipping '{}' with non-http link: {}", title, url);
                report.skipped += 1;
                continue;
            }

            // Dedupe before spending a model call on the headline
            match self.db.article_exists(url).await {
                Ok(false) => {}
                Ok(true) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to look up article {}: {}", url, e);
                    report.skipped += 1;
                    continue;
                }
            }

            let category = match &hinted {
                Some(category) => {
                    report.hint_categorized += 1;
                    Some(category.clone())
                }
                None => {
                    let category = self.classify(title, categories).await;
                    if category.is_some() {
                        report.model_categorized += 1;
                    }
                    category
                }
            };

            let Some(category) = category else {
                report.uncategorized += 1;
                continue;
            };

            let article = NewArticle {
                title: title.to_string(),
                url: url.to_string(),
                source_id: Some(source.id),
                source_name: source.name.clone(),
                category,
                summary: item.summary.filter(|s| !s.trim().is_empty()),
                published_at: item.published,
            };

            match self.db.insert_article(&article).await {
                Ok(true) => report.saved += 1,
                Ok(false) => {
                    debug!("Skipping duplicate (constraint): {}", url);
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!("Failed to save article {}: {}", url, e);
                    report.skipped += 1;
                }
            }
        }
    }

    async fn classify(&self, headline: &str, categories: &[String]) -> Option<String> {
        let classifier = self.classifier.as_ref()?;
        match classifier.classify(headline, categories).await {
            Ok(category) => category,
            Err(e) => {
                warn!(
                    "{} failed to classify '{}': {}",
                    classifier.name(),
                    headline,
                    e
                );
                None
            }
        }
    }

    /// Fetch a source and apply its `min_score` filter.
    pub async fn fetch_source(&self, source: &Source) -> anyhow::Result<Vec<FetchedItem>> {
        let items = if is_reddit(&source.url) {
            let url = reddit_json_url(&source.url);
            debug!("Fetching Reddit listing: {} ({})", source.name, url);
            let bytes = self.get_bytes(&url).await?;
            parse_reddit_listing(&bytes)?
        } else {
            debug!("Fetching feed: {} ({})", source.name, source.url);
            let bytes = self.get_bytes(&source.url).await?;
            parse_feed_items(&bytes)?
        };

        Ok(items
            .into_iter()
            .filter(|item| source.min_score <= 0 || item.score >= source.min_score)
            .collect())
    }

    async fn get_bytes(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Only http(s) links are stored; anything else would end up as a page anchor.
pub fn is_web_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

pub fn is_reddit(url: &str) -> bool {
    url.to_lowercase().contains("reddit.com")
}

/// Turn a subreddit RSS URL into its JSON listing URL.
pub fn reddit_json_url(url: &str) -> String {
    let base = url.replace(".rss", "");
    if base.ends_with(".json") {
        base
    } else if base.ends_with('/') {
        format!("{}.json", base)
    } else {
        format!("{}/.json", base)
    }
}

fn score_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)(?:points?|score|karma|upvotes?)[:\s]+(\d+)").unwrap(),
            Regex::new(r"(?i)(\d+)\s*(?:points?|score|karma|upvotes?)").unwrap(),
        ]
    })
}

/// Pull a points/score/karma count out of a feed description, 0 if absent.
pub fn extract_score(text: &str) -> i64 {
    score_patterns()
        .iter()
        .find_map(|re| re.captures(text)?.get(1)?.as_str().parse().ok())
        .unwrap_or(0)
}

pub fn parse_feed_items(bytes: &[u8]) -> anyhow::Result<Vec<FetchedItem>> {
    let parsed = parser::parse(bytes)?;

    Ok(parsed
        .entries
        .into_iter()
        .map(|entry| {
            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default();

            let url = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .unwrap_or_default();

            let summary = entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()));

            let score = summary.as_deref().map(extract_score).unwrap_or(0);
            let published = entry.published.or(entry.updated);

            FetchedItem {
                title,
                url,
                summary,
                published,
                score,
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RedditListing {
    data: RedditListingData,
}

#[derive(Debug, Deserialize)]
struct RedditListingData {
    #[serde(default)]
    children: Vec<RedditChild>,
}

#[derive(Debug, Deserialize)]
struct RedditChild {
    data: RedditPost,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RedditPost {
    title: String,
    url: Option<String>,
    permalink: Option<String>,
    ups: i64,
    created_utc: f64,
    selftext: Option<String>,
}

pub fn parse_reddit_listing(bytes: &[u8]) -> anyhow::Result<Vec<FetchedItem>> {
    let listing: RedditListing = serde_json::from_slice(bytes)?;

    Ok(listing
        .data
        .children
        .into_iter()
        .map(|child| {
            let post = child.data;

            // Self-posts carry a relative URL; point at the thread instead
            let mut url = post.url.unwrap_or_default();
            if !url.starts_with("http") {
                if let Some(permalink) = post.permalink.filter(|p| !p.is_empty()) {
                    url = format!("https://www.reddit.com{}", permalink);
                }
            }

            let published = if post.created_utc > 0.0 {
                DateTime::from_timestamp(post.created_utc as i64, 0)
            } else {
                None
            };

            FetchedItem {
                title: post.title.trim().to_string(),
                url,
                summary: post.selftext,
                published,
                score: post.ups,
            }
        })
        .collect())
}

pub fn refresh_period(interval_minutes: u64) -> Duration {
    Duration::from_secs(interval_minutes.saturating_mul(60))
}

pub async fn start_background_refresh(fetcher: Arc<Fetcher>, interval_minutes: u64) {
    let interval = refresh_period(interval_minutes);

    // Do initial fetch
    info!("Starting initial refresh");
    if let Err(e) = fetcher.refresh_all().await {
        error!("Initial refresh failed: {}", e);
    }

    // Then schedule periodic refreshes
    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled refresh");
        if let Err(e) = fetcher.refresh_all().await {
            error!("Scheduled refresh failed: {}", e);
        }
    }
}
