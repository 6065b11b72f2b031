//! Crawl engine for infinite-scroll feeds.
//!
//! The crate never talks to a browser directly. Everything it needs from the
//! outside world goes through three small traits: [`Navigator`],
//! [`ScrollDriver`] and [`PageSource`].

mod collector;
mod pagination;
mod probe;
mod reference;

use thiserror::Error;
use url::Url;

pub use collector::{AnchorExtractor, Collection, HtmlAnchors, LinkCollector};
pub use pagination::{
    DeepCrawl, PaginationConfig, PaginationOutcome, PaginationState, Paginator, StabilityScope,
    Termination,
};
pub use probe::{await_results, extract_profile_stats, ProfileStats, ResultsProbe};
pub use reference::{Reference, ReferenceSet};
pub use scraper::Selector;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
}

/// Failure reported by the browsing surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("Scroll failed: {0}")]
    Scroll(String),
    #[error("Snapshot unavailable: {0}")]
    Snapshot(String),
    #[error("Navigation failed: {0}")]
    Navigation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Forward,
    Backward,
}

/// Rendered page source captured at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    html: String,
}

impl Snapshot {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    /// True when `needle` appears in the visible text of the page.
    pub fn contains_text(&self, needle: &str) -> bool {
        let document = scraper::Html::parse_document(&self.html);
        let text: String = document.root_element().text().collect();
        text.contains(needle)
    }
}

pub trait ScrollDriver {
    /// Advance the feed by one page in `direction`.
    fn scroll(&mut self, direction: ScrollDirection) -> Result<(), DriverError>;
}

pub trait PageSource {
    fn snapshot(&mut self) -> Result<Snapshot, DriverError>;
}

pub trait Navigator {
    fn navigate(&mut self, url: &Url) -> Result<(), DriverError>;
}

/// Parse a CSS selector coming from configuration.
pub fn parse_selector(selector: &str) -> Result<scraper::Selector, CrawlerError> {
    scraper::Selector::parse(selector).map_err(|e| CrawlerError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Surface that replays a fixed list of page sources, one per snapshot.
    ///
    /// The last page is repeated once the script runs out. The scroll
    /// attempt numbered `fail_scroll_at` (1-based) fails, as does the
    /// snapshot numbered `fail_snapshot_at`; all others succeed.
    pub struct ScriptedFeed {
        pages: VecDeque<String>,
        last: String,
        attempts: usize,
        pub scrolls: Vec<ScrollDirection>,
        pub snapshots_taken: usize,
        pub fail_scroll_at: Option<usize>,
        pub fail_snapshot_at: Option<usize>,
    }

    impl ScriptedFeed {
        pub fn new<I, T>(pages: I) -> Self
        where
            I: IntoIterator<Item = T>,
            T: Into<String>,
        {
            Self {
                pages: pages.into_iter().map(Into::into).collect(),
                last: String::new(),
                attempts: 0,
                scrolls: Vec::new(),
                snapshots_taken: 0,
                fail_scroll_at: None,
                fail_snapshot_at: None,
            }
        }
    }

    impl ScrollDriver for ScriptedFeed {
        fn scroll(&mut self, direction: ScrollDirection) -> Result<(), DriverError> {
            self.attempts += 1;
            if self.fail_scroll_at == Some(self.attempts) {
                return Err(DriverError::Scroll("page went away".to_string()));
            }
            self.scrolls.push(direction);
            Ok(())
        }
    }

    impl PageSource for ScriptedFeed {
        fn snapshot(&mut self) -> Result<Snapshot, DriverError> {
            self.snapshots_taken += 1;
            if self.fail_snapshot_at == Some(self.snapshots_taken) {
                return Err(DriverError::Snapshot("tab crashed".to_string()));
            }
            if let Some(page) = self.pages.pop_front() {
                self.last = page;
            }
            Ok(Snapshot::new(self.last.clone()))
        }
    }

    /// Results page whose container holds one anchor per path.
    pub fn feed_page(paths: &[&str]) -> String {
        let anchors: String = paths
            .iter()
            .map(|p| format!(r#"<a href="{}">item</a>"#, p))
            .collect();
        format!(
            r#"<html><body><nav><a href="/explore/">Explore</a></nav><div class="results">{}</div></body></html>"#,
            anchors
        )
    }
}
