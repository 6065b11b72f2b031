use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{AnchorExtractor, LinkCollector, PageSource, Snapshot};

/// State of a freshly loaded results page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsProbe {
    /// The results container is rendered.
    Ready,
    /// The site says there is nothing to show.
    NoResults,
    /// Neither signal appeared within the allotted attempts.
    NotRendered,
}

/// Poll the page until the results container shows up or the no-results
/// message appears. Snapshot failures count as a failed attempt.
pub fn await_results<S, E>(
    surface: &mut S,
    collector: &LinkCollector<E>,
    no_results_text: Option<&str>,
    attempts: usize,
    delay: Duration,
) -> ResultsProbe
where
    S: PageSource,
    E: AnchorExtractor,
{
    for attempt in 1..=attempts {
        match surface.snapshot() {
            Ok(snapshot) => {
                if no_results_text.is_some_and(|text| snapshot.contains_text(text)) {
                    info!("Upstream reports no results");
                    return ResultsProbe::NoResults;
                }
                if collector.container_anchors(&snapshot).is_some() {
                    return ResultsProbe::Ready;
                }
                debug!("Results not rendered yet (attempt {}/{})", attempt, attempts);
            }
            Err(e) => warn!("No snapshot on attempt {}/{}: {}", attempt, attempts, e),
        }

        if attempt < attempts && !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    warn!("Results container did not appear after {} attempts", attempts);
    ResultsProbe::NotRendered
}

/// Counters shown in a profile header, kept as displayed ("1,204", "3.5M").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStats {
    pub posts: String,
    pub followers: String,
    pub following: String,
}

/// Read the first three elements matching `selector` as posts, followers
/// and following.
pub fn extract_profile_stats(snapshot: &Snapshot, selector: &Selector) -> Option<ProfileStats> {
    let document = Html::parse_document(snapshot.html());
    let mut values = document
        .select(selector)
        .map(|element| element.text().collect::<String>().trim().to_string());

    let stats = ProfileStats {
        posts: values.next()?,
        followers: values.next()?,
        following: values.next()?,
    };
    Some(stats)
}
