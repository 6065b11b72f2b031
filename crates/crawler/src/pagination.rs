use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    AnchorExtractor, Collection, DriverError, HtmlAnchors, LinkCollector, PageSource, Reference,
    ReferenceSet, ScrollDirection, ScrollDriver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Running,
    StoppedTarget,
    StoppedStable,
    StoppedLimit,
    StoppedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop once this many references have been accumulated.
    TargetCount { target: usize },
    /// Stop once two consecutive snapshots compare equal.
    Stabilization,
}

/// What the stabilization check compares between consecutive snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityScope {
    /// Entire page source.
    #[default]
    Document,
    /// Anchor targets inside the results container only.
    Container,
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    /// Hard ceiling on scroll steps for one pass.
    pub max_steps: usize,
    /// Pause after each forward scroll before reading the page.
    pub settle: Duration,
    /// Pause after each step of a sweep.
    pub sweep_settle: Duration,
    /// Extra snapshot reads when the results container is not rendered yet.
    pub render_retries: usize,
    pub render_retry_delay: Duration,
    /// Consecutive zero-new steps before selector drift is suspected.
    pub idle_warning_steps: usize,
    pub stability_scope: StabilityScope,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            settle: Duration::from_millis(1500),
            sweep_settle: Duration::from_millis(1000),
            render_retries: 3,
            render_retry_delay: Duration::from_millis(500),
            idle_warning_steps: 5,
            stability_scope: StabilityScope::Document,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginationOutcome {
    pub state: PaginationState,
    /// Successful scroll steps taken.
    pub steps: usize,
    pub references: ReferenceSet,
    pub error: Option<DriverError>,
    pub longest_idle_streak: usize,
    pub drift_suspected: bool,
}

/// Depth probe followed by a backward collecting sweep.
#[derive(Debug, Clone)]
pub struct DeepCrawl {
    pub depth: PaginationOutcome,
    pub sweep: PaginationOutcome,
}

impl DeepCrawl {
    pub fn references(&self) -> &ReferenceSet {
        &self.sweep.references
    }
}

struct Accumulator {
    references: ReferenceSet,
    idle_streak: usize,
    longest_idle_streak: usize,
    idle_warning_steps: usize,
    drift_suspected: bool,
}

impl Accumulator {
    fn new(idle_warning_steps: usize) -> Self {
        Self {
            references: ReferenceSet::new(),
            idle_streak: 0,
            longest_idle_streak: 0,
            idle_warning_steps,
            drift_suspected: false,
        }
    }

    fn absorb(&mut self, found: Vec<Reference>, step: usize) {
        let new = self.references.extend_new(found);
        debug!(
            "Step {}: {} new references ({} total)",
            step,
            new,
            self.references.len()
        );

        if new > 0 {
            self.idle_streak = 0;
            return;
        }

        self.idle_streak += 1;
        self.longest_idle_streak = self.longest_idle_streak.max(self.idle_streak);
        if self.idle_warning_steps > 0 && self.idle_streak == self.idle_warning_steps {
            self.drift_suspected = true;
            warn!(
                "No new references for {} consecutive steps, the results selector may have drifted",
                self.idle_streak
            );
        }
    }

    fn finish(
        self,
        state: PaginationState,
        steps: usize,
        error: Option<DriverError>,
    ) -> PaginationOutcome {
        PaginationOutcome {
            state,
            steps,
            references: self.references,
            error,
            longest_idle_streak: self.longest_idle_streak,
            drift_suspected: self.drift_suspected,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Fingerprint {
    Document(String),
    Container(Option<Vec<String>>),
}

impl Fingerprint {
    fn matches(&self, other: &Fingerprint) -> bool {
        match (self, other) {
            (Fingerprint::Document(a), Fingerprint::Document(b)) => a == b,
            // a container that is not rendered says nothing about the feed end
            (Fingerprint::Container(Some(a)), Fingerprint::Container(Some(b))) => a == b,
            _ => false,
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

/// Drives a scrollable surface and collects references along the way.
pub struct Paginator<'a, S, E = HtmlAnchors> {
    surface: &'a mut S,
    collector: &'a LinkCollector<E>,
    config: &'a PaginationConfig,
}

impl<'a, S, E> Paginator<'a, S, E>
where
    S: ScrollDriver + PageSource,
    E: AnchorExtractor,
{
    pub fn new(
        surface: &'a mut S,
        collector: &'a LinkCollector<E>,
        config: &'a PaginationConfig,
    ) -> Self {
        Self {
            surface,
            collector,
            config,
        }
    }

    pub fn run(&mut self, termination: Termination) -> PaginationOutcome {
        match termination {
            Termination::TargetCount { target } => self.run_to_target(target),
            Termination::Stabilization => self.measure_depth(),
        }
    }

    /// Scroll forward, collecting after every step, until `target`
    /// references are held or the step ceiling is hit.
    pub fn run_to_target(&mut self, target: usize) -> PaginationOutcome {
        info!("Scrolling for up to {} references", target);
        let mut acc = Accumulator::new(self.config.idle_warning_steps);
        let mut steps = 0;

        let state = loop {
            if acc.references.len() >= target {
                break PaginationState::StoppedTarget;
            }
            if steps >= self.config.max_steps {
                break PaginationState::StoppedLimit;
            }

            if let Err(e) = self.surface.scroll(ScrollDirection::Forward) {
                warn!("Stopping after {} steps: {}", steps, e);
                return acc.finish(PaginationState::StoppedError, steps, Some(e));
            }
            steps += 1;
            pause(self.config.settle);

            match self.collect_step() {
                Ok(found) => acc.absorb(found, steps),
                Err(e) => {
                    warn!("Stopping after {} steps: {}", steps, e);
                    return acc.finish(PaginationState::StoppedError, steps, Some(e));
                }
            }
        };

        info!(
            "Pagination finished: {:?} after {} steps with {} references",
            state,
            steps,
            acc.references.len()
        );
        acc.finish(state, steps, None)
    }

    /// Scroll forward until the page stops changing, without collecting.
    /// The returned step count is how deep the feed goes.
    pub fn measure_depth(&mut self) -> PaginationOutcome {
        let acc = Accumulator::new(self.config.idle_warning_steps);

        let mut previous = match self.fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!("Cannot read the page before scrolling: {}", e);
                return acc.finish(PaginationState::StoppedError, 0, Some(e));
            }
        };

        let mut steps = 0;
        while steps < self.config.max_steps {
            if let Err(e) = self.surface.scroll(ScrollDirection::Forward) {
                warn!("Depth probe stopped after {} steps: {}", steps, e);
                return acc.finish(PaginationState::StoppedError, steps, Some(e));
            }
            steps += 1;
            pause(self.config.settle);

            let current = match self.fingerprint() {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    warn!("Depth probe stopped after {} steps: {}", steps, e);
                    return acc.finish(PaginationState::StoppedError, steps, Some(e));
                }
            };
            if current.matches(&previous) {
                info!("Feed stabilized after {} forward steps", steps);
                return acc.finish(PaginationState::StoppedStable, steps, None);
            }
            previous = current;
        }

        warn!(
            "Reached the step limit ({}) before the feed stabilized",
            self.config.max_steps
        );
        acc.finish(PaginationState::StoppedLimit, steps, None)
    }

    /// Collect at the current position, then scroll exactly `planned` times
    /// in `direction`, collecting after each step.
    pub fn sweep(&mut self, direction: ScrollDirection, planned: usize) -> PaginationOutcome {
        info!("Sweeping {:?} for {} steps", direction, planned);
        let mut acc = Accumulator::new(self.config.idle_warning_steps);

        match self.collect_step() {
            Ok(found) => acc.absorb(found, 0),
            Err(e) => return acc.finish(PaginationState::StoppedError, 0, Some(e)),
        }

        for step in 1..=planned {
            if let Err(e) = self.surface.scroll(direction) {
                warn!("Sweep stopped after {} steps: {}", step - 1, e);
                return acc.finish(PaginationState::StoppedError, step - 1, Some(e));
            }
            pause(self.config.sweep_settle);

            match self.collect_step() {
                Ok(found) => acc.absorb(found, step),
                Err(e) => {
                    warn!("Sweep stopped after {} steps: {}", step, e);
                    return acc.finish(PaginationState::StoppedError, step, Some(e));
                }
            }
        }

        info!(
            "Sweep finished with {} references",
            acc.references.len()
        );
        acc.finish(PaginationState::StoppedLimit, planned, None)
    }

    /// Measure how deep the feed goes, then sweep back over the same window
    /// plus `margin` steps while collecting.
    pub fn deep_crawl(&mut self, margin: usize) -> DeepCrawl {
        let depth = self.measure_depth();
        if depth.state == PaginationState::StoppedError {
            warn!(
                "Depth probe failed after {} steps, sweeping the measured window anyway",
                depth.steps
            );
        }

        let sweep = self.sweep(ScrollDirection::Backward, depth.steps + margin);
        DeepCrawl { depth, sweep }
    }

    fn collect_step(&mut self) -> Result<Vec<Reference>, DriverError> {
        let mut retries = 0;
        loop {
            let snapshot = self.surface.snapshot()?;
            match self.collector.collect(&snapshot) {
                Collection::Found(found) => return Ok(found),
                Collection::ContainerMissing if retries < self.config.render_retries => {
                    retries += 1;
                    debug!("Results container not rendered yet (retry {})", retries);
                    pause(self.config.render_retry_delay);
                }
                Collection::ContainerMissing => {
                    warn!(
                        "Results container missing after {} retries, counting step as empty",
                        retries
                    );
                    return Ok(Vec::new());
                }
            }
        }
    }

    fn fingerprint(&mut self) -> Result<Fingerprint, DriverError> {
        let snapshot = self.surface.snapshot()?;
        Ok(match self.config.stability_scope {
            StabilityScope::Document => Fingerprint::Document(snapshot.html().to_string()),
            StabilityScope::Container => {
                Fingerprint::Container(self.collector.container_anchors(&snapshot))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{feed_page, ScriptedFeed};

    fn quick_config() -> PaginationConfig {
        PaginationConfig {
            max_steps: 50,
            settle: Duration::ZERO,
            sweep_settle: Duration::ZERO,
            render_retries: 2,
            render_retry_delay: Duration::ZERO,
            idle_warning_steps: 3,
            stability_scope: StabilityScope::Document,
        }
    }

    fn collector() -> LinkCollector {
        LinkCollector::new("https://feed.example.com", "div.results", vec!["/p/".to_string()])
            .unwrap()
    }

    /// Page `n` of a feed that grows by two posts per scroll.
    fn growing_page(n: usize) -> String {
        let paths: Vec<String> = (0..n * 2).map(|i| format!("/p/{}/", i)).collect();
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        feed_page(&refs)
    }

    #[test]
    fn test_target_count_stops_on_third_step() {
        let mut feed = ScriptedFeed::new((1..=10).map(growing_page));
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config)
            .run(Termination::TargetCount { target: 5 });

        assert_eq!(outcome.state, PaginationState::StoppedTarget);
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.references.len(), 6);
        assert_eq!(feed.scrolls, vec![ScrollDirection::Forward; 3]);
    }

    #[test]
    fn test_target_count_keeps_going_through_empty_steps() {
        let pages = vec![
            growing_page(1),
            growing_page(1),
            growing_page(1),
            growing_page(1),
            growing_page(2),
        ];
        let mut feed = ScriptedFeed::new(pages);
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config).run_to_target(4);

        assert_eq!(outcome.state, PaginationState::StoppedTarget);
        assert_eq!(outcome.steps, 5);
        assert_eq!(outcome.longest_idle_streak, 3);
        assert!(outcome.drift_suspected);
    }

    #[test]
    fn test_target_count_respects_step_ceiling() {
        let mut feed = ScriptedFeed::new(vec![growing_page(1)]);
        let collector = collector();
        let config = PaginationConfig {
            max_steps: 4,
            ..quick_config()
        };

        let outcome = Paginator::new(&mut feed, &collector, &config).run_to_target(100);

        assert_eq!(outcome.state, PaginationState::StoppedLimit);
        assert_eq!(outcome.steps, 4);
        assert_eq!(outcome.references.len(), 2);
    }

    #[test]
    fn test_scroll_failure_keeps_partial_results() {
        let mut feed = ScriptedFeed::new((1..=10).map(growing_page));
        feed.fail_scroll_at = Some(3);
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config).run_to_target(100);

        assert_eq!(outcome.state, PaginationState::StoppedError);
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.references.len(), 4);
        assert!(matches!(outcome.error, Some(DriverError::Scroll(_))));
    }

    #[test]
    fn test_snapshot_failure_keeps_partial_results() {
        let mut feed = ScriptedFeed::new((1..=10).map(growing_page));
        feed.fail_snapshot_at = Some(3);
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config).run_to_target(100);

        assert_eq!(outcome.state, PaginationState::StoppedError);
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.references.len(), 4);
        assert!(matches!(outcome.error, Some(DriverError::Snapshot(_))));
    }

    #[test]
    fn test_depth_probe_stops_when_snapshot_fails() {
        let mut feed = ScriptedFeed::new(vec!["s1", "s2", "s3"]);
        feed.fail_snapshot_at = Some(3);
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config).measure_depth();

        assert_eq!(outcome.state, PaginationState::StoppedError);
        assert_eq!(outcome.steps, 2);
        assert!(matches!(outcome.error, Some(DriverError::Snapshot(_))));
    }

    #[test]
    fn test_depth_probe_needs_an_initial_snapshot() {
        let mut feed = ScriptedFeed::new(vec!["s1"]);
        feed.fail_snapshot_at = Some(1);
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config).measure_depth();

        assert_eq!(outcome.state, PaginationState::StoppedError);
        assert_eq!(outcome.steps, 0);
        assert!(feed.scrolls.is_empty());
    }

    #[test]
    fn test_missing_container_is_retried_within_step() {
        let pages = vec![
            "<html><body>loading</body></html>".to_string(),
            growing_page(1),
        ];
        let mut feed = ScriptedFeed::new(pages);
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config).run_to_target(2);

        assert_eq!(outcome.state, PaginationState::StoppedTarget);
        assert_eq!(outcome.steps, 1);
        assert_eq!(feed.snapshots_taken, 2);
    }

    #[test]
    fn test_stabilization_detects_repeated_snapshot() {
        let pages = vec!["s1", "s2", "s3", "s4", "s4"];
        let mut feed = ScriptedFeed::new(pages);
        let collector = collector();
        let config = quick_config();

        let outcome = Paginator::new(&mut feed, &collector, &config).run(Termination::Stabilization);

        assert_eq!(outcome.state, PaginationState::StoppedStable);
        assert_eq!(outcome.steps, 4);
        assert_eq!(feed.snapshots_taken, 5);
        assert!(outcome.references.is_empty());
    }

    #[test]
    fn test_stabilization_hits_step_limit() {
        let mut feed = ScriptedFeed::new((0..100).map(|i| format!("page {}", i)));
        let collector = collector();
        let config = PaginationConfig {
            max_steps: 10,
            ..quick_config()
        };

        let outcome = Paginator::new(&mut feed, &collector, &config).measure_depth();

        assert_eq!(outcome.state, PaginationState::StoppedLimit);
        assert_eq!(outcome.steps, 10);
        assert_eq!(feed.scrolls.len(), 10);
    }

    #[test]
    fn test_container_scope_ignores_cosmetic_changes() {
        let pages = vec![
            feed_page(&["/p/a/"]),
            feed_page(&["/p/a/", "/p/b/"]),
            feed_page(&["/p/a/", "/p/b/"]).replace("<nav>", "<nav class=\"sticky\">"),
        ];
        let mut feed = ScriptedFeed::new(pages);
        let collector = collector();
        let config = PaginationConfig {
            stability_scope: StabilityScope::Container,
            ..quick_config()
        };

        let outcome = Paginator::new(&mut feed, &collector, &config).measure_depth();

        assert_eq!(outcome.state, PaginationState::StoppedStable);
        assert_eq!(outcome.steps, 2);
    }

    #[test]
    fn test_deep_crawl_sweeps_back_with_margin() {
        // depth probe reads 4 snapshots, the sweep reads the rest
        let mut pages = vec!["d1", "d2", "d3", "d3"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        pages.push(feed_page(&["/p/9/", "/p/8/"]));
        pages.push(feed_page(&["/p/8/", "/p/7/"]));
        pages.push(feed_page(&["/p/7/", "/p/6/"]));
        let mut feed = ScriptedFeed::new(pages);
        let collector = collector();
        let config = quick_config();

        let crawl = Paginator::new(&mut feed, &collector, &config).deep_crawl(2);

        assert_eq!(crawl.depth.state, PaginationState::StoppedStable);
        assert_eq!(crawl.depth.steps, 3);
        assert_eq!(crawl.sweep.state, PaginationState::StoppedLimit);
        assert_eq!(crawl.sweep.steps, 5);

        let backward = feed
            .scrolls
            .iter()
            .filter(|d| **d == ScrollDirection::Backward)
            .count();
        assert_eq!(backward, 5);

        let found: Vec<&str> = crawl.references().iter().map(Reference::as_str).collect();
        assert_eq!(
            found,
            vec![
                "https://feed.example.com/p/9/",
                "https://feed.example.com/p/8/",
                "https://feed.example.com/p/7/",
                "https://feed.example.com/p/6/",
            ]
        );
    }

    #[test]
    fn test_deep_crawl_sweeps_even_when_probe_fails() {
        let mut feed = ScriptedFeed::new(vec![feed_page(&["/p/1/"])]);
        feed.fail_scroll_at = Some(1);
        let collector = collector();
        let config = quick_config();

        let crawl = Paginator::new(&mut feed, &collector, &config).deep_crawl(3);

        assert_eq!(crawl.depth.state, PaginationState::StoppedError);
        assert_eq!(crawl.depth.steps, 0);
        // only the first scroll attempt fails
        assert_eq!(crawl.sweep.state, PaginationState::StoppedLimit);
        assert_eq!(crawl.references().len(), 1);
    }
}
