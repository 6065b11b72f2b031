use crawler::{
    await_results, extract_profile_stats, parse_selector, CrawlerError, DriverError,
    LinkCollector, Navigator, PageSource, PaginationConfig, PaginationOutcome, PaginationState,
    Paginator,
    ProfileStats, ReferenceSet, ResultsProbe, ScrollDriver, Selector, Termination,
};
use queue::{CompletedTask, QueueError, QueueStore, TaskKind, TaskStatus};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use store::{RecordLoad, RecordStore, StoreError};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::progress::TaskProgress;
use crate::settings::Settings;

/// Failures that stop a task before it reaches a terminal outcome.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Could not open feed: {0}")]
    Navigation(#[source] DriverError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("Invalid feed URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl TaskError {
    /// Whether the task should stay pending and be retried on the next run.
    pub fn leaves_pending(&self) -> bool {
        matches!(self, TaskError::Navigation(_) | TaskError::Persistence(_))
    }
}

/// Everything one entry point needs: where to go, what to collect, how to
/// scroll, and where to save.
struct FeedProcedure {
    url_template: String,
    collector: LinkCollector,
    pagination: PaginationConfig,
    records: RecordStore,
}

pub struct Harvester {
    origin: String,
    search: FeedProcedure,
    user_feed: FeedProcedure,
    search_target: usize,
    sweep_margin: usize,
    no_results_text: Option<String>,
    results_wait_attempts: usize,
    results_wait: Duration,
    profile_selector: Option<Selector>,
}

impl Harvester {
    /// Validates origin and selectors up front so bad configuration halts
    /// the run before any task starts.
    pub fn from_settings(settings: &Settings) -> Result<Self, CrawlerError> {
        let origin = settings.origin().to_string();

        let search = FeedProcedure {
            url_template: settings.search_url_template.clone(),
            collector: LinkCollector::new(
                &origin,
                &settings.search_container,
                settings.search_reference_prefixes.clone(),
            )?,
            pagination: settings.search_pagination(),
            records: RecordStore::new(&settings.search_path),
        };
        let user_feed = FeedProcedure {
            url_template: settings.user_feed_url_template.clone(),
            collector: LinkCollector::new(
                &origin,
                &settings.user_feed_container,
                settings.user_feed_reference_prefixes.clone(),
            )?,
            pagination: settings.user_feed_pagination(),
            records: RecordStore::new(&settings.user_feed_path),
        };
        let profile_selector = settings
            .profile_stats_selector
            .as_deref()
            .map(parse_selector)
            .transpose()?;

        Ok(Self {
            origin,
            search,
            user_feed,
            search_target: settings.search_target,
            sweep_margin: settings.sweep_margin,
            no_results_text: settings.no_results_text.clone(),
            results_wait_attempts: settings.results_wait_attempts,
            results_wait: settings.results_wait(),
            profile_selector,
        })
    }

    /// Run one task to a terminal outcome.
    pub fn process<S>(&self, surface: &mut S, task_id: &str, kind: &TaskKind) -> Result<CompletedTask, TaskError>
    where
        S: Navigator + ScrollDriver + PageSource,
    {
        match kind {
            TaskKind::Search => self.search(surface, task_id),
            TaskKind::UserFeed => self.user_feed(surface, task_id),
            TaskKind::Unknown(raw) => {
                warn!("Unknown task kind '{}' for '{}', skipping", raw, task_id);
                Ok(CompletedTask::new(kind.clone(), TaskStatus::UnknownTaskKind))
            }
        }
    }

    fn search<S>(&self, surface: &mut S, query: &str) -> Result<CompletedTask, TaskError>
    where
        S: Navigator + ScrollDriver + PageSource,
    {
        info!("Searching for #{}", query);
        let procedure = &self.search;
        self.open(surface, procedure, query)?;

        match await_results(
            surface,
            &procedure.collector,
            self.no_results_text.as_deref(),
            self.results_wait_attempts,
            self.results_wait,
        ) {
            ResultsProbe::NoResults => {
                info!("No results for #{}", query);
                return Ok(CompletedTask::new(TaskKind::Search, TaskStatus::NoResultsFound));
            }
            ResultsProbe::NotRendered => {
                warn!("Results for #{} never rendered, scrolling anyway", query)
            }
            ResultsProbe::Ready => {}
        }

        let outcome = Paginator::new(surface, &procedure.collector, &procedure.pagination)
            .run(Termination::TargetCount {
                target: self.search_target,
            });
        if outcome.state == PaginationState::StoppedError {
            warn!(
                "Search for #{} ended early, keeping {} references",
                query,
                outcome.references.len()
            );
        }
        report_drift(query, &outcome);

        self.record(TaskKind::Search, procedure, query, &outcome.references, None)
            .map(|task| task.with_drift(outcome.drift_suspected))
    }

    fn user_feed<S>(&self, surface: &mut S, user: &str) -> Result<CompletedTask, TaskError>
    where
        S: Navigator + ScrollDriver + PageSource,
    {
        info!("Processing user {}", user);
        let procedure = &self.user_feed;
        self.open(surface, procedure, user)?;

        let profile = self.profile_stats(surface);
        if let Some(stats) = &profile {
            info!(
                "{}: {} posts, {} followers, {} following",
                user, stats.posts, stats.followers, stats.following
            );
        }

        let crawl = Paginator::new(surface, &procedure.collector, &procedure.pagination)
            .deep_crawl(self.sweep_margin);
        if crawl.sweep.state == PaginationState::StoppedError {
            warn!(
                "Sweep for {} ended early, keeping {} references",
                user,
                crawl.references().len()
            );
        }

        report_drift(user, &crawl.sweep);

        self.record(TaskKind::UserFeed, procedure, user, crawl.references(), profile)
            .map(|task| task.with_drift(crawl.sweep.drift_suspected))
    }

    fn open<S: Navigator>(&self, surface: &mut S, procedure: &FeedProcedure, query: &str) -> Result<(), TaskError> {
        let url = self.task_url(&procedure.url_template, query)?;
        surface.navigate(&url).map_err(TaskError::Navigation)
    }

    pub(crate) fn task_url(&self, template: &str, query: &str) -> Result<Url, TaskError> {
        let encoded: String = url::form_urlencoded::byte_serialize(query.trim().as_bytes()).collect();
        let raw = template
            .replace("{origin}", &self.origin)
            .replace("{query}", &encoded);
        Url::parse(&raw).map_err(|e| TaskError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })
    }

    fn profile_stats<S: PageSource>(&self, surface: &mut S) -> Option<ProfileStats> {
        let selector = self.profile_selector.as_ref()?;
        match surface.snapshot() {
            Ok(snapshot) => {
                let stats = extract_profile_stats(&snapshot, selector);
                if stats.is_none() {
                    warn!("Profile counters not found on the page");
                }
                stats
            }
            Err(e) => {
                warn!("Could not read profile counters: {}", e);
                None
            }
        }
    }

    fn record(
        &self,
        kind: TaskKind,
        procedure: &FeedProcedure,
        task_id: &str,
        references: &ReferenceSet,
        profile: Option<ProfileStats>,
    ) -> Result<CompletedTask, TaskError> {
        if references.is_empty() {
            warn!(
                "Nothing collected for '{}', the page layout may have changed",
                task_id
            );
            return Ok(CompletedTask::new(kind, TaskStatus::NoContentScraped).with_profile(profile));
        }

        let report = procedure.records.commit(task_id, references)?;
        if let RecordLoad::Corrupt { reason } = &report.prior {
            warn!(
                "Previous record for '{}' was unreadable ({}), it was replaced",
                task_id, reason
            );
        }

        Ok(CompletedTask::new(kind, TaskStatus::Completed)
            .with_output(&report.path, report.added, report.total)
            .with_profile(profile))
    }

    pub fn output_dirs(&self) -> [&Path; 2] {
        [self.search.records.dir(), self.user_feed.records.dir()]
    }
}

fn report_drift(task_id: &str, outcome: &PaginationOutcome) {
    if outcome.drift_suspected {
        warn!(
            "'{}': {} steps in a row found nothing new, check the results container selector",
            task_id, outcome.longest_idle_streak
        );
    }
}

#[derive(Debug, Default)]
pub struct RunOptions {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub left_pending: usize,
    pub failed: usize,
    pub stopped_early: bool,
}

/// Process pending tasks one at a time. Each terminal outcome is flushed
/// to the queue file before the next task begins.
pub fn run_queue<S>(
    harvester: &Harvester,
    surface: &mut S,
    queue: &mut QueueStore,
    options: &RunOptions,
    stop: &AtomicBool,
    progress: &TaskProgress,
) -> Result<RunSummary, QueueError>
where
    S: Navigator + ScrollDriver + PageSource,
{
    let mut summary = RunSummary::default();
    let pending = queue.pending();

    for (attempted, (task_id, kind)) in pending.into_iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            info!("Shutdown requested, leaving remaining tasks pending");
            summary.stopped_early = true;
            break;
        }
        if options.limit.is_some_and(|limit| attempted >= limit) {
            info!("Task limit reached");
            summary.stopped_early = true;
            break;
        }

        progress.set_message(format!("{} ({})", task_id, kind));
        let outcome = match harvester.process(surface, &task_id, &kind) {
            Ok(outcome) => Some(outcome),
            Err(e) if e.leaves_pending() => {
                error!("Task '{}' left pending: {}", task_id, e);
                summary.left_pending += 1;
                None
            }
            Err(e) => {
                error!("Task '{}' failed: {}", task_id, e);
                summary.failed += 1;
                Some(CompletedTask::new(
                    kind.clone(),
                    TaskStatus::RuntimeError(e.to_string()),
                ))
            }
        };

        if let Some(outcome) = outcome {
            info!("Task '{}' finished: {}", task_id, outcome.status);
            if outcome.status == TaskStatus::Completed {
                summary.completed += 1;
            }
            queue.complete(&task_id, outcome)?;
        }
        progress.inc();
    }

    Ok(summary)
}
