use chrono::{DateTime, Utc};
use crawler::ProfileStats;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use store::{write_json_atomic, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue file not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("Queue file {} is malformed: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("Task '{0}' is not pending")]
    NotPending(String),
    #[error("Task '{0}' is not completed")]
    NotCompleted(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Search,
    UserFeed,
    /// Anything else found in the queue file, kept verbatim.
    Unknown(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Search => "search",
            TaskKind::UserFeed => "user_feed",
            TaskKind::Unknown(raw) => raw,
        }
    }
}

impl From<String> for TaskKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "search" => TaskKind::Search,
            "user_feed" | "user-feed" | "user_reels" => TaskKind::UserFeed,
            _ => TaskKind::Unknown(raw),
        }
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one task, stored as readable text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Completed,
    NoResultsFound,
    NoContentScraped,
    UnknownTaskKind,
    RuntimeError(String),
    /// Status text this version does not recognise.
    Other(String),
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Completed => f.write_str("Completed"),
            TaskStatus::NoResultsFound => f.write_str("No Results Found"),
            TaskStatus::NoContentScraped => f.write_str("No Content Scraped"),
            TaskStatus::UnknownTaskKind => f.write_str("Unknown Task Kind"),
            TaskStatus::RuntimeError(message) => write!(f, "Runtime Error: {}", message),
            TaskStatus::Other(raw) => f.write_str(raw),
        }
    }
}

impl From<String> for TaskStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "Completed" => TaskStatus::Completed,
            "No Results Found" | "No Results Found/Scraped" => TaskStatus::NoResultsFound,
            "No Content Scraped" | "No Reels Found/Scraped" => TaskStatus::NoContentScraped,
            "Unknown Task Kind" | "Unknown Type" => TaskStatus::UnknownTaskKind,
            _ => match raw.strip_prefix("Runtime Error: ") {
                Some(message) => TaskStatus::RuntimeError(message.to_string()),
                None => TaskStatus::Other(raw),
            },
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
    pub output_path: Option<PathBuf>,
    /// References added by this run.
    pub count: usize,
    /// Entries in the output file after this run.
    #[serde(default)]
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileStats>,
    /// Many consecutive scrolls found nothing new; the results container
    /// selector may no longer match the site.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub drift_suspected: bool,
}

impl CompletedTask {
    pub fn new(kind: TaskKind, status: TaskStatus) -> Self {
        Self {
            kind,
            status,
            updated_at: Utc::now(),
            output_path: None,
            count: 0,
            total: 0,
            profile: None,
            drift_suspected: false,
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>, count: usize, total: usize) -> Self {
        self.output_path = Some(path.into());
        self.count = count;
        self.total = total;
        self
    }

    pub fn with_profile(mut self, profile: Option<ProfileStats>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_drift(mut self, drift_suspected: bool) -> Self {
        self.drift_suspected = drift_suspected;
        self
    }
}

/// A completed entry; ones written by older tools are kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompletedEntry {
    Task(CompletedTask),
    Raw(Value),
}

impl CompletedEntry {
    pub fn kind(&self) -> Option<TaskKind> {
        match self {
            CompletedEntry::Task(task) => Some(task.kind.clone()),
            CompletedEntry::Raw(value) => value
                .get("kind")
                .or_else(|| value.get("type"))
                .and_then(Value::as_str)
                .map(|raw| TaskKind::from(raw.to_string())),
        }
    }

    pub fn status_text(&self) -> String {
        match self {
            CompletedEntry::Task(task) => task.status.to_string(),
            CompletedEntry::Raw(value) => value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// Pending and completed tasks plus whatever settings share the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueState {
    pub pending_tasks: IndexMap<String, TaskKind>,
    pub completed_tasks: IndexMap<String, CompletedEntry>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl QueueState {
    /// Build from a parsed document. Missing or malformed task maps become
    /// empty; every other key is kept as a setting.
    pub fn from_document(document: Value) -> Option<Self> {
        let Value::Object(mut settings) = document else {
            return None;
        };

        let pending = take_map(&mut settings, &["pending_tasks", "queries"]);
        let completed = take_map(&mut settings, &["completed_tasks", "completed_queries"]);

        let pending_tasks = pending
            .into_iter()
            .map(|(id, kind)| {
                let kind = match kind {
                    Value::String(raw) => TaskKind::from(raw),
                    other => TaskKind::Unknown(other.to_string()),
                };
                (id, kind)
            })
            .collect();

        let completed_tasks = completed
            .into_iter()
            .map(|(id, entry)| {
                let entry = serde_json::from_value(entry.clone())
                    .unwrap_or(CompletedEntry::Raw(entry));
                (id, entry)
            })
            .collect();

        Some(Self {
            pending_tasks,
            completed_tasks,
            settings,
        })
    }
}

fn take_map(settings: &mut Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    for key in keys {
        match settings.remove(*key) {
            Some(Value::Object(map)) => return map,
            Some(Value::Null) | None => continue,
            Some(other) => {
                warn!("'{}' is not a map ({}), treating it as empty", key, other);
                return Map::new();
            }
        }
    }
    Map::new()
}

/// Durable queue backed by one JSON file. Every mutation is flushed before
/// the call returns.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    state: QueueState,
}

impl QueueStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::Missing(path))
            }
            Err(source) => return Err(StoreError::Read { path, source }.into()),
        };

        let document: Value = serde_json::from_str(&text).map_err(|e| QueueError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let state = QueueState::from_document(document).ok_or_else(|| QueueError::Malformed {
            path: path.clone(),
            reason: "top level is not an object".to_string(),
        })?;

        info!(
            "Loaded queue from {}: {} pending, {} completed",
            path.display(),
            state.pending_tasks.len(),
            state.completed_tasks.len()
        );
        Ok(Self { path, state })
    }

    /// Like [`QueueStore::load`], but a missing file yields an empty queue.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        match Self::load(path.clone()) {
            Err(QueueError::Missing(_)) => Ok(Self {
                path,
                state: QueueState::default(),
            }),
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    pub fn settings(&self) -> &Map<String, Value> {
        &self.state.settings
    }

    /// Pending tasks in file order.
    pub fn pending(&self) -> Vec<(String, TaskKind)> {
        self.state
            .pending_tasks
            .iter()
            .map(|(id, kind)| (id.clone(), kind.clone()))
            .collect()
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.state.pending_tasks.contains_key(task_id)
    }

    pub fn completed(&self, task_id: &str) -> Option<&CompletedEntry> {
        self.state.completed_tasks.get(task_id)
    }

    /// Move a pending task to the completed set and flush.
    ///
    /// If the flush fails the in-memory state is rolled back, so memory and
    /// disk agree.
    pub fn complete(&mut self, task_id: &str, outcome: CompletedTask) -> Result<(), QueueError> {
        let Some((index, id, kind)) = self.state.pending_tasks.shift_remove_full(task_id) else {
            return Err(QueueError::NotPending(task_id.to_string()));
        };
        let previous = self.state.completed_tasks.shift_remove(task_id);
        self.state
            .completed_tasks
            .insert(id.clone(), CompletedEntry::Task(outcome));

        if let Err(e) = self.flush() {
            self.state.completed_tasks.shift_remove(&id);
            if let Some(previous) = previous {
                self.state.completed_tasks.insert(id.clone(), previous);
            }
            self.state.pending_tasks.shift_insert(index, id, kind);
            return Err(e);
        }

        debug!("Task '{}' recorded as completed", task_id);
        Ok(())
    }

    /// Add a pending task. A completed entry with the same id is dropped so
    /// the task lives in exactly one set. Rolled back if the flush fails.
    pub fn enqueue(&mut self, task_id: &str, kind: TaskKind) -> Result<(), QueueError> {
        let completed = self.state.completed_tasks.shift_remove_full(task_id);
        let pending = self.state.pending_tasks.insert(task_id.to_string(), kind);

        if let Err(e) = self.flush() {
            match pending {
                Some(previous) => {
                    self.state.pending_tasks.insert(task_id.to_string(), previous);
                }
                None => {
                    self.state.pending_tasks.shift_remove(task_id);
                }
            }
            if let Some((index, id, entry)) = completed {
                self.state.completed_tasks.shift_insert(index, id, entry);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Operator-requested retry of a completed task.
    pub fn requeue(&mut self, task_id: &str) -> Result<TaskKind, QueueError> {
        let Some(entry) = self.state.completed_tasks.get(task_id) else {
            return Err(QueueError::NotCompleted(task_id.to_string()));
        };
        let kind = entry
            .kind()
            .unwrap_or_else(|| TaskKind::Unknown(String::new()));

        self.enqueue(task_id, kind.clone())?;
        Ok(kind)
    }

    pub fn flush(&self) -> Result<(), QueueError> {
        write_json_atomic(&self.path, &self.state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_queue(dir: &TempDir, document: Value) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_task_kind_parsing() {
        assert_eq!(TaskKind::from("search".to_string()), TaskKind::Search);
        assert_eq!(TaskKind::from("user_reels".to_string()), TaskKind::UserFeed);
        assert_eq!(
            TaskKind::from("hashtag".to_string()),
            TaskKind::Unknown("hashtag".to_string())
        );
        assert_eq!(String::from(TaskKind::UserFeed), "user_feed");
    }

    #[test]
    fn test_status_text_round_trip() {
        let status = TaskStatus::RuntimeError("tab crashed".to_string());
        assert_eq!(status.to_string(), "Runtime Error: tab crashed");
        assert_eq!(TaskStatus::from(status.to_string()), status);
        assert_eq!(
            TaskStatus::from("No Results Found".to_string()),
            TaskStatus::NoResultsFound
        );
    }

    #[test]
    fn test_load_keeps_settings_and_order() {
        let dir = TempDir::new().unwrap();
        let path = write_queue(
            &dir,
            json!({
                "search_target": 40,
                "pending_tasks": { "zebra": "search", "alpha": "user_feed", "odd": "podcast" }
            }),
        );

        let queue = QueueStore::load(&path).unwrap();
        let pending = queue.pending();
        assert_eq!(pending[0], ("zebra".to_string(), TaskKind::Search));
        assert_eq!(pending[1], ("alpha".to_string(), TaskKind::UserFeed));
        assert_eq!(pending[2].1, TaskKind::Unknown("podcast".to_string()));
        assert_eq!(queue.settings()["search_target"], json!(40));
        assert!(queue.state().completed_tasks.is_empty());
    }

    #[test]
    fn test_malformed_task_maps_default_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = write_queue(&dir, json!({ "pending_tasks": ["a", "b"], "completed_tasks": 3 }));

        let queue = QueueStore::load(&path).unwrap();
        assert!(queue.pending().is_empty());
        assert!(queue.state().completed_tasks.is_empty());
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ pending_tasks: ").unwrap();
        assert!(matches!(QueueStore::load(&path), Err(QueueError::Malformed { .. })));

        let missing = dir.path().join("absent.json");
        assert!(matches!(QueueStore::load(&missing), Err(QueueError::Missing(_))));
        assert!(QueueStore::load_or_default(&missing).unwrap().pending().is_empty());
    }

    #[test]
    fn test_complete_moves_task_and_flushes() {
        let dir = TempDir::new().unwrap();
        let path = write_queue(
            &dir,
            json!({ "headless": true, "pending_tasks": { "cats": "search", "dogs": "search" } }),
        );

        let mut queue = QueueStore::load(&path).unwrap();
        let outcome = CompletedTask::new(TaskKind::Search, TaskStatus::Completed)
            .with_output("search/cats.json", 12, 30);
        queue.complete("cats", outcome.clone()).unwrap();

        let reloaded = QueueStore::load(&path).unwrap();
        assert!(!reloaded.is_pending("cats"));
        assert!(reloaded.is_pending("dogs"));
        assert_eq!(reloaded.completed("cats"), Some(&CompletedEntry::Task(outcome)));
        assert_eq!(reloaded.settings()["headless"], json!(true));

        let again = CompletedTask::new(TaskKind::Search, TaskStatus::Completed);
        assert!(matches!(
            queue.complete("cats", again),
            Err(QueueError::NotPending(_))
        ));
    }

    #[test]
    fn test_legacy_entries_are_preserved() {
        let dir = TempDir::new().unwrap();
        let legacy = json!({ "type": "user_reels", "status": "Completed", "updated": "2024-03-01 10:00:00" });
        let path = write_queue(
            &dir,
            json!({ "queries": { "new": "search" }, "completed_queries": { "old": legacy.clone() } }),
        );

        let mut queue = QueueStore::load(&path).unwrap();
        assert_eq!(queue.pending(), vec![("new".to_string(), TaskKind::Search)]);
        assert_eq!(queue.completed("old"), Some(&CompletedEntry::Raw(legacy)));

        assert_eq!(queue.requeue("old").unwrap(), TaskKind::UserFeed);
        assert!(queue.is_pending("old"));
        assert!(queue.completed("old").is_none());
    }

    #[test]
    fn test_enqueue_keeps_sets_disjoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.json");

        let mut queue = QueueStore::load_or_default(&path).unwrap();
        queue.enqueue("cats", TaskKind::Search).unwrap();
        queue
            .complete("cats", CompletedTask::new(TaskKind::Search, TaskStatus::NoResultsFound))
            .unwrap();
        queue.enqueue("cats", TaskKind::Search).unwrap();

        let reloaded = QueueStore::load(&path).unwrap();
        assert!(reloaded.is_pending("cats"));
        assert!(reloaded.completed("cats").is_none());
    }

    /// Swap the queue file for a directory so the next flush cannot land.
    fn block_writes(path: &Path) {
        std::fs::remove_file(path).unwrap();
        std::fs::create_dir(path).unwrap();
    }

    fn unblock_writes(path: &Path) {
        std::fs::remove_dir(path).unwrap();
    }

    #[test]
    fn test_failed_flush_keeps_task_pending() {
        let dir = TempDir::new().unwrap();
        let path = write_queue(&dir, json!({ "pending_tasks": { "cats": "search", "dogs": "search" } }));
        let mut queue = QueueStore::load(&path).unwrap();

        block_writes(&path);
        let result = queue.complete("cats", CompletedTask::new(TaskKind::Search, TaskStatus::Completed));
        assert!(matches!(result, Err(QueueError::Storage(_))));
        assert_eq!(
            queue.pending(),
            vec![
                ("cats".to_string(), TaskKind::Search),
                ("dogs".to_string(), TaskKind::Search)
            ]
        );
        assert!(queue.completed("cats").is_none());

        // what reaches disk once writes work again is the rolled-back state
        unblock_writes(&path);
        queue.flush().unwrap();
        let reloaded = QueueStore::load(&path).unwrap();
        assert!(reloaded.is_pending("cats"));
        assert!(reloaded.completed("cats").is_none());
    }

    #[test]
    fn test_failed_enqueue_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = write_queue(
            &dir,
            json!({
                "pending_tasks": { "dogs": "search" },
                "completed_tasks": { "cats": { "kind": "search", "status": "No Results Found",
                    "updated_at": "2024-03-01T10:00:00Z", "output_path": null, "count": 0 } }
            }),
        );
        let mut queue = QueueStore::load(&path).unwrap();
        let before = queue.state().clone();

        block_writes(&path);
        assert!(queue.enqueue("cats", TaskKind::Search).is_err());
        assert!(queue.enqueue("dogs", TaskKind::UserFeed).is_err());
        assert!(queue.enqueue("birds", TaskKind::Search).is_err());
        assert_eq!(queue.state(), &before);
    }
}
