use anyhow::{Context, Result};
use browser::{Credentials, LaunchConfig};
use crawler::{PaginationConfig, StabilityScope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Settings read from the queue file. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub origin: String,
    pub search_path: PathBuf,
    pub user_feed_path: PathBuf,

    pub search_target: usize,
    pub max_steps: usize,
    pub settle_ms: u64,
    pub sweep_settle_ms: u64,
    pub sweep_margin: usize,
    pub render_retries: usize,
    pub render_retry_ms: u64,
    pub idle_warning_steps: usize,
    pub stability_scope: StabilityScope,

    /// `{origin}` and `{query}` are substituted.
    pub search_url_template: String,
    pub user_feed_url_template: String,
    pub search_container: String,
    pub user_feed_container: String,
    pub search_reference_prefixes: Vec<String>,
    pub user_feed_reference_prefixes: Vec<String>,
    pub no_results_text: Option<String>,
    pub results_wait_attempts: usize,
    pub results_wait_ms: u64,
    pub profile_stats_selector: Option<String>,

    pub headless: bool,
    pub disable_images: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub chrome_executable_path: Option<PathBuf>,
    pub navigation_settle_ms: u64,
    pub default_timeout_secs: u64,

    pub username: Option<String>,
    pub password: Option<String>,
    pub login_url: Option<String>,
    pub username_field: String,
    pub password_field: String,
    pub submit_selector: String,

    pub log_file: Option<PathBuf>,
    pub screenshot_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            origin: "https://www.instagram.com".to_string(),
            search_path: PathBuf::from("search"),
            user_feed_path: PathBuf::from("user_feeds"),

            search_target: 100,
            max_steps: 200,
            settle_ms: 1500,
            sweep_settle_ms: 1000,
            sweep_margin: 10,
            render_retries: 3,
            render_retry_ms: 1000,
            idle_warning_steps: 5,
            stability_scope: StabilityScope::Document,

            search_url_template: "{origin}/explore/search/keyword/?q=%23{query}".to_string(),
            user_feed_url_template: "{origin}/{query}/reels/".to_string(),
            search_container: "div.x78zum5.xdt5ytf.xwrv7xz.x1n2onr6.xph46j.xfcsdxf.xsybdxg.x1bzgcud"
                .to_string(),
            user_feed_container: "div.xg7h5cd.x1n2onr6".to_string(),
            search_reference_prefixes: vec!["/p/".to_string()],
            user_feed_reference_prefixes: Vec::new(),
            no_results_text: Some("We couldn't find anything for that search".to_string()),
            results_wait_attempts: 6,
            results_wait_ms: 5000,
            profile_stats_selector: Some("span.x5n08af.x1s688f".to_string()),

            headless: false,
            disable_images: false,
            window_width: 1920,
            window_height: 1080,
            chrome_executable_path: None,
            navigation_settle_ms: 2000,
            default_timeout_secs: 10,

            username: None,
            password: None,
            login_url: None,
            username_field: "input[name='username']".to_string(),
            password_field: "input[name='password']".to_string(),
            submit_selector: "button[type='submit']".to_string(),

            log_file: None,
            screenshot_dir: PathBuf::from("screenshots"),
        }
    }
}

impl Settings {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map.clone())).context("Invalid settings in queue file")
    }

    pub fn origin(&self) -> &str {
        self.origin.trim_end_matches('/')
    }

    pub fn search_pagination(&self) -> PaginationConfig {
        PaginationConfig {
            max_steps: self.max_steps,
            settle: Duration::from_millis(self.settle_ms),
            sweep_settle: Duration::from_millis(self.sweep_settle_ms),
            render_retries: self.render_retries,
            render_retry_delay: Duration::from_millis(self.render_retry_ms),
            idle_warning_steps: self.idle_warning_steps,
            stability_scope: self.stability_scope,
        }
    }

    /// User feeds are probed for depth, so the page gets twice as long to
    /// settle after each forward step.
    pub fn user_feed_pagination(&self) -> PaginationConfig {
        PaginationConfig {
            settle: Duration::from_millis(self.settle_ms.saturating_mul(2)),
            ..self.search_pagination()
        }
    }

    pub fn results_wait(&self) -> Duration {
        Duration::from_millis(self.results_wait_ms)
    }

    pub fn navigation_settle(&self) -> Duration {
        Duration::from_millis(self.navigation_settle_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            headless: self.headless,
            window_size: (self.window_width, self.window_height),
            disable_images: self.disable_images,
            executable: self.chrome_executable_path.clone(),
            ..LaunchConfig::default()
        }
    }

    /// Login details, if both username and password are known.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.username.clone().filter(|u| !u.is_empty())?;
        let password = self.password.clone().filter(|p| !p.is_empty())?;

        Some(Credentials {
            username,
            password,
            login_url: self
                .login_url
                .clone()
                .unwrap_or_else(|| format!("{}/accounts/login/", self.origin())),
            username_field: self.username_field.clone(),
            password_field: self.password_field.clone(),
            submit_selector: self.submit_selector.clone(),
        })
    }
}
