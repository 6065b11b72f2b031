use crawler::{DriverError, Navigator, PageSource, ScrollDirection, ScrollDriver, Snapshot};
use headless_chrome::protocol::cdp::Page;
use headless_chrome::Browser as ChromeBrowser;
use headless_chrome::{LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Page sources shorter than this usually mean the page did not load.
const SUSPICIOUS_SOURCE_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),
    #[error("Navigation error: {0}")]
    NavigationError(String),
    #[error("Login failed: {0}")]
    LoginFailed(String),
    #[error("Screenshot failed: {0}")]
    ScreenshotFailed(String),
    #[error("Browser error: {0}")]
    BrowserError(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub headless: bool,
    pub window_size: (u32, u32),
    pub disable_images: bool,
    pub executable: Option<PathBuf>,
    pub idle_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: false,
            window_size: (1920, 1080),
            disable_images: false,
            executable: None,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub login_url: String,
    pub username_field: String,
    pub password_field: String,
    pub submit_selector: String,
}

pub struct Browser {
    browser: ChromeBrowser,
}

impl Browser {
    pub fn launch(config: &LaunchConfig) -> Result<Self, BrowserError> {
        let mut args: Vec<OsString> = vec![
            "--disable-blink-features=AutomationControlled".into(),
            "--disable-dev-shm-usage".into(),
        ];
        if config.disable_images {
            args.push("--blink-settings=imagesEnabled=false".into());
        }

        let launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .window_size(Some(config.window_size))
            .idle_browser_timeout(config.idle_timeout)
            .path(config.executable.clone())
            .args(args.iter().map(OsString::as_os_str).collect())
            .build()
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let browser = ChromeBrowser::new(launch_options)
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        info!(
            "Browser launched ({})",
            if config.headless { "headless" } else { "windowed" }
        );
        Ok(Self { browser })
    }

    pub fn open_tab(&self, settle: Duration, element_timeout: Duration) -> Result<FeedTab, BrowserError> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;

        // hide the automation flag from page scripts
        tab.evaluate(
            "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})",
            false,
        )?;

        Ok(FeedTab {
            tab,
            settle,
            element_timeout,
        })
    }
}

/// One browsing context, used exclusively by the running task.
pub struct FeedTab {
    tab: Arc<Tab>,
    settle: Duration,
    element_timeout: Duration,
}

impl FeedTab {
    pub fn go_to(&self, url: &str) -> Result<(), BrowserError> {
        info!("Navigating to: {}", url);

        self.tab
            .navigate_to(url)
            .map_err(|e| BrowserError::NavigationError(e.to_string()))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| BrowserError::NavigationError(e.to_string()))?;

        std::thread::sleep(self.settle);
        debug!("Navigation complete");
        Ok(())
    }

    pub fn page_content(&self) -> Result<String, BrowserError> {
        let content = self
            .tab
            .get_content()
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;
        if content.len() < SUSPICIOUS_SOURCE_LEN {
            warn!(
                "Page source is only {} bytes, the page may not have loaded",
                content.len()
            );
        }
        Ok(content)
    }

    pub fn scroll_by_viewport(&self, direction: ScrollDirection) -> Result<(), BrowserError> {
        let script = match direction {
            ScrollDirection::Forward => "window.scrollBy(0, window.innerHeight * 0.9);",
            ScrollDirection::Backward => "window.scrollBy(0, -window.innerHeight * 0.9);",
        };
        self.tab
            .evaluate(script, false)
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;
        Ok(())
    }

    /// Sign in through the site's login form. Succeeds once the username
    /// field is gone from the page.
    pub fn login(&self, credentials: &Credentials) -> Result<(), BrowserError> {
        info!("Logging in as {}", credentials.username);
        self.go_to(&credentials.login_url)?;

        let username = self
            .tab
            .wait_for_element_with_custom_timeout(&credentials.username_field, self.element_timeout)
            .map_err(|e| BrowserError::LoginFailed(format!("username field not found: {}", e)))?;
        username.click()?;
        self.tab.type_str(&credentials.username)?;

        let password = self
            .tab
            .wait_for_element_with_custom_timeout(&credentials.password_field, self.element_timeout)
            .map_err(|e| BrowserError::LoginFailed(format!("password field not found: {}", e)))?;
        password.click()?;
        self.tab.type_str(&credentials.password)?;

        self.tab
            .wait_for_element_with_custom_timeout(&credentials.submit_selector, self.element_timeout)
            .map_err(|e| BrowserError::LoginFailed(format!("submit button not found: {}", e)))?
            .click()?;

        let deadline = Instant::now() + self.element_timeout * 3;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(500));
            if self.tab.find_element(&credentials.username_field).is_err() {
                info!("Login successful");
                return Ok(());
            }
        }

        Err(BrowserError::LoginFailed(
            "login form still present after submitting".to_string(),
        ))
    }

    pub fn save_screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        let png = self
            .tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| BrowserError::ScreenshotFailed(e.to_string()))?;

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| BrowserError::ScreenshotFailed(e.to_string()))?;
        }
        std::fs::write(path, png).map_err(|e| BrowserError::ScreenshotFailed(e.to_string()))?;
        info!("Screenshot saved to {}", path.display());
        Ok(())
    }
}

impl Navigator for FeedTab {
    fn navigate(&mut self, url: &Url) -> Result<(), DriverError> {
        self.go_to(url.as_str())
            .map_err(|e| DriverError::Navigation(e.to_string()))
    }
}

impl ScrollDriver for FeedTab {
    fn scroll(&mut self, direction: ScrollDirection) -> Result<(), DriverError> {
        self.scroll_by_viewport(direction)
            .map_err(|e| DriverError::Scroll(e.to_string()))
    }
}

impl PageSource for FeedTab {
    fn snapshot(&mut self) -> Result<Snapshot, DriverError> {
        self.page_content()
            .map(Snapshot::new)
            .map_err(|e| DriverError::Snapshot(e.to_string()))
    }
}
