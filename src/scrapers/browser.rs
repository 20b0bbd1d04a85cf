//! Chromium-backed browser sessions.
//!
//! Each session is one launched (or remotely attached) browser with a single
//! tab. The CDP handler runs on its own task; when that task ends the
//! session reports itself unhealthy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[cfg(feature = "browser")]
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams;
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
#[cfg(feature = "browser")]
use chromiumoxide::element::Element;
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use tokio::task::JoinHandle;

#[cfg(feature = "browser")]
use super::challenge::looks_like_challenge;
#[cfg(feature = "browser")]
use super::retry::DelayRange;
#[cfg(feature = "browser")]
use super::session::PageSnapshot;
use super::session::{BrowserSession, SessionError, SessionProvider};
use super::shutdown::Shutdown;

/// Browser launch and page-handling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Run without a visible window.
    pub headless: bool,
    /// Explicit Chrome/Chromium binary; searched for when unset.
    pub chrome_path: Option<PathBuf>,
    /// Attach to an already running browser (`ws://host:9222`) instead of
    /// launching one.
    pub remote_url: Option<String>,
    /// Proxy server URL (e.g. "socks5://127.0.0.1:1080").
    pub proxy: Option<String>,
    /// Additional Chrome arguments.
    pub chrome_args: Vec<String>,
    /// Navigation timeout in seconds.
    pub page_timeout: u64,
    /// How long to wait for an element to appear, in seconds.
    pub element_timeout: u64,
    /// Delivery postal code applied during session setup.
    pub postal_code: Option<String>,
}

impl BrowserSettings {
    /// Whether sessions launch (and so may close) their own browser rather
    /// than attach to one that outlives them.
    pub fn owns_browser(&self) -> bool {
        self.remote_url.is_none()
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            remote_url: None,
            proxy: None,
            chrome_args: Vec::new(),
            page_timeout: 30,
            element_timeout: 10,
            postal_code: Some("11229".to_string()),
        }
    }
}

#[cfg(feature = "browser")]
mod selectors {
    pub const CHALLENGE_IMAGE: &str = "form[action='/errors/validateCaptcha'] img";
    pub const CHALLENGE_INPUT: &str = "#captchacharacters";
    pub const CHALLENGE_SUBMIT: &str = "form[action='/errors/validateCaptcha'] button[type='submit']";
    pub const LOCATION_OPEN: &str = "#glow-ingress-block";
    pub const LOCATION_INPUT: &str = "#GLUXZipUpdateInput";
    pub const LOCATION_APPLY: &str = "#GLUXZipUpdate input";
    pub const LOCATION_DONE: &str = "#GLUXConfirmClose";
    pub const COOKIE_ACCEPT: &str = "#sp-cc-accept";
    pub const OFFERS_OPEN: &str = "#dynamic-aod-ingress-box a";
    pub const OFFERS_LIST: &str = "#aod-offer-list";
}

/// Launches one Chromium session per `acquire`.
pub struct ChromeSessionProvider {
    settings: BrowserSettings,
    #[cfg_attr(not(feature = "browser"), allow(dead_code))]
    settle: super::retry::DelayRange,
    #[cfg_attr(not(feature = "browser"), allow(dead_code))]
    shutdown: Shutdown,
}

impl ChromeSessionProvider {
    pub fn new(settings: BrowserSettings, settle: super::retry::DelayRange) -> Self {
        Self {
            settings,
            settle,
            shutdown: Shutdown::never(),
        }
    }

    /// Sessions stop waiting on the page once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[cfg(feature = "browser")]
impl ChromeSessionProvider {
    const CHROME_PATHS: &'static [&'static str] = &[
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/snap/bin/chromium",
        "/opt/google/chrome/google-chrome",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    fn find_chrome(&self) -> Result<PathBuf, SessionError> {
        if let Some(path) = &self.settings.chrome_path {
            return Ok(path.clone());
        }
        Self::CHROME_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or_else(|| {
                SessionError::Launch(
                    "Chrome/Chromium not found; set browser.chrome_path or install chromium"
                        .to_string(),
                )
            })
    }

    async fn launch(&self) -> Result<(Browser, chromiumoxide::Handler), SessionError> {
        let chrome = self.find_chrome()?;
        info!(
            "Launching browser {} (headless={})",
            chrome.display(),
            self.settings.headless
        );

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome)
            .request_timeout(Duration::from_secs(self.settings.page_timeout));
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(proxy) = &self.settings.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-gpu");
        for arg in &self.settings.chrome_args {
            builder = builder.arg(arg);
        }

        let config = builder.build().map_err(SessionError::Launch)?;
        Browser::launch(config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))
    }

    async fn connect(&self, remote_url: &str) -> Result<(Browser, chromiumoxide::Handler), SessionError> {
        info!("Attaching to remote browser at {}", remote_url);
        let handler_config = chromiumoxide::handler::HandlerConfig {
            request_timeout: Duration::from_secs(self.settings.page_timeout),
            ..Default::default()
        };
        Browser::connect_with_config(remote_url, handler_config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl SessionProvider for ChromeSessionProvider {
    async fn acquire(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let (browser, mut handler) = match &self.settings.remote_url {
            Some(url) => self.connect(url).await?,
            None => self.launch().await?,
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(SessionError::Launch(e.to_string()));
            }
        };

        Ok(Box::new(ChromeSession {
            browser,
            page,
            handler_task,
            settings: self.settings.clone(),
            settle: self.settle,
            shutdown: self.shutdown.clone(),
        }))
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl SessionProvider for ChromeSessionProvider {
    async fn acquire(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let _ = &self.settings;
        Err(SessionError::Unsupported)
    }
}

#[cfg(feature = "browser")]
pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    settings: BrowserSettings,
    settle: DelayRange,
    shutdown: Shutdown,
}

#[cfg(feature = "browser")]
impl ChromeSession {
    fn protocol(e: impl std::fmt::Display) -> SessionError {
        SessionError::Protocol(e.to_string())
    }

    async fn snapshot(&self) -> Result<PageSnapshot, SessionError> {
        let url = self
            .page
            .url()
            .await
            .map_err(Self::protocol)?
            .unwrap_or_default();
        let html = self.page.content().await.map_err(Self::protocol)?;
        Ok(PageSnapshot::new(url, html))
    }

    /// Poll for `selector` until it appears or the element timeout passes.
    async fn wait_for(&self, selector: &str) -> Result<Element, SessionError> {
        let timeout = Duration::from_secs(self.settings.element_timeout);
        let found = tokio::time::timeout(timeout, async {
            loop {
                if let Ok(element) = self.page.find_element(selector).await {
                    return Ok(element);
                }
                if !self.shutdown.sleep(Duration::from_millis(250)).await {
                    return Err(SessionError::Interrupted);
                }
            }
        })
        .await;

        found.map_err(|_| SessionError::ElementMissing(selector.to_string()))?
    }

    async fn pause(&self) -> Result<(), SessionError> {
        if self.shutdown.sleep(self.settle.sample()).await {
            Ok(())
        } else {
            Err(SessionError::Interrupted)
        }
    }

    async fn open_offers_panel(&self) -> Result<PageSnapshot, SessionError> {
        self.page
            .find_element(selectors::OFFERS_OPEN)
            .await
            .map_err(|_| SessionError::ElementMissing(selectors::OFFERS_OPEN.to_string()))?
            .click()
            .await
            .map_err(Self::protocol)?;
        self.wait_for(selectors::OFFERS_LIST).await?;
        self.pause().await?;
        self.snapshot().await
    }

    async fn click(&self, selector: &str) -> Result<(), SessionError> {
        self.wait_for(selector)
            .await?
            .click()
            .await
            .map_err(Self::protocol)?;
        Ok(())
    }

    async fn set_postal_code(&self, postal_code: &str) -> Result<(), SessionError> {
        self.click(selectors::LOCATION_OPEN).await?;
        self.pause().await?;

        let input = self.wait_for(selectors::LOCATION_INPUT).await?;
        input.click().await.map_err(Self::protocol)?;
        input.type_str(postal_code).await.map_err(Self::protocol)?;
        self.click(selectors::LOCATION_APPLY).await?;
        self.pause().await?;

        if let Ok(done) = self.page.find_element(selectors::LOCATION_DONE).await {
            let _ = done.click().await;
        }
        info!("Delivery location set to {}", postal_code);
        Ok(())
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<PageSnapshot, SessionError> {
        let timeout = Duration::from_secs(self.settings.page_timeout);
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(SessionError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(SessionError::Timeout(timeout)),
        }
        self.snapshot().await
    }

    fn is_challenge_present(&self, page: &PageSnapshot) -> bool {
        looks_like_challenge(page)
    }

    async fn capture_challenge(&mut self) -> Result<Vec<u8>, SessionError> {
        self.wait_for(selectors::CHALLENGE_IMAGE)
            .await?
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(Self::protocol)
    }

    async fn submit_challenge_answer(
        &mut self,
        answer: &str,
    ) -> Result<PageSnapshot, SessionError> {
        let input = self.wait_for(selectors::CHALLENGE_INPUT).await?;
        input.click().await.map_err(Self::protocol)?;
        input.type_str(answer).await.map_err(Self::protocol)?;

        self.click(selectors::CHALLENGE_SUBMIT).await?;
        if let Err(e) = self.page.wait_for_navigation().await {
            debug!("No navigation after challenge submit: {}", e);
        }
        self.snapshot().await
    }

    async fn clear_cookies(&mut self) -> Result<(), SessionError> {
        self.page
            .execute(ClearBrowserCookiesParams::default())
            .await
            .map_err(Self::protocol)?;
        Ok(())
    }

    async fn normalize(&mut self) -> Result<(), SessionError> {
        if let Some(postal_code) = self.settings.postal_code.clone() {
            if let Err(e) = self.set_postal_code(&postal_code).await {
                warn!("Could not set delivery location: {}", e);
            }
        }

        if let Ok(accept) = self.page.find_element(selectors::COOKIE_ACCEPT).await {
            if accept.click().await.is_ok() {
                debug!("Accepted cookie banner");
            }
        }

        self.page.reload().await.map_err(Self::protocol)?;
        Ok(())
    }

    async fn reveal_offers(&mut self, page: PageSnapshot) -> PageSnapshot {
        match self.open_offers_panel().await {
            Ok(expanded) => expanded,
            Err(e) => {
                debug!("Offers panel not available: {}", e);
                page
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.handler_task.is_finished()
    }

    async fn teardown(mut self: Box<Self>) -> Result<(), SessionError> {
        // An attached browser belongs to someone else; only drop our tab.
        let result = if self.settings.owns_browser() {
            let closed = self.browser.close().await.map(|_| ()).map_err(Self::protocol);
            let _ = self.browser.wait().await;
            closed
        } else {
            self.page.clone().close().await.map_err(Self::protocol)
        };
        self.handler_task.abort();
        result
    }
}
