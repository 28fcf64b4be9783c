//! Chrome-backed rendering contexts
//!
//! Each context is its own headless Chrome process with a throwaway profile
//! directory, so nothing (cookies, cache, service workers) leaks from one job
//! into the next. Page load is judged complete with a network-idle heuristic
//! built from CDP network events.

use crate::{Config, ContextLauncher, NetworkIdleSettings, RenderError, RenderingContext};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport as ChromeViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

/// Upper bound on each teardown step so a wedged browser cannot stall the worker.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Generate Chrome command-line arguments based on configuration
///
/// # Examples
///
/// ```rust
/// use capture_pipeline::{Config, chrome_args};
///
/// let args = chrome_args(&Config::default());
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn chrome_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn browser_config(config: &Config, profile_dir: &Path) -> Result<BrowserConfig, RenderError> {
    let viewport = &config.viewport;
    let mut builder = BrowserConfig::builder()
        .window_size(viewport.width, viewport.height)
        .viewport(ChromeViewport {
            width: viewport.width,
            height: viewport.height,
            device_scale_factor: Some(viewport.device_scale_factor),
            emulating_mobile: viewport.mobile,
            is_landscape: viewport.width > viewport.height,
            has_touch: viewport.mobile,
        })
        // CDP requests must outlive the navigation deadline, which is enforced above them.
        .request_timeout(config.navigation_timeout + TEARDOWN_GRACE)
        .user_data_dir(profile_dir)
        .args(chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::LaunchFailed)
}

/// Launches one headless Chrome per rendering context.
pub struct ChromeLauncher {
    config: Config,
}

impl ChromeLauncher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ContextLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderingContext>, RenderError> {
        let profile_dir = std::env::temp_dir().join(format!(
            "capture-pipeline-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&profile_dir)
            .await
            .map_err(|e| RenderError::LaunchFailed(format!("Failed to create profile dir: {e}")))?;

        let browser_config = match browser_config(&self.config, &profile_dir) {
            Ok(browser_config) => browser_config,
            Err(e) => {
                remove_profile_dir(&profile_dir).await;
                return Err(e);
            }
        };

        let (browser, mut handler) = match Browser::launch(browser_config).await {
            Ok(launched) => launched,
            Err(e) => {
                remove_profile_dir(&profile_dir).await;
                return Err(RenderError::LaunchFailed(e.to_string()));
            }
        };

        // The handler drives all CDP traffic and must be polled for the browser to respond
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser handler error: {}", e);
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let mut browser = browser;
                shutdown_browser(&mut browser, handler_task).await;
                remove_profile_dir(&profile_dir).await;
                return Err(RenderError::LaunchFailed(format!("Failed to open page: {e}")));
            }
        };

        debug!("Rendering context ready in {}", profile_dir.display());

        Ok(Box::new(ChromeContext {
            browser: Mutex::new(browser),
            page,
            handler: handler_task,
            profile_dir,
            network_idle: self.config.network_idle,
            navigation_timeout: self.config.navigation_timeout,
        }))
    }
}

pub struct ChromeContext {
    browser: Mutex<Browser>,
    page: Page,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    network_idle: NetworkIdleSettings,
    navigation_timeout: Duration,
}

impl ChromeContext {
    fn navigation_error(&self, err: CdpError) -> RenderError {
        match err {
            CdpError::Timeout => RenderError::NavigationTimeout(self.navigation_timeout),
            other => RenderError::NavigationError(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl RenderingContext for ChromeContext {
    async fn navigate(&self, url: &str) -> Result<(), RenderError> {
        self.page
            .execute(EnableParams::default())
            .await
            .map_err(|e| self.navigation_error(e))?;

        // Listeners go in before navigation so no request of the page load is missed
        let started = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| self.navigation_error(e))?
            .map(|e| NetworkEvent::Started(e.request_id.inner().clone()));
        let finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|e| self.navigation_error(e))?
            .map(|e| NetworkEvent::Finished(e.request_id.inner().clone()));
        let failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|e| self.navigation_error(e))?
            .map(|e| NetworkEvent::Finished(e.request_id.inner().clone()));

        let events = stream::select(started, stream::select(finished, failed));

        self.page.goto(url).await.map_err(|e| self.navigation_error(e))?;

        wait_for_network_idle(events, self.network_idle).await
    }

    async fn capture_full_page(&self) -> Result<Vec<u8>, RenderError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        let bytes = self
            .page
            .screenshot(params)
            .await
            .map_err(|e| RenderError::CaptureError(e.to_string()))?;

        if bytes.is_empty() {
            return Err(RenderError::CaptureError("empty screenshot".into()));
        }

        Ok(bytes)
    }

    async fn teardown(self: Box<Self>) {
        let ChromeContext {
            browser,
            page,
            handler,
            profile_dir,
            ..
        } = *self;

        match timeout(TEARDOWN_GRACE, page.close()).await {
            Ok(Err(e)) => debug!("Page close failed: {}", e),
            Err(_) => debug!("Page close timed out"),
            Ok(Ok(())) => {}
        }

        let mut browser = browser.into_inner();
        shutdown_browser(&mut browser, handler).await;
        remove_profile_dir(&profile_dir).await;
        debug!("Rendering context {} torn down", profile_dir.display());
    }
}

async fn shutdown_browser(browser: &mut Browser, handler: JoinHandle<()>) {
    let closed = matches!(timeout(TEARDOWN_GRACE, browser.close()).await, Ok(Ok(_)));
    if !closed {
        warn!("Browser did not close cleanly, killing process");
        if let Some(Err(e)) = browser.kill().await {
            warn!("Failed to kill browser process: {}", e);
        }
    }

    if let Err(e) = timeout(TEARDOWN_GRACE, browser.wait()).await {
        warn!("Browser process did not exit: {}", e);
    }

    handler.abort();
}

async fn remove_profile_dir(profile_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(profile_dir).await {
        debug!("Failed to remove {}: {}", profile_dir.display(), e);
    }
}

/// Network activity relevant to the idle heuristic, keyed by request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Started(String),
    Finished(String),
}

#[derive(Debug, Default)]
pub struct InflightRequests {
    ids: HashSet<String>,
}

impl InflightRequests {
    pub fn apply(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Started(id) => {
                self.ids.insert(id);
            }
            NetworkEvent::Finished(id) => {
                self.ids.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Resolve once at most `max_inflight` requests have been outstanding for a
/// continuous `idle_window`.
pub async fn wait_for_network_idle<S>(
    events: S,
    settings: NetworkIdleSettings,
) -> Result<(), RenderError>
where
    S: Stream<Item = NetworkEvent>,
{
    futures::pin_mut!(events);
    let mut inflight = InflightRequests::default();
    let mut idle_since = Some(Instant::now());

    loop {
        let next = match idle_since {
            Some(since) => {
                tokio::select! {
                    event = events.next() => event,
                    _ = sleep_until(since + settings.idle_window) => return Ok(()),
                }
            }
            None => events.next().await,
        };

        let Some(event) = next else {
            return Err(RenderError::NavigationError(
                "page went away before the network settled".into(),
            ));
        };

        inflight.apply(event);
        let quiet = inflight.len() <= settings.max_inflight;
        idle_since = match (quiet, idle_since) {
            (true, Some(since)) => Some(since),
            (true, None) => Some(Instant::now()),
            (false, _) => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_inflight: usize) -> NetworkIdleSettings {
        NetworkIdleSettings {
            max_inflight,
            idle_window: Duration::from_millis(20),
        }
    }

    fn then_silence(events: Vec<NetworkEvent>) -> impl Stream<Item = NetworkEvent> {
        stream::iter(events).chain(stream::pending())
    }

    #[test]
    fn test_chrome_args_generation() {
        let config = Config {
            user_agent: Some("capture-bot/1.0".to_string()),
            ..Default::default()
        };
        let args = chrome_args(&config);

        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.contains(&"--window-size=1920,1080".to_string()));
        assert!(args.contains(&"--user-agent=capture-bot/1.0".to_string()));
    }

    #[test]
    fn inflight_tracks_by_request_id() {
        let mut inflight = InflightRequests::default();
        inflight.apply(NetworkEvent::Started("1".into()));
        inflight.apply(NetworkEvent::Started("2".into()));
        // redirects reuse the request id
        inflight.apply(NetworkEvent::Started("2".into()));
        assert_eq!(inflight.len(), 2);

        inflight.apply(NetworkEvent::Finished("1".into()));
        inflight.apply(NetworkEvent::Finished("unknown".into()));
        assert_eq!(inflight.len(), 1);

        inflight.apply(NetworkEvent::Finished("2".into()));
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn settles_after_all_requests_finish() {
        let events = then_silence(vec![
            NetworkEvent::Started("doc".into()),
            NetworkEvent::Started("img".into()),
            NetworkEvent::Finished("doc".into()),
            NetworkEvent::Finished("img".into()),
        ]);
        let result = timeout(Duration::from_secs(1), wait_for_network_idle(events, settings(0))).await;
        assert_eq!(result.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn never_settles_with_persistent_connection() {
        let events = then_silence(vec![NetworkEvent::Started("websocket".into())]);
        let result =
            timeout(Duration::from_millis(200), wait_for_network_idle(events, settings(0))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tolerates_configured_inflight_requests() {
        let events = then_silence(vec![
            NetworkEvent::Started("websocket".into()),
            NetworkEvent::Started("poll".into()),
        ]);
        let result = timeout(Duration::from_secs(1), wait_for_network_idle(events, settings(2))).await;
        assert_eq!(result.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn closed_event_stream_is_a_navigation_error() {
        let events = stream::iter(vec![NetworkEvent::Started("doc".into())]);
        let result = wait_for_network_idle(events, settings(0)).await;
        assert!(matches!(result, Err(RenderError::NavigationError(_))));
    }
}
