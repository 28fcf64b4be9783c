//! The render operation: URL in, full-page raster out.
//!
//! Every call acquires a fresh rendering context from a [`ContextLauncher`],
//! bounds the navigate-and-settle phase by a deadline, captures the whole
//! scrollable page and tears the context down on every exit path.

use crate::RenderError;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Produces a full-page image for a URL or fails.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<Vec<u8>, RenderError>;
}

/// An isolated, single-use environment that loads one page.
#[async_trait::async_trait]
pub trait RenderingContext: Send + Sync {
    /// Navigate and wait until the page's network activity settles.
    async fn navigate(&self, url: &str) -> Result<(), RenderError>;

    /// Capture the entire scrollable page.
    async fn capture_full_page(&self) -> Result<Vec<u8>, RenderError>;

    /// Release every resource held by the context.
    async fn teardown(self: Box<Self>);
}

#[async_trait::async_trait]
pub trait ContextLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn RenderingContext>, RenderError>;
}

/// [`Renderer`] over any context launcher.
pub struct PageRenderer<L> {
    launcher: L,
    navigation_timeout: Duration,
}

impl<L: ContextLauncher> PageRenderer<L> {
    pub fn new(launcher: L, navigation_timeout: Duration) -> Self {
        Self {
            launcher,
            navigation_timeout,
        }
    }

    async fn load_and_capture(
        &self,
        context: &dyn RenderingContext,
        url: &str,
    ) -> Result<Vec<u8>, RenderError> {
        debug!("Navigating to {}", url);
        match timeout(self.navigation_timeout, context.navigate(url)).await {
            Ok(result) => result?,
            Err(_) => return Err(RenderError::NavigationTimeout(self.navigation_timeout)),
        }
        debug!("Loaded {}", url);

        context.capture_full_page().await
    }
}

#[async_trait::async_trait]
impl<L: ContextLauncher> Renderer for PageRenderer<L> {
    async fn render(&self, url: &str) -> Result<Vec<u8>, RenderError> {
        let start_time = Instant::now();
        let context = self.launcher.launch().await?;

        let result = self.load_and_capture(context.as_ref(), url).await;
        context.teardown().await;

        match &result {
            Ok(bytes) => info!(
                "Captured {} for {} in {}",
                crate::format_bytes(bytes.len()),
                url,
                crate::format_duration(start_time.elapsed())
            ),
            Err(e) => warn!("Render failed for {}: {}", url, e),
        }

        result
    }
}
