use std::sync::Arc;

use chromiumoxide::{
	Page,
	browser::{Browser, BrowserConfig},
	cdp::browser_protocol::page::CaptureScreenshotFormat,
	element::Element,
	error::CdpError,
};
use color_eyre::{Result, eyre::eyre};
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::{
	config::BrowserSettings,
	page::{DriverError, DriverResult, Locator, QuizPage},
};

const IS_DISPLAYED_JS: &str = r#"
	function() {
		if (!this.isConnected) return false;
		const style = window.getComputedStyle(this);
		if (style.display === 'none' || style.visibility === 'hidden' || parseFloat(style.opacity) === 0) return false;
		const rect = this.getBoundingClientRect();
		return rect.width > 0 && rect.height > 0;
	}
"#;

const IS_ENABLED_JS: &str = r#"
	function() {
		return !(this.disabled === true || this.hasAttribute('disabled'));
	}
"#;

const IS_STALE_JS: &str = r#"
	function() {
		return !this.isConnected;
	}
"#;

const JS_CLICK: &str = r#"
	function() {
		this.click();
		return true;
	}
"#;

fn driver_err(e: CdpError) -> DriverError {
	DriverError::classify(e.to_string())
}

/// [`QuizPage`] over a chromiumoxide tab
#[derive(Clone)]
pub struct ChromePage {
	page: Page,
}

impl ChromePage {
	pub fn new(page: Page) -> Self {
		Self { page }
	}

	async fn call_bool(&self, element: &Element, function: &str) -> DriverResult<bool> {
		let returns = element.call_js_fn(function, false).await.map_err(driver_err)?;
		Ok(returns.result.value.and_then(|v| v.as_bool()).unwrap_or(false))
	}
}

impl QuizPage for ChromePage {
	type Element = Element;

	async fn find_all(&self, locator: &Locator) -> DriverResult<Vec<Element>> {
		self.page.find_elements(locator.to_css()).await.or_else(not_found_is_empty)
	}

	async fn find_within(&self, parent: &Element, locator: &Locator) -> DriverResult<Vec<Element>> {
		parent.find_elements(locator.to_css()).await.or_else(not_found_is_empty)
	}

	async fn text(&self, element: &Element) -> DriverResult<String> {
		Ok(element.inner_text().await.map_err(driver_err)?.unwrap_or_default())
	}

	async fn inner_html(&self, element: &Element) -> DriverResult<String> {
		Ok(element.inner_html().await.map_err(driver_err)?.unwrap_or_default())
	}

	async fn is_displayed(&self, element: &Element) -> DriverResult<bool> {
		self.call_bool(element, IS_DISPLAYED_JS).await
	}

	async fn is_enabled(&self, element: &Element) -> DriverResult<bool> {
		self.call_bool(element, IS_ENABLED_JS).await
	}

	async fn is_stale(&self, element: &Element) -> DriverResult<bool> {
		match self.call_bool(element, IS_STALE_JS).await {
			Ok(stale) => Ok(stale),
			Err(DriverError::Stale(_)) => Ok(true),
			Err(e) => Err(e),
		}
	}

	async fn screenshot(&self, element: &Element) -> DriverResult<Vec<u8>> {
		element.screenshot(CaptureScreenshotFormat::Png).await.map_err(driver_err)
	}

	async fn click(&self, element: &Element) -> DriverResult<()> {
		element.click().await.map_err(driver_err)?;
		Ok(())
	}

	async fn js_click(&self, element: &Element) -> DriverResult<()> {
		element.call_js_fn(JS_CLICK, false).await.map_err(driver_err)?;
		Ok(())
	}

	async fn is_alive(&self) -> bool {
		self.page.evaluate("1 + 1").await.is_ok()
	}
}

/// Empty query results surface from CDP as a "not found" error on some Chrome versions
fn not_found_is_empty(e: CdpError) -> DriverResult<Vec<Element>> {
	match driver_err(e) {
		DriverError::Other(message) if message.to_lowercase().contains("not found") => Ok(Vec::new()),
		other => Err(other),
	}
}

/// A browser held for the lifetime of the shell, shared by consecutive runs
pub struct BrowserSession {
	browser: Browser,
	handler: JoinHandle<()>,
	page: Arc<ChromePage>,
}

impl BrowserSession {
	/// Launch Chrome with a persistent profile (or attach to a running one) and open the start page
	pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
		let (browser, mut handler) = match &settings.connect_url {
			Some(url) => {
				tracing::info!("Attaching to running browser at {url}");
				Browser::connect(url.as_str()).await.map_err(|e| eyre!("Failed to connect to browser at {url}: {e}"))?
			}
			None => {
				let builder = BrowserConfig::builder().user_data_dir(&settings.user_data_dir);
				let builder = if settings.visible { builder.with_head() } else { builder };
				let config = builder.build().map_err(|e| eyre!("Failed to build browser config: {e}"))?;
				Browser::launch(config).await.map_err(|e| eyre!("Failed to launch browser: {e}"))?
			}
		};

		let handler = tokio::spawn(async move {
			while let Some(event) = handler.next().await {
				if event.is_err() {
					break;
				}
			}
		});

		let page = browser
			.new_page(settings.start_url.as_str())
			.await
			.map_err(|e| eyre!("Failed to open {}: {e}", settings.start_url))?;

		Ok(Self {
			browser,
			handler,
			page: Arc::new(ChromePage::new(page)),
		})
	}

	pub fn page(&self) -> Arc<ChromePage> {
		Arc::clone(&self.page)
	}

	/// Best-effort: the browser may already be gone
	pub async fn close(mut self) {
		if let Err(e) = self.browser.close().await {
			tracing::debug!("Browser close failed (probably already closed): {e}");
		}
		self.handler.abort();
	}
}
