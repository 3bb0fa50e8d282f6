//! What the automation needs from a browser page.
//!
//! Element handles are cycle-scoped: the document owns the node, callers only borrow a reference
//! that goes [`DriverError::Stale`] as soon as the page re-renders.

use std::{future::Future, time::Duration};

use tokio::time::Instant;

/// Granularity of every bounded wait below
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How to find an element
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Locator {
	/// A single class name, without the leading dot
	Class(String),
	/// Any CSS selector, including comma-separated lists
	Css(String),
}

impl Locator {
	pub fn class(name: impl Into<String>) -> Self {
		Locator::Class(name.into())
	}

	pub fn css(selector: impl Into<String>) -> Self {
		Locator::Css(selector.into())
	}

	pub fn to_css(&self) -> String {
		match self {
			Locator::Class(name) => format!(".{name}"),
			Locator::Css(selector) => selector.clone(),
		}
	}
}

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum DriverError {
	/// The element no longer belongs to the document
	#[error("element went stale: {0}")]
	Stale(String),
	/// The browser, tab or session is gone
	#[error("browser disconnected: {0}")]
	Disconnected(String),
	#[error("driver timed out: {0}")]
	Timeout(String),
	#[error("{0}")]
	Other(String),
}

impl DriverError {
	/// Transient conditions are retried by the caller instead of failing the run
	pub fn is_transient(&self) -> bool {
		matches!(self, DriverError::Stale(_) | DriverError::Timeout(_))
	}

	/// Maps a raw driver message onto the taxonomy. Substring based, because that is all CDP gives us.
	pub fn classify(message: impl Into<String>) -> Self {
		let message = message.into();
		let lower = message.to_lowercase();
		const DISCONNECTED: &[&str] = &[
			"disconnected",
			"no such window",
			"target closed",
			"session closed",
			"no target with given id",
			"receiver is gone",
			"oneshot canceled",
			"connection closed",
			"websocket",
			"broken pipe",
		];
		const STALE: &[&str] = &[
			"stale",
			"detached",
			"could not find node",
			"no node with given id",
			"node with given id does not belong",
			"cannot find context with specified id",
			"could not compute box model",
			"node is not an element",
			"does not belong to the document",
		];
		if DISCONNECTED.iter().any(|needle| lower.contains(needle)) {
			DriverError::Disconnected(message)
		} else if STALE.iter().any(|needle| lower.contains(needle)) {
			DriverError::Stale(message)
		} else if lower.contains("timed out") || lower.contains("timeout") {
			DriverError::Timeout(message)
		} else {
			DriverError::Other(message)
		}
	}
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Live page the automation drives.
///
/// All element queries take the element by reference; nothing here keeps a node alive.
pub trait QuizPage: Send + Sync {
	type Element: Send + Sync;

	/// Every element currently matching, in document order. No match is `Ok(vec![])`.
	fn find_all(&self, locator: &Locator) -> impl Future<Output = DriverResult<Vec<Self::Element>>> + Send;

	/// Descendants of `parent` matching `locator`
	fn find_within(&self, parent: &Self::Element, locator: &Locator) -> impl Future<Output = DriverResult<Vec<Self::Element>>> + Send;

	/// Rendered text, as the user sees it
	fn text(&self, element: &Self::Element) -> impl Future<Output = DriverResult<String>> + Send;

	fn inner_html(&self, element: &Self::Element) -> impl Future<Output = DriverResult<String>> + Send;

	fn is_displayed(&self, element: &Self::Element) -> impl Future<Output = DriverResult<bool>> + Send;

	/// False when the element carries a `disabled` attribute
	fn is_enabled(&self, element: &Self::Element) -> impl Future<Output = DriverResult<bool>> + Send;

	/// True once the element has been removed from the document
	fn is_stale(&self, element: &Self::Element) -> impl Future<Output = DriverResult<bool>> + Send;

	/// PNG capture of the element's visual region
	fn screenshot(&self, element: &Self::Element) -> impl Future<Output = DriverResult<Vec<u8>>> + Send;

	/// Native (mouse-emulated) click
	fn click(&self, element: &Self::Element) -> impl Future<Output = DriverResult<()>> + Send;

	/// `element.click()` from script, which ignores anything overlapping the element
	fn js_click(&self, element: &Self::Element) -> impl Future<Output = DriverResult<()>> + Send;

	/// Non-mutating liveness probe of the page/session
	fn is_alive(&self) -> impl Future<Output = bool> + Send;
}

/// What "ready" means for a bounded wait
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ready {
	Present,
	Visible,
	Enabled,
	/// Visible and enabled
	Clickable,
}

async fn is_ready<P: QuizPage>(page: &P, element: &P::Element, ready: Ready) -> DriverResult<bool> {
	match ready {
		Ready::Present => Ok(true),
		Ready::Visible => page.is_displayed(element).await,
		Ready::Enabled => page.is_enabled(element).await,
		Ready::Clickable => Ok(page.is_displayed(element).await? && page.is_enabled(element).await?),
	}
}

/// First element matching `locator` that satisfies `ready`, or `None` once `timeout` runs out.
///
/// Candidates that go stale mid-check are skipped; only non-transient errors propagate.
pub async fn wait_for<P: QuizPage>(page: &P, locator: &Locator, ready: Ready, timeout: Duration) -> DriverResult<Option<P::Element>> {
	let deadline = Instant::now() + timeout;
	loop {
		for element in page.find_all(locator).await? {
			match is_ready(page, &element, ready).await {
				Ok(true) => return Ok(Some(element)),
				Ok(false) => {}
				Err(e) if e.is_transient() => {}
				Err(e) => return Err(e),
			}
		}
		let now = Instant::now();
		if now >= deadline {
			return Ok(None);
		}
		tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
	}
}

/// Every element matching `locator`, waiting until there is at least one. Empty means timed out.
pub async fn wait_for_all<P: QuizPage>(page: &P, locator: &Locator, timeout: Duration) -> DriverResult<Vec<P::Element>> {
	let deadline = Instant::now() + timeout;
	loop {
		let found = page.find_all(locator).await?;
		let now = Instant::now();
		if !found.is_empty() || now >= deadline {
			return Ok(found);
		}
		tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
	}
}

/// Waits for a handle we already hold. Staleness is reported, not swallowed: the caller decides.
pub async fn wait_until<P: QuizPage>(page: &P, element: &P::Element, ready: Ready, timeout: Duration) -> DriverResult<bool> {
	let deadline = Instant::now() + timeout;
	loop {
		if is_ready(page, element, ready).await? {
			return Ok(true);
		}
		let now = Instant::now();
		if now >= deadline {
			return Ok(false);
		}
		tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
	}
}

/// True if `element` left the document within `timeout`
pub async fn wait_until_stale<P: QuizPage>(page: &P, element: &P::Element, timeout: Duration) -> DriverResult<bool> {
	let deadline = Instant::now() + timeout;
	loop {
		if page.is_stale(element).await? {
			return Ok(true);
		}
		let now = Instant::now();
		if now >= deadline {
			return Ok(false);
		}
		tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
	}
}
