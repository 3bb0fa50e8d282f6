//! Turns live question/option elements into detached, modality-preserving snapshots

use std::{collections::BTreeMap, time::Duration};

use scraper::{ElementRef, Html};

use crate::{
	ContentFragment, Label, Mode, QuestionPayload,
	config::SelectorConfig,
	page::{DriverError, Locator, QuizPage, Ready, wait_for, wait_for_all},
};

/// Tags that flow into their surroundings without a separating space
const INLINE_TAGS: &[&str] = &[
	"a", "abbr", "b", "bdi", "bdo", "cite", "code", "data", "dfn", "em", "font", "i", "kbd", "mark", "q", "s", "samp", "small", "span", "strong", "time", "u", "var",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "template", "noscript"];

/// Flattens inner markup to plain text, keeping exponents and indices: `x<sup>2</sup>` -> `x^2`, `H<sub>2</sub>O` -> `H_2O`.
///
/// Block boundaries become single spaces; the result is trimmed and idempotent on plain text.
pub fn normalize_markup(html: &str) -> String {
	let fragment = Html::parse_fragment(html);
	let mut out = String::new();
	flatten(fragment.root_element(), &mut out);
	collapse_whitespace(&out)
}

fn flatten(element: ElementRef<'_>, out: &mut String) {
	for child in element.children() {
		if let Some(text) = child.value().as_text() {
			out.push_str(text);
			continue;
		}
		let Some(child) = ElementRef::wrap(child) else { continue };
		let name = child.value().name();
		match name {
			"sup" | "sub" => {
				out.push(if name == "sup" { '^' } else { '_' });
				out.push_str(&collapse_whitespace(&child.text().collect::<String>()));
			}
			"br" => out.push(' '),
			_ if SKIPPED_TAGS.contains(&name) => {}
			_ if INLINE_TAGS.contains(&name) => flatten(child, out),
			_ => {
				out.push(' ');
				flatten(child, out);
				out.push(' ');
			}
		}
	}
}

pub fn collapse_whitespace(text: &str) -> String {
	text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reads text, then every visible image, of `root`. Never fails: lost content beats a lost cycle.
pub async fn extract<P: QuizPage>(page: &P, root: &P::Element) -> Vec<ContentFragment> {
	let mut fragments = Vec::new();

	let text = match page.inner_html(root).await {
		Ok(html) => normalize_markup(&html),
		Err(e) => {
			tracing::debug!("Markup extraction failed, falling back to rendered text: {e}");
			page.text(root).await.map(|t| collapse_whitespace(&t)).unwrap_or_default()
		}
	};
	if !text.is_empty() {
		fragments.push(ContentFragment::Text(text));
	}

	let images = match page.find_within(root, &Locator::css("img")).await {
		Ok(images) => images,
		Err(e) => {
			tracing::debug!("Image lookup failed: {e}");
			Vec::new()
		}
	};
	for image in &images {
		if !page.is_displayed(image).await.unwrap_or(false) {
			continue;
		}
		match page.screenshot(image).await {
			Ok(png) => fragments.push(ContentFragment::Image(png)),
			Err(e) => tracing::debug!("Image capture failed: {e}"),
		}
	}

	fragments
}

/// A question read off the page, plus the clickable option cards it came from
pub struct Scraped<E> {
	pub payload: QuestionPayload,
	/// Valid for the current cycle only
	pub handles: BTreeMap<Label, E>,
}

pub enum ScrapeAttempt<E> {
	Found(Scraped<E>),
	/// Nothing (complete) on the page yet; poll again
	NotYetPresent,
	Disconnected(String),
	Fatal(String),
}

impl<E> ScrapeAttempt<E> {
	fn from_driver_error(e: DriverError) -> Self {
		match e {
			DriverError::Disconnected(message) => ScrapeAttempt::Disconnected(message),
			DriverError::Other(message) => ScrapeAttempt::Fatal(message),
			// page re-rendered under us
			DriverError::Stale(_) | DriverError::Timeout(_) => ScrapeAttempt::NotYetPresent,
		}
	}
}

/// One scrape attempt, bounded by `slice` for the question and again for the option cards
pub async fn scrape<P: QuizPage>(page: &P, selectors: &SelectorConfig, mode: Mode, labels: &[Label], slice: Duration) -> ScrapeAttempt<P::Element> {
	let question_locator = Locator::class(selectors.question_class_for(mode));
	let question = match wait_for(page, &question_locator, Ready::Visible, slice).await {
		Ok(Some(question)) => question,
		Ok(None) => return ScrapeAttempt::NotYetPresent,
		Err(e) => return ScrapeAttempt::from_driver_error(e),
	};
	let question_fragments = extract(page, &question).await;

	let cards = match wait_for_all(page, &Locator::class(&selectors.option_card_class), slice).await {
		Ok(cards) if !cards.is_empty() => cards,
		Ok(_) => return ScrapeAttempt::NotYetPresent,
		Err(e) => return ScrapeAttempt::from_driver_error(e),
	};

	let label_locator = Locator::class(&selectors.option_label_class);
	let content_locator = Locator::class(&selectors.option_text_class);
	let mut options = BTreeMap::new();
	let mut handles = BTreeMap::new();
	for card in cards {
		// a re-render between the card lookup and here leaves stale handles; retry the whole scrape
		let label_el = match page.find_within(&card, &label_locator).await {
			Ok(found) => match found.into_iter().next() {
				Some(label_el) => label_el,
				None => continue,
			},
			Err(e) => return ScrapeAttempt::from_driver_error(e),
		};
		let label_text = match page.text(&label_el).await {
			Ok(text) => text,
			Err(e) => return ScrapeAttempt::from_driver_error(e),
		};
		let Some(label) = Label::parse(&label_text).filter(|l| labels.contains(l)) else {
			continue;
		};
		if handles.contains_key(&label) {
			tracing::debug!("Duplicate option label '{label}', keeping the first card");
			continue;
		}

		// the card also renders the label glyph, so prefer the dedicated content element
		let content = match page.find_within(&card, &content_locator).await {
			Ok(found) => found.into_iter().next(),
			Err(e) => return ScrapeAttempt::from_driver_error(e),
		};
		let fragments = extract(page, content.as_ref().unwrap_or(&card)).await;

		options.insert(label, fragments);
		handles.insert(label, card);
	}

	if handles.is_empty() {
		let alphabet: String = labels.iter().map(|l| l.as_char()).collect();
		return ScrapeAttempt::Fatal(format!("No valid options ({alphabet}) found on the page."));
	}

	ScrapeAttempt::Found(Scraped {
		payload: QuestionPayload {
			question: question_fragments,
			options,
		},
		handles,
	})
}
