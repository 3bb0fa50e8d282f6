//! The automation loop: wait for a question, solve it, click the answer, advance, repeat

use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc, time::Duration};

use rand::Rng as _;
use tokio::time::Instant;

use crate::{
	CancellationSignal, Label, Mode, RunOutcome,
	config::AppConfig,
	events::EventSink,
	extract::{ScrapeAttempt, Scraped, scrape},
	llm::{AnswerSelector, ReasoningService},
	page::{DriverError, DriverResult, Locator, POLL_INTERVAL, QuizPage, Ready, wait_for, wait_until, wait_until_stale},
};

/// Where the loop currently is. Only used for the DEBUG trail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
	Idle,
	WaitingForQuestion,
	BoosterPopupHandling,
	BoosterCompleted,
	Scraped,
	Solved,
	OptionSelected,
	ActionResolved,
	Advancing,
	Submitting,
	Terminated,
}

/// Unwinds a run from wherever it is
#[derive(Debug)]
enum Halt {
	Disconnected(String),
	Failed(String),
}

impl From<DriverError> for Halt {
	fn from(e: DriverError) -> Self {
		match e {
			DriverError::Disconnected(message) => Halt::Disconnected(message),
			other => Halt::Failed(format!("Driver error: {other}")),
		}
	}
}

/// `Continue` loops to the next cycle (or restarts the current one), `Break` ends the run
type Flow = ControlFlow<RunOutcome>;

enum Waited<E> {
	Question(Scraped<E>),
	Finished(RunOutcome),
}

enum Clicked {
	Landed,
	/// The page re-rendered under the handle; start over from the question wait
	WentStale,
}

/// One automation run over a borrowed page. Consumed by [`Runner::run`].
pub struct Runner<P, S> {
	page: Arc<P>,
	selector: AnswerSelector<S>,
	config: AppConfig,
	cancel: CancellationSignal,
	events: EventSink,
	phase: Phase,
}

impl<P: QuizPage, S: ReasoningService> Runner<P, S> {
	pub fn new(page: Arc<P>, service: S, config: AppConfig, cancel: CancellationSignal, events: EventSink) -> Self {
		let selector = AnswerSelector::new(service, config.rate_limit_interval(), config.labels.clone(), events.clone());
		Self {
			page,
			selector,
			config,
			cancel,
			events,
			phase: Phase::Idle,
		}
	}

	fn mode(&self) -> Mode {
		self.config.mode
	}

	fn transition(&mut self, next: Phase) {
		if self.phase != next {
			self.events.debug(format!("State: {:?} -> {next:?}", self.phase));
			self.phase = next;
		}
	}

	/// Drives cycles until something ends the run. Always emits exactly one terminal line.
	pub async fn run(mut self) -> RunOutcome {
		self.banner();

		let outcome = loop {
			match self.cycle().await {
				Ok(ControlFlow::Continue(())) => {}
				Ok(ControlFlow::Break(outcome)) => break outcome,
				Err(Halt::Disconnected(detail)) => {
					tracing::debug!("Disconnect detail: {detail}");
					break RunOutcome::Disconnected;
				}
				Err(Halt::Failed(reason)) => break RunOutcome::Failed(reason),
			}
		};
		self.transition(Phase::Terminated);

		let line = format!("Automation loop finished: {outcome}");
		match &outcome {
			RunOutcome::Failed(_) => self.events.error(line),
			RunOutcome::Disconnected => self.events.warn(line),
			RunOutcome::Completed | RunOutcome::StoppedByUser => self.events.info(line),
		}
		outcome
	}

	fn banner(&self) {
		let selectors = &self.config.selectors;
		self.events.info("Automation loop started. Use `stop` to end it.");
		self.events.info("Make sure the quiz page is open in the browser.");
		let action = match self.mode() {
			Mode::Standard => &selectors.action_button_class,
			Mode::Booster => &selectors.booster_action_selector,
		};
		self.events.debug(format!(
			"Mode: {}; question='{}', option='{}', action='{}'",
			self.mode(),
			selectors.question_class_for(self.mode()),
			selectors.option_card_class,
			action
		));
	}

	async fn cycle(&mut self) -> Result<Flow, Halt> {
		if self.cancel.is_raised() {
			self.events.info("Stop signal received before scraping next question.");
			return Ok(ControlFlow::Break(RunOutcome::StoppedByUser));
		}

		self.transition(Phase::WaitingForQuestion);
		let scraped = match self.wait_for_question().await? {
			Waited::Question(scraped) => scraped,
			Waited::Finished(outcome) => return Ok(ControlFlow::Break(outcome)),
		};
		self.transition(Phase::Scraped);
		let offered: String = scraped.handles.keys().map(|l| l.as_char()).collect();
		let images = scraped.payload.question.iter().chain(scraped.payload.options.values().flatten()).filter(|f| f.is_image()).count();
		self.events.info(format!("Question scraped: options {offered}, {images} image(s)."));
		self.events.debug(format!("Payload:\n{}", scraped.payload));

		let answer = self.selector.select_answer(&scraped.payload).await;
		self.transition(Phase::Solved);

		let Some((label, option)) = self.choose_option(answer, &scraped.handles) else {
			return Err(Halt::Failed("No option elements available to click.".to_string()));
		};
		if let Clicked::WentStale = self.click_option(label, option).await? {
			return Ok(ControlFlow::Continue(()));
		}
		self.transition(Phase::OptionSelected);

		let flow = match self.mode() {
			Mode::Standard => self.advance_standard().await?,
			Mode::Booster => self.advance_booster().await?,
		};
		if flow.is_continue() && self.cancel.is_raised() {
			self.events.info("Stop signal received. Terminating automation loop.");
			return Ok(ControlFlow::Break(RunOutcome::StoppedByUser));
		}
		Ok(flow)
	}

	/// Polls in short slices until a question shows up, the budget runs out, or a mode signal ends the run
	async fn wait_for_question(&mut self) -> Result<Waited<P::Element>, Halt> {
		let slice = self.config.timing.poll_slice();
		let deadline = Instant::now() + self.config.timing.question_wait();

		loop {
			if self.cancel.is_raised() {
				self.events.info("Stop signal received while waiting for next question.");
				return Ok(Waited::Finished(RunOutcome::StoppedByUser));
			}
			let attempt_started = Instant::now();

			if self.mode() == Mode::Booster {
				if self.booster_finished().await? {
					self.transition(Phase::BoosterCompleted);
					self.close_booster().await;
					return Ok(Waited::Finished(RunOutcome::Completed));
				}
				if self.dismiss_popup().await? {
					self.transition(Phase::WaitingForQuestion);
					if Instant::now() >= deadline {
						break;
					}
					continue;
				}
			}

			match scrape(&*self.page, &self.config.selectors, self.mode(), &self.config.labels, slice).await {
				ScrapeAttempt::Found(scraped) => return Ok(Waited::Question(scraped)),
				ScrapeAttempt::NotYetPresent => {}
				ScrapeAttempt::Disconnected(message) => return Err(Halt::Disconnected(message)),
				ScrapeAttempt::Fatal(message) => return Err(Halt::Failed(message)),
			}

			if Instant::now() >= deadline {
				break;
			}
			// a stale query returns instantly; don't spin on it
			tokio::time::sleep_until((attempt_started + POLL_INTERVAL).min(deadline)).await;
		}

		Err(Halt::Failed(format!(
			"Timed out waiting for question/options after {:.0}s.",
			self.config.timing.question_wait().as_secs_f64()
		)))
	}

	/// Only a disconnect escapes; everything else is treated as "signal absent"
	fn tolerate<T>(&self, result: DriverResult<T>, fallback: T, context: &str) -> Result<T, Halt> {
		match result {
			Ok(value) => Ok(value),
			Err(DriverError::Disconnected(message)) => Err(Halt::Disconnected(message)),
			Err(e) => {
				tracing::debug!("{context}: {e}");
				Ok(fallback)
			}
		}
	}

	async fn booster_finished(&self) -> Result<bool, Halt> {
		let found = self.page.find_all(&Locator::class(&self.config.selectors.booster_finished_class)).await;
		Ok(!self.tolerate(found, Vec::new(), "Completion screen check failed")?.is_empty())
	}

	/// Best-effort: the run is complete whether or not the close button cooperates
	async fn close_booster(&self) {
		self.events.info("Booster quiz finished (completion screen detected).");
		let buttons = self
			.page
			.find_all(&Locator::css(&self.config.selectors.booster_action_selector))
			.await
			.unwrap_or_default();
		for button in &buttons {
			let ready = wait_until(&*self.page, button, Ready::Clickable, Duration::ZERO).await.unwrap_or(false);
			if !ready {
				continue;
			}
			match self.click(button).await {
				Ok(()) => {
					self.events.action("Clicked final 'Next' button to close quiz.");
					tokio::time::sleep(self.config.timing.booster_settle()).await;
				}
				Err(e) => self.events.debug(format!("Closing the completion screen failed: {e}")),
			}
			break;
		}
	}

	/// Clicks through a visible interstitial popup. True if one was handled.
	async fn dismiss_popup(&mut self) -> Result<bool, Halt> {
		let selectors = &self.config.selectors;
		let found = self.page.find_all(&Locator::class(&selectors.popup_overlay_class)).await;
		let popups = self.tolerate(found, Vec::new(), "Popup check failed")?;
		let continue_locator = Locator::css(&selectors.booster_action_selector);

		for popup in &popups {
			let displayed = self.page.is_displayed(popup).await;
			if !self.tolerate(displayed, false, "Popup visibility check failed")? {
				continue;
			}
			let found = self.page.find_within(popup, &continue_locator).await;
			let Some(button) = self.tolerate(found, Vec::new(), "Popup button lookup failed")?.into_iter().next() else {
				continue;
			};
			let displayed = self.page.is_displayed(&button).await;
			if !self.tolerate(displayed, false, "Popup button visibility check failed")? {
				continue;
			}

			self.transition(Phase::BoosterPopupHandling);
			self.events.info("Booster Mode: Popup detected.");
			let clicked = self.click(&button).await;
			if !self.tolerate(clicked.map(|()| true), false, "Popup button click failed")? {
				return Ok(false);
			}
			self.events.action("Booster Mode: Clicked popup button (Continue).");
			tokio::time::sleep(self.config.timing.popup_settle()).await;
			return Ok(true);
		}
		Ok(false)
	}

	/// The solver's label, or the first offered one if the page doesn't have it
	fn choose_option<'h>(&self, answer: Label, handles: &'h BTreeMap<Label, P::Element>) -> Option<(Label, &'h P::Element)> {
		if let Some(handle) = handles.get(&answer) {
			return Some((answer, handle));
		}
		let (fallback, handle) = handles.iter().next()?;
		self.events.info(format!("Desired option '{answer}' not found. Falling back to option '{fallback}'."));
		Some((*fallback, handle))
	}

	/// Native click, retried from script unless the element is gone
	async fn click(&self, element: &P::Element) -> DriverResult<()> {
		match self.page.click(element).await {
			Ok(()) => Ok(()),
			Err(e @ (DriverError::Stale(_) | DriverError::Disconnected(_))) => Err(e),
			Err(e) => {
				self.events.debug(format!("Native click failed ({e}), retrying from script."));
				self.page.js_click(element).await
			}
		}
	}

	async fn click_option(&mut self, label: Label, option: &P::Element) -> Result<Clicked, Halt> {
		match wait_until(&*self.page, option, Ready::Clickable, self.config.timing.action_wait()).await {
			Ok(true) => {}
			Ok(false) => return Err(Halt::Failed(format!("Option '{label}' never became clickable."))),
			Err(e) if e.is_transient() => {
				self.events.warn("Option element became stale (page updated). Re-scraping...");
				return Ok(Clicked::WentStale);
			}
			Err(e) => return Err(e.into()),
		}

		match self.click(option).await {
			Ok(()) => {
				self.events.action(format!("Clicked option '{label}'."));
				Ok(Clicked::Landed)
			}
			Err(DriverError::Stale(_)) => {
				self.events.warn("Option element became stale during click. Re-scraping...");
				Ok(Clicked::WentStale)
			}
			Err(DriverError::Disconnected(message)) => Err(Halt::Disconnected(message)),
			Err(e) => Err(Halt::Failed(format!("Failed to click option '{label}': {e}"))),
		}
	}

	async fn click_action(&self, button: &P::Element, name: &str) -> Result<Clicked, Halt> {
		match self.click(button).await {
			Ok(()) => Ok(Clicked::Landed),
			Err(DriverError::Stale(_)) => {
				self.events.warn(format!("'{name}' button went stale before the click landed. Re-scraping..."));
				Ok(Clicked::WentStale)
			}
			Err(DriverError::Disconnected(message)) => Err(Halt::Disconnected(message)),
			Err(e) => Err(Halt::Failed(format!("Failed to click '{name}' button: {e}"))),
		}
	}

	async fn advance_standard(&mut self) -> Result<Flow, Halt> {
		let timing = self.config.timing.clone();
		let selectors = self.config.selectors.clone();

		let Some(button) = wait_for(&*self.page, &Locator::class(&selectors.action_button_class), Ready::Clickable, timing.action_wait()).await? else {
			return Err(Halt::Failed("Could not find the action button after selecting an option.".to_string()));
		};
		self.transition(Phase::ActionResolved);

		let text = match self.page.text(&button).await {
			Ok(text) => text.trim().to_string(),
			Err(e) if e.is_transient() => {
				self.events.warn("Action button changed while reading it. Re-scraping...");
				return Ok(ControlFlow::Continue(()));
			}
			Err(e) => return Err(e.into()),
		};
		self.events.action(format!("Action button text: '{text}'"));

		if text == selectors.submit_button_text {
			self.transition(Phase::Submitting);
			self.events.action("Submit button detected. Submitting quiz...");
			if let Clicked::WentStale = self.click_action(&button, &text).await? {
				return Ok(ControlFlow::Continue(()));
			}
			match self.await_confirmation().await {
				Ok(true) => self.events.info("Quiz submitted successfully."),
				Ok(false) => self.events.error("Confirmation popup did not appear in time."),
				Err(e) => self.events.error(format!("Driver error during submission confirmation: {e}")),
			}
			// the submission click already happened
			return Ok(ControlFlow::Break(RunOutcome::Completed));
		}

		let recognized = text == selectors.next_button_text;
		if !recognized {
			self.events.info(format!("Unrecognized action button text '{text}'. Clicking it anyway and continuing."));
		}
		self.transition(Phase::Advancing);
		if let Clicked::WentStale = self.click_action(&button, &text).await? {
			return Ok(ControlFlow::Continue(()));
		}
		tokio::time::sleep(timing.next_settle()).await;
		if recognized {
			self.stealth_pause().await;
		}
		Ok(ControlFlow::Continue(()))
	}

	/// Overlay, then its confirm control, clicked from script first. False if either never showed.
	async fn await_confirmation(&self) -> DriverResult<bool> {
		let selectors = &self.config.selectors;
		let deadline = Instant::now() + self.config.timing.confirm_wait();

		let overlay = wait_for(&*self.page, &Locator::class(&selectors.popup_overlay_class), Ready::Present, self.config.timing.confirm_wait()).await?;
		if overlay.is_none() {
			return Ok(false);
		}
		let remaining = deadline.saturating_duration_since(Instant::now());
		let Some(yes) = wait_for(&*self.page, &Locator::class(&selectors.popup_yes_button_class), Ready::Clickable, remaining).await? else {
			return Ok(false);
		};

		if let Err(e) = self.page.js_click(&yes).await {
			self.events.debug(format!("Scripted confirm click failed ({e}), trying a native click."));
			self.page.click(&yes).await?;
		}
		self.events.action("Confirmed submission.");
		Ok(true)
	}

	async fn advance_booster(&mut self) -> Result<Flow, Halt> {
		let timing = self.config.timing.clone();
		let selectors = self.config.selectors.clone();

		let Some(button) = wait_for(&*self.page, &Locator::css(&selectors.booster_action_selector), Ready::Present, timing.action_wait()).await? else {
			return Err(Halt::Failed("Booster Mode: Timed out waiting for the action button.".to_string()));
		};
		self.transition(Phase::ActionResolved);

		match wait_until(&*self.page, &button, Ready::Enabled, timing.action_wait()).await {
			Ok(true) => {}
			Ok(false) => return Err(Halt::Failed("Booster Mode: Timed out waiting for action button to be enabled.".to_string())),
			Err(e) if e.is_transient() => {
				self.events.warn("Booster action button went stale while waiting for it. Re-scraping...");
				return Ok(ControlFlow::Continue(()));
			}
			Err(e) => return Err(e.into()),
		}

		// held only to notice the transition
		let found = self.page.find_all(&Locator::class(&selectors.booster_question_class)).await;
		let current_question = self.tolerate(found, Vec::new(), "Question lookup before advancing failed")?.into_iter().next();

		self.transition(Phase::Advancing);
		if let Clicked::WentStale = self.click_action(&button, "Next/Submit").await? {
			return Ok(ControlFlow::Continue(()));
		}
		self.events.action("Booster Mode: Clicked Next/Submit button.");

		if let Some(question) = current_question {
			match wait_until_stale(&*self.page, &question, timing.booster_transition()).await {
				Ok(true) => {}
				// the SPA may reuse the same node
				Ok(false) => self.events.debug("Question element did not go stale; continuing."),
				Err(DriverError::Disconnected(message)) => return Err(Halt::Disconnected(message)),
				Err(e) => self.events.debug(format!("Transition check failed: {e}")),
			}
		}
		tokio::time::sleep(timing.booster_settle()).await;
		Ok(ControlFlow::Continue(()))
	}

	/// Random human-ish pause between questions, cut short by a stop request
	async fn stealth_pause(&self) {
		let stealth = &self.config.stealth;
		if !stealth.enabled {
			return;
		}
		let (min, max) = stealth.bounds();
		let secs = if max > min { rand::rng().random_range(min..=max) } else { min };
		self.events.info(format!("Stealth Mode: pausing for {secs:.1} seconds..."));

		let deadline = Instant::now() + Duration::try_from_secs_f64(secs).unwrap_or_default();
		while !self.cancel.is_raised() {
			let now = Instant::now();
			if now >= deadline {
				break;
			}
			tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
		}
	}
}
