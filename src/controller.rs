//! Start/stop surface over one shared page, plus the heartbeat that watches it between runs

use std::{
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use tokio::task::JoinHandle;

use crate::{
	CancellationSignal, RunOutcome,
	config::AppConfig,
	events::EventSink,
	llm::ReasoningService,
	page::QuizPage,
	runner::Runner,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum StartError {
	#[error("automation is already running")]
	AlreadyRunning,
	#[error("the browser window was closed; `launch` a new one first")]
	BrowserClosed,
	#[error("Gemini API key is not configured (set `api_key` in the config file or GEMINI_API_KEY)")]
	MissingApiKey,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Status {
	pub running: bool,
	pub browser_closed: bool,
	pub last_outcome: Option<RunOutcome>,
}

struct ActiveRun {
	cancel: CancellationSignal,
	task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
	active: Option<ActiveRun>,
	browser_closed: bool,
	last_outcome: Option<RunOutcome>,
}

impl State {
	fn running(&self) -> bool {
		self.active.as_ref().is_some_and(|run| !run.task.is_finished())
	}

	/// Forgets a finished run. True if there was one.
	fn reap(&mut self) -> bool {
		match &self.active {
			Some(run) if run.task.is_finished() => {
				self.active = None;
				true
			}
			_ => false,
		}
	}
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
	state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the "at most one run" rule for a page
pub struct Controller<P> {
	page: Arc<P>,
	events: EventSink,
	state: Arc<Mutex<State>>,
	heartbeat: JoinHandle<()>,
}

impl<P: QuizPage + 'static> Controller<P> {
	/// Must be called inside a tokio runtime: the heartbeat starts right away
	pub fn new(page: Arc<P>, events: EventSink) -> Self {
		let state = Arc::new(Mutex::new(State::default()));
		let heartbeat = tokio::spawn(heartbeat(Arc::clone(&page), Arc::clone(&state), events.clone()));
		Self { page, events, state, heartbeat }
	}

	/// Begins a run in the background and returns immediately
	pub fn start<S: ReasoningService + 'static>(&self, config: AppConfig, service: S) -> Result<(), StartError> {
		let mut state = lock(&self.state);
		if state.running() {
			self.events.warn("Automation is already running.");
			return Err(StartError::AlreadyRunning);
		}
		if state.reap() {
			self.events.info("Solver run ended.");
		}
		if state.browser_closed {
			self.events.error("Browser window is closed. Use `launch` to open a new one.");
			return Err(StartError::BrowserClosed);
		}
		if !config.has_api_key() {
			self.events.error(format!("{}", StartError::MissingApiKey));
			return Err(StartError::MissingApiKey);
		}

		let cancel = CancellationSignal::new();
		let runner = Runner::new(Arc::clone(&self.page), service, config, cancel.clone(), self.events.clone());
		let shared = Arc::clone(&self.state);
		let task = tokio::spawn(async move {
			let outcome = runner.run().await;
			lock(&shared).last_outcome = Some(outcome);
		});
		state.active = Some(ActiveRun { cancel, task });
		Ok(())
	}

	/// Raises the current run's cancellation signal. False if nothing was running.
	pub fn stop(&self) -> bool {
		let state = lock(&self.state);
		match &state.active {
			Some(run) if !run.task.is_finished() => {
				run.cancel.raise();
				self.events.info("Stop requested; the run ends at its next checkpoint.");
				true
			}
			_ => {
				self.events.info("Automation is not running.");
				false
			}
		}
	}

	pub fn is_running(&self) -> bool {
		lock(&self.state).running()
	}

	pub fn status(&self) -> Status {
		let state = lock(&self.state);
		Status {
			running: state.running(),
			browser_closed: state.browser_closed,
			last_outcome: state.last_outcome.clone(),
		}
	}

	/// Stops any run and waits for it to wind down
	pub async fn shutdown(self) {
		let active = {
			let mut state = lock(&self.state);
			state.active.take()
		};
		if let Some(run) = active {
			run.cancel.raise();
			if let Err(e) = run.task.await {
				tracing::warn!("Automation task ended abnormally: {e}");
			}
		}
		self.heartbeat.abort();
	}
}

impl<P> Drop for Controller<P> {
	fn drop(&mut self) {
		self.heartbeat.abort();
	}
}

/// Reports finished runs once, and while idle, notices a browser closed by hand
async fn heartbeat<P: QuizPage>(page: Arc<P>, state: Arc<Mutex<State>>, events: EventSink) {
	let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		ticker.tick().await;

		let should_probe = {
			let mut state = lock(&state);
			if state.reap() {
				events.info("Solver run ended.");
			}
			state.active.is_none() && !state.browser_closed
		};
		if !should_probe {
			continue;
		}

		if !page.is_alive().await {
			let mut state = lock(&state);
			if state.active.is_none() && !state.browser_closed {
				state.browser_closed = true;
				events.warn("Browser window was closed. Use `launch` to open a new one.");
			}
		}
	}
}
