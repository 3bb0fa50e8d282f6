//! Severity-tagged status lines for whoever drives the automation (CLI shell, GUI bridge).
//!
//! Every line is also mirrored into `tracing`, so a file/terminal subscriber sees the same story.

use std::fmt;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
	Info,
	Warn,
	Error,
	Action,
	Debug,
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let tag = match self {
			Severity::Info => "INFO",
			Severity::Warn => "WARN",
			Severity::Error => "ERROR",
			Severity::Action => "ACTION",
			Severity::Debug => "DEBUG",
		};
		write!(f, "{tag}")
	}
}

#[derive(Clone, Debug)]
pub struct Event {
	pub at: DateTime<Local>,
	pub severity: Severity,
	pub message: String,
}

impl fmt::Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} [{}] {}", self.at.format("%H:%M:%S"), self.severity, self.message)
	}
}

/// Sending half of the event stream. Cheap to clone; sends never block and never fail loudly.
#[derive(Clone, Debug)]
pub struct EventSink {
	tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	pub fn emit(&self, severity: Severity, message: impl Into<String>) {
		let message = message.into();
		match severity {
			Severity::Info => tracing::info!("{message}"),
			Severity::Warn => tracing::warn!("{message}"),
			Severity::Error => tracing::error!("{message}"),
			Severity::Action => tracing::info!(action = true, "{message}"),
			Severity::Debug => tracing::debug!("{message}"),
		}
		// receiver gone means nobody is watching anymore; the run carries on regardless
		let _ = self.tx.send(Event {
			at: Local::now(),
			severity,
			message,
		});
	}

	pub fn info(&self, message: impl Into<String>) {
		self.emit(Severity::Info, message);
	}

	pub fn warn(&self, message: impl Into<String>) {
		self.emit(Severity::Warn, message);
	}

	pub fn error(&self, message: impl Into<String>) {
		self.emit(Severity::Error, message);
	}

	pub fn action(&self, message: impl Into<String>) {
		self.emit(Severity::Action, message);
	}

	pub fn debug(&self, message: impl Into<String>) {
		self.emit(Severity::Debug, message);
	}
}
