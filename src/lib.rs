use std::{
	collections::BTreeMap,
	fmt,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use serde::{Deserialize, Serialize};

pub mod browser;
pub mod config;
pub mod controller;
pub mod events;
pub mod extract;
pub mod llm;
pub mod page;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

/// One option label, e.g. `A`. Always stored uppercase.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "char", into = "char")]
pub struct Label(char);

impl Label {
	/// Answer of last resort when nothing usable came back
	pub const A: Label = Label('A');

	pub fn new(c: char) -> Option<Self> {
		let upper = c.to_ascii_uppercase();
		upper.is_ascii_alphabetic().then_some(Self(upper))
	}

	/// Parses the rendered text of an option-label glyph (`" b "` -> `B`)
	pub fn parse(text: &str) -> Option<Self> {
		let mut chars = text.trim().chars();
		let c = chars.next()?;
		if chars.next().is_some() {
			return None;
		}
		Self::new(c)
	}

	pub fn as_char(self) -> char {
		self.0
	}
}

impl TryFrom<char> for Label {
	type Error = String;

	fn try_from(c: char) -> Result<Self, Self::Error> {
		Self::new(c).ok_or_else(|| format!("'{c}' is not a valid option label"))
	}
}

impl From<Label> for char {
	fn from(label: Label) -> Self {
		label.0
	}
}

impl fmt::Display for Label {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// One unit of extracted content, in reading order
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContentFragment {
	Text(String),
	/// PNG-encoded capture of a single rendered image
	Image(Vec<u8>),
}

impl ContentFragment {
	pub fn is_image(&self) -> bool {
		matches!(self, ContentFragment::Image(_))
	}
}

/// A question and its options, detached from the page they were read from.
///
/// Options are keyed by label, so iteration follows the alphabet rather than DOM order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QuestionPayload {
	pub question: Vec<ContentFragment>,
	pub options: BTreeMap<Label, Vec<ContentFragment>>,
}

impl fmt::Display for QuestionPayload {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fn write_fragments(f: &mut fmt::Formatter<'_>, fragments: &[ContentFragment]) -> fmt::Result {
			let rendered: Vec<String> = fragments
				.iter()
				.map(|fragment| match fragment {
					ContentFragment::Text(text) => text.clone(),
					ContentFragment::Image(bytes) => format!("[image, {} bytes]", bytes.len()),
				})
				.collect();
			write!(f, "{}", rendered.join(" "))
		}

		write_fragments(f, &self.question)?;
		writeln!(f)?;
		for (label, fragments) in &self.options {
			write!(f, "  {label}. ")?;
			write_fragments(f, fragments)?;
			writeln!(f)?;
		}
		Ok(())
	}
}

/// Site behaviour variant, fixed for the duration of a run
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	#[default]
	Standard,
	Booster,
}

impl std::str::FromStr for Mode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"standard" => Ok(Mode::Standard),
			"booster" => Ok(Mode::Booster),
			other => Err(format!("unknown mode '{other}' (expected 'standard' or 'booster')")),
		}
	}
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Mode::Standard => write!(f, "standard"),
			Mode::Booster => write!(f, "booster"),
		}
	}
}

/// How a run ended
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
	Completed,
	StoppedByUser,
	Disconnected,
	Failed(String),
}

impl fmt::Display for RunOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RunOutcome::Completed => write!(f, "completed"),
			RunOutcome::StoppedByUser => write!(f, "stopped by user"),
			RunOutcome::Disconnected => write!(f, "browser disconnected"),
			RunOutcome::Failed(reason) => write!(f, "failed: {reason}"),
		}
	}
}

/// Run-scoped stop flag. Raised once by the controller, polled by the run.
#[derive(Clone, Debug, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn raise(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_raised(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn label_parsing_normalizes_case_and_whitespace() {
		assert_eq!(Label::parse(" b \n"), Label::new('B'));
		assert_eq!(Label::parse("AB"), None);
		assert_eq!(Label::parse(""), None);
		assert_eq!(Label::parse("1"), None);
	}

	#[test]
	fn mode_parses_from_config_strings() {
		assert_eq!("Booster".parse::<Mode>(), Ok(Mode::Booster));
		assert_eq!(" standard ".parse::<Mode>(), Ok(Mode::Standard));
		assert!("turbo".parse::<Mode>().is_err());
	}

	#[test]
	fn cancellation_is_shared_between_clones() {
		let signal = CancellationSignal::new();
		let observer = signal.clone();
		assert!(!observer.is_raised());
		signal.raise();
		assert!(observer.is_raised());
	}
}
