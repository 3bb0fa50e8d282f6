use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use color_eyre::{Result, eyre::eyre};
use serde::{Deserialize, Serialize};

use crate::{Label, Mode};

pub const DEFAULT_CONFIG_PATH: &str = "quiz_autopilot.toml";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const API_KEY_PLACEHOLDER: &str = "YOUR_API_KEY_HERE";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
	/// Gemini API key. `GEMINI_API_KEY` takes precedence when set.
	pub api_key: String,
	/// Model identifier passed to the reasoning service
	pub model: String,
	/// Minimum seconds between two reasoning calls
	pub rate_limit_interval_secs: f64,
	pub mode: Mode,
	/// Option labels accepted on the page, in their natural order
	pub labels: Vec<Label>,
	pub stealth: StealthConfig,
	pub timing: TimingConfig,
	pub selectors: SelectorConfig,
	pub browser: BrowserSettings,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			api_key: API_KEY_PLACEHOLDER.to_string(),
			model: "gemini-2.5-flash".to_string(),
			rate_limit_interval_secs: 2.0,
			mode: Mode::default(),
			labels: default_labels(),
			stealth: StealthConfig::default(),
			timing: TimingConfig::default(),
			selectors: SelectorConfig::default(),
			browser: BrowserSettings::default(),
		}
	}
}

fn default_labels() -> Vec<Label> {
	['A', 'B', 'C', 'D'].into_iter().filter_map(Label::new).collect()
}

/// Human-like random pause after each "next question" click
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StealthConfig {
	pub enabled: bool,
	pub min_delay_secs: f64,
	pub max_delay_secs: f64,
}

impl Default for StealthConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			min_delay_secs: 5.0,
			max_delay_secs: 20.0,
		}
	}
}

impl StealthConfig {
	/// Bounds as an ordered `(min, max)` pair, clamped to be non-negative
	pub fn bounds(&self) -> (f64, f64) {
		let min = self.min_delay_secs.max(0.0);
		let max = self.max_delay_secs.max(0.0);
		if min <= max { (min, max) } else { (max, min) }
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
	/// Overall budget for a question to show up
	pub question_wait_secs: f64,
	/// Size of one polling slice inside that budget
	pub poll_slice_secs: f64,
	/// Waits for option/action elements to become usable
	pub action_wait_secs: f64,
	/// Wait for the submit confirmation overlay
	pub confirm_wait_secs: f64,
	pub next_settle_secs: f64,
	pub booster_settle_secs: f64,
	pub booster_transition_secs: f64,
	pub popup_settle_secs: f64,
}

impl Default for TimingConfig {
	fn default() -> Self {
		Self {
			question_wait_secs: 300.0,
			poll_slice_secs: 1.0,
			action_wait_secs: 300.0,
			confirm_wait_secs: 300.0,
			next_settle_secs: 0.5,
			booster_settle_secs: 1.0,
			booster_transition_secs: 1.0,
			popup_settle_secs: 1.0,
		}
	}
}

impl TimingConfig {
	pub fn question_wait(&self) -> Duration {
		secs(self.question_wait_secs)
	}

	pub fn poll_slice(&self) -> Duration {
		secs(self.poll_slice_secs).max(Duration::from_millis(50))
	}

	pub fn action_wait(&self) -> Duration {
		secs(self.action_wait_secs)
	}

	pub fn confirm_wait(&self) -> Duration {
		secs(self.confirm_wait_secs)
	}

	pub fn next_settle(&self) -> Duration {
		secs(self.next_settle_secs)
	}

	pub fn booster_settle(&self) -> Duration {
		secs(self.booster_settle_secs)
	}

	pub fn booster_transition(&self) -> Duration {
		secs(self.booster_transition_secs)
	}

	pub fn popup_settle(&self) -> Duration {
		secs(self.popup_settle_secs)
	}
}

/// Class names and CSS selectors of the quiz site
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectorConfig {
	pub question_class: String,
	pub booster_question_class: String,
	pub option_card_class: String,
	pub option_label_class: String,
	pub option_text_class: String,
	pub action_button_class: String,
	pub popup_overlay_class: String,
	pub popup_yes_button_class: String,
	pub booster_action_selector: String,
	pub booster_finished_class: String,
	pub next_button_text: String,
	pub submit_button_text: String,
}

impl Default for SelectorConfig {
	fn default() -> Self {
		Self {
			question_class: "question".to_string(),
			booster_question_class: "boosterQuestion".to_string(),
			option_card_class: "option-card".to_string(),
			option_label_class: "option-label-box".to_string(),
			option_text_class: "option-text".to_string(),
			action_button_class: "selected-btn".to_string(),
			popup_overlay_class: "popup-overlay".to_string(),
			popup_yes_button_class: "yes-btn".to_string(),
			booster_action_selector: ".v2-btn-rgt, .btn-rgt".to_string(),
			booster_finished_class: "proficiency-status".to_string(),
			next_button_text: "Next Question".to_string(),
			submit_button_text: "Submit Quiz".to_string(),
		}
	}
}

impl SelectorConfig {
	pub fn question_class_for(&self, mode: Mode) -> &str {
		match mode {
			Mode::Standard => &self.question_class,
			Mode::Booster => &self.booster_question_class,
		}
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
	/// Run with visible browser window (non-headless mode)
	pub visible: bool,
	/// Attach to an already running Chrome (`http://127.0.0.1:9222`) instead of launching one
	pub connect_url: Option<String>,
	/// Persistent profile so the site login survives restarts
	pub user_data_dir: PathBuf,
	pub start_url: String,
}

impl Default for BrowserSettings {
	fn default() -> Self {
		Self {
			visible: true,
			connect_url: None,
			user_data_dir: PathBuf::from("chrome_data"),
			start_url: "https://app.acadally.com/student".to_string(),
		}
	}
}

impl AppConfig {
	/// Read the config file if it exists, fall back to defaults otherwise, then apply env overrides
	pub fn load(path: &Path) -> Result<Self> {
		let mut config = if path.exists() {
			let raw = std::fs::read_to_string(path).map_err(|e| eyre!("Failed to read config {}: {e}", path.display()))?;
			Self::from_toml(&raw).map_err(|e| eyre!("Failed to parse config {}: {e}", path.display()))?
		} else {
			tracing::debug!("No config at {}, using defaults", path.display());
			Self::default()
		};

		match std::env::var(API_KEY_ENV) {
			Ok(key) if !key.trim().is_empty() => config.api_key = key,
			_ => {}
		}

		Ok(config)
	}

	pub fn from_toml(raw: &str) -> Result<Self> {
		let config: Self = toml::from_str(raw)?;
		Ok(config)
	}

	pub fn has_api_key(&self) -> bool {
		let key = self.api_key.trim();
		!key.is_empty() && key != API_KEY_PLACEHOLDER
	}

	pub fn rate_limit_interval(&self) -> Duration {
		secs(self.rate_limit_interval_secs)
	}
}

fn secs(value: f64) -> Duration {
	Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
