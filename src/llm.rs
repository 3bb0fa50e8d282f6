use std::{future::Future, time::Duration};

use base64::Engine as _;
use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use regex::Regex;
use serde_json::json;
use tokio::time::Instant;

use crate::{ContentFragment, Label, QuestionPayload, events::EventSink};

pub const IMAGE_MIME_TYPE: &str = "image/png";

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// One piece of a multimodal request
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Part {
	Text(String),
	Image { mime_type: &'static str, data: Vec<u8> },
}

/// Free-text generation over an ordered list of text/image parts
pub trait ReasoningService: Send + Sync {
	fn generate(&self, system_instruction: &str, parts: &[Part]) -> impl Future<Output = Result<String>> + Send;
}

/// Google Gemini `generateContent` over REST
pub struct GeminiClient {
	http: reqwest::Client,
	api_key: String,
	model: String,
}

impl GeminiClient {
	pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
		let api_key = api_key.into();
		if api_key.trim().is_empty() {
			bail!("API key is required for the Gemini client");
		}
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(120))
			.build()
			.map_err(|e| eyre!("Failed to build HTTP client: {e}"))?;
		Ok(Self {
			http,
			api_key,
			model: model.into(),
		})
	}

	pub fn model(&self) -> &str {
		&self.model
	}
}

impl ReasoningService for GeminiClient {
	async fn generate(&self, system_instruction: &str, parts: &[Part]) -> Result<String> {
		let parts: Vec<serde_json::Value> = parts
			.iter()
			.map(|part| match part {
				Part::Text(text) => json!({ "text": text }),
				Part::Image { mime_type, data } => json!({
					"inline_data": {
						"mime_type": mime_type,
						"data": base64::engine::general_purpose::STANDARD.encode(data),
					}
				}),
			})
			.collect();

		let body = json!({
			"system_instruction": { "parts": [{ "text": system_instruction }] },
			"contents": [{ "role": "user", "parts": parts }],
		});

		let url = format!("{GEMINI_ENDPOINT}/{}:generateContent", self.model);
		let response = self
			.http
			.post(&url)
			.header("x-goog-api-key", &self.api_key)
			.json(&body)
			.send()
			.await
			.map_err(|e| eyre!("Gemini request failed: {e}"))?;

		let status = response.status();
		let json_resp: serde_json::Value = response.json().await.map_err(|e| eyre!("Failed to decode Gemini response: {e}"))?;
		if !status.is_success() {
			let message = json_resp["error"]["message"].as_str().unwrap_or("unknown error");
			bail!("Gemini returned {status}: {message}");
		}

		let text = json_resp["candidates"][0]["content"]["parts"]
			.as_array()
			.map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect::<Vec<_>>().join(""))
			.unwrap_or_default();
		tracing::debug!("Gemini raw response: {text:?}");
		Ok(text)
	}
}

/// Strict spacing between consecutive calls. Serialised through `&mut self`; not meant to be shared.
#[derive(Debug)]
pub struct RateLimiter {
	interval: Duration,
	last_call: Option<Instant>,
}

impl RateLimiter {
	pub fn new(interval: Duration) -> Self {
		Self { interval, last_call: None }
	}

	/// Sleeps out whatever is left of the interval since the previous call, then stamps this one.
	/// Returns how long it slept.
	pub async fn acquire(&mut self) -> Duration {
		let deficit = match self.last_call {
			Some(last) => self.interval.saturating_sub(last.elapsed()),
			None => Duration::ZERO,
		};
		if !deficit.is_zero() {
			tokio::time::sleep(deficit).await;
		}
		self.last_call = Some(Instant::now());
		deficit
	}
}

/// "A, B, C, or D"
fn enumerate_labels(labels: &[Label]) -> String {
	let letters: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
	match letters.as_slice() {
		[] => Label::A.to_string(),
		[only] => only.clone(),
		[first, second] => format!("{first} or {second}"),
		[init @ .., last] => format!("{}, or {last}", init.join(", ")),
	}
}

pub fn system_instruction(labels: &[Label]) -> String {
	let letters = enumerate_labels(labels);
	format!(
		"You are an expert at solving multiple-choice questions.\n\
		You will be given one question and up to {count} options labeled {letters}.\n\
		Carefully analyze any text and images.\n\
		Your entire reply MUST be exactly one single capital letter: {letters}.\n\
		Do not include any explanations, punctuation, or extra characters.\n\
		IMPORTANT: Mathematical expressions may be written with ^ for exponents and _ for indices (e.g. x^2, H_2O). Interpret this syntax correctly.",
		count = labels.len().max(1),
	)
}

fn push_fragments(parts: &mut Vec<Part>, heading: String, fragments: &[ContentFragment]) {
	parts.push(Part::Text(format!("{heading}:")));
	for fragment in fragments {
		match fragment {
			ContentFragment::Text(text) => {
				let text = text.trim();
				if !text.is_empty() {
					parts.push(Part::Text(text.to_string()));
				}
			}
			ContentFragment::Image(data) => parts.push(Part::Image {
				mime_type: IMAGE_MIME_TYPE,
				data: data.clone(),
			}),
		}
	}
}

/// Instruction, question, options in label order, closing reminder
pub fn build_request(payload: &QuestionPayload, labels: &[Label]) -> Vec<Part> {
	let mut parts = vec![Part::Text(
		"You will receive one question and several answer options. Identify the single best answer and respond ONLY with its letter.".to_string(),
	)];
	push_fragments(&mut parts, "Question".to_string(), &payload.question);
	for (label, fragments) in &payload.options {
		push_fragments(&mut parts, format!("Option {label}"), fragments);
	}
	parts.push(Part::Text(format!("Final answer: respond with exactly one capital letter: {}.", enumerate_labels(labels))));
	parts
}

/// Pulls one label out of free text. Total: anything unusable yields the first label.
///
/// Preference order: a standalone letter token, then the first alphabet letter anywhere.
pub struct LabelParser {
	labels: Vec<Label>,
	standalone: Option<Regex>,
}

impl LabelParser {
	pub fn new(labels: &[Label]) -> Self {
		let class: String = labels.iter().map(|l| l.as_char()).collect();
		let standalone = match class.is_empty() {
			true => None,
			false => Regex::new(&format!(r"\b([{}])\b", regex::escape(&class))).ok(),
		};
		Self {
			labels: labels.to_vec(),
			standalone,
		}
	}

	pub fn parse(&self, raw: &str) -> Label {
		let fallback = self.labels.first().copied().unwrap_or(Label::A);
		let raw = raw.trim().to_uppercase();
		if raw.is_empty() {
			return fallback;
		}

		let standalone = self
			.standalone
			.as_ref()
			.and_then(|re| re.captures(&raw))
			.and_then(|caps| caps.get(1))
			.and_then(|m| Label::parse(m.as_str()));
		if let Some(label) = standalone {
			return label;
		}

		raw.chars().filter_map(Label::new).find(|l| self.labels.contains(l)).unwrap_or(fallback)
	}
}

/// Turns a question into exactly one label, at most once per rate-limit interval. Never fails.
pub struct AnswerSelector<S> {
	service: S,
	limiter: RateLimiter,
	labels: Vec<Label>,
	parser: LabelParser,
	system_instruction: String,
	events: EventSink,
}

impl<S: ReasoningService> AnswerSelector<S> {
	pub fn new(service: S, interval: Duration, labels: Vec<Label>, events: EventSink) -> Self {
		let system_instruction = system_instruction(&labels);
		Self {
			service,
			limiter: RateLimiter::new(interval),
			parser: LabelParser::new(&labels),
			labels,
			system_instruction,
			events,
		}
	}

	pub fn default_label(&self) -> Label {
		self.labels.first().copied().unwrap_or(Label::A)
	}

	pub async fn select_answer(&mut self, payload: &QuestionPayload) -> Label {
		let waited = self.limiter.acquire().await;
		if !waited.is_zero() {
			self.events.debug(format!("Rate limit: waited {:.1}s before asking the model", waited.as_secs_f64()));
		}

		let parts = build_request(payload, &self.labels);
		let answer = match self.service.generate(&self.system_instruction, &parts).await {
			Ok(raw) => self.parser.parse(&raw),
			Err(e) => {
				let fallback = self.default_label();
				self.events.warn(format!("Reasoning service call failed, answering '{fallback}': {e}"));
				fallback
			}
		};
		self.events.action(format!("Model selected answer option: '{answer}'"));
		answer
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::{
		events::Severity,
		testing::{ScriptedService, labels},
	};

	fn two_plus_two() -> QuestionPayload {
		let text = |s: &str| vec![ContentFragment::Text(s.to_string())];
		let mut options = BTreeMap::new();
		for (c, answer) in [('A', "3"), ('B', "4"), ('C', "5"), ('D', "6")] {
			options.insert(Label::new(c).unwrap(), text(answer));
		}
		QuestionPayload { question: text("2+2=?"), options }
	}

	#[tokio::test(start_paused = true)]
	async fn padded_lowercase_reply_selects_that_label() {
		let service = ScriptedService::new(["  b \n"]);
		let (events, _rx) = EventSink::channel();
		let mut selector = AnswerSelector::new(service.clone(), Duration::from_secs(2), labels("ABCD"), events);
		assert_eq!(selector.select_answer(&two_plus_two()).await, Label::new('B').unwrap());
		assert_eq!(service.call_count(), 1);
		assert!(service.requests()[0].contains(&Part::Text("Option B:".to_string())));
	}

	#[tokio::test(start_paused = true)]
	async fn empty_reply_falls_back_to_first_label() {
		let service = ScriptedService::new([""]);
		let (events, _rx) = EventSink::channel();
		let mut selector = AnswerSelector::new(service, Duration::from_secs(2), labels("ABCD"), events);
		assert_eq!(selector.select_answer(&two_plus_two()).await, Label::A);
	}

	#[tokio::test(start_paused = true)]
	async fn service_failure_is_absorbed_and_logged() {
		let service = ScriptedService::failing("quota exceeded");
		let (events, mut rx) = EventSink::channel();
		let mut selector = AnswerSelector::new(service, Duration::from_secs(2), labels("ABCD"), events);
		assert_eq!(selector.select_answer(&two_plus_two()).await, Label::A);

		let warning = rx.try_recv().unwrap();
		assert_eq!(warning.severity, Severity::Warn);
		assert!(warning.message.contains("quota exceeded"));
	}

	#[tokio::test(start_paused = true)]
	async fn consecutive_calls_are_spaced_by_the_interval() {
		let service = ScriptedService::new(["A", "B", "C"]);
		let (events, _rx) = EventSink::channel();
		let interval = Duration::from_millis(1500);
		let mut selector = AnswerSelector::new(service.clone(), interval, labels("ABCD"), events);
		for _ in 0..3 {
			selector.select_answer(&two_plus_two()).await;
		}

		let starts = service.call_times();
		assert_eq!(starts.len(), 3);
		for pair in starts.windows(2) {
			assert!(pair[1] - pair[0] >= interval);
		}
	}

	#[tokio::test(start_paused = true)]
	async fn limiter_does_not_sleep_when_interval_already_passed() {
		let mut limiter = RateLimiter::new(Duration::from_secs(1));
		assert_eq!(limiter.acquire().await, Duration::ZERO);
		tokio::time::sleep(Duration::from_secs(3)).await;
		assert_eq!(limiter.acquire().await, Duration::ZERO);
		assert_eq!(limiter.acquire().await, Duration::from_secs(1));
	}

	#[test]
	fn parsing_prefers_standalone_tokens() {
		let parser = LabelParser::new(&labels("ABCD"));
		assert_eq!(parser.parse("The answer is C."), Label::new('C').unwrap());
		assert_eq!(parser.parse("answer: d"), Label::new('D').unwrap());
		assert_eq!(parser.parse("(B)"), Label::new('B').unwrap());
		// no standalone token: first alphabet letter anywhere
		assert_eq!(parser.parse("xyzzy bcd"), Label::new('B').unwrap());
	}

	#[test]
	fn parsing_is_total_over_junk() {
		let abcd = labels("ABCD");
		let parser = LabelParser::new(&abcd);
		for raw in ["", "   ", "\n", "42", "xyz", "¯\\_(ツ)_/¯", "ÀÉÎ", "E", "null"] {
			let label = parser.parse(raw);
			assert!(abcd.contains(&label), "{raw:?} produced {label}");
		}
		assert_eq!(parser.parse("xyz"), Label::A);
		assert_eq!(parser.parse("E"), Label::A);
	}

	#[test]
	fn parser_respects_a_narrower_alphabet() {
		let parser = LabelParser::new(&labels("AB"));
		assert_eq!(parser.parse("C"), Label::A);
		assert_eq!(parser.parse("D or B"), Label::new('B').unwrap());
		assert_eq!(LabelParser::new(&[]).parse("C"), Label::A);
	}

	#[test]
	fn request_lists_question_then_options_in_label_order() {
		let mut payload = two_plus_two();
		payload.question.push(ContentFragment::Image(vec![9, 9]));
		let parts = build_request(&payload, &labels("ABCD"));

		let texts: Vec<String> = parts
			.iter()
			.map(|p| match p {
				Part::Text(t) => t.clone(),
				Part::Image { mime_type, .. } => format!("<{mime_type}>"),
			})
			.collect();
		assert_eq!(
			&texts[1..texts.len() - 1],
			&["Question:", "2+2=?", "<image/png>", "Option A:", "3", "Option B:", "4", "Option C:", "5", "Option D:", "6"]
		);
		assert!(texts.last().unwrap().ends_with("A, B, C, or D."));
	}

	#[test]
	fn label_enumeration_reads_naturally() {
		assert_eq!(enumerate_labels(&labels("A")), "A");
		assert_eq!(enumerate_labels(&labels("AB")), "A or B");
		assert_eq!(enumerate_labels(&labels("ABC")), "A, B, or C");
	}
}
