//! In-memory stand-ins for the browser and the reasoning service

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::{Arc, Mutex},
};

use color_eyre::{Result, eyre::eyre};
use tokio::time::Instant;

use crate::{
	Label,
	config::SelectorConfig,
	llm::{Part, ReasoningService},
	page::{DriverError, DriverResult, Locator, QuizPage},
};

pub type NodeId = usize;

pub fn labels(alphabet: &str) -> Vec<Label> {
	alphabet.chars().filter_map(Label::new).collect()
}

/// DOM mutation applied when a node is clicked
#[derive(Clone, Debug)]
pub enum Effect {
	Detach(NodeId),
	Attach(NodeId),
	SetEnabled(NodeId, bool),
	SetDisplayed(NodeId, bool),
	Disconnect,
}

#[derive(Debug)]
struct Node {
	tag: String,
	classes: Vec<String>,
	text: String,
	html: Option<String>,
	displayed: bool,
	enabled: bool,
	attached: bool,
	parent: Option<NodeId>,
	png: Vec<u8>,
	fail_inner_html: bool,
}

#[derive(Debug, Default)]
struct Dom {
	nodes: Vec<Node>,
	disconnected: bool,
	clicks: Vec<NodeId>,
	js_clicks: Vec<NodeId>,
	on_click: HashMap<NodeId, VecDeque<Vec<Effect>>>,
	stale_on_click: HashSet<NodeId>,
	click_failures: HashMap<NodeId, String>,
	/// Keyed by the locator's CSS
	after_find: HashMap<String, Vec<Effect>>,
	liveness_probes: usize,
}

impl Dom {
	fn check_connected(&self) -> DriverResult<()> {
		match self.disconnected {
			true => Err(DriverError::Disconnected("no such window: target window already closed".to_string())),
			false => Ok(()),
		}
	}

	fn in_document(&self, id: NodeId) -> bool {
		let mut current = Some(id);
		while let Some(id) = current {
			let Some(node) = self.nodes.get(id) else { return false };
			if !node.attached {
				return false;
			}
			current = node.parent;
		}
		true
	}

	fn live(&self, id: NodeId) -> DriverResult<&Node> {
		self.check_connected()?;
		match self.in_document(id) {
			true => Ok(&self.nodes[id]),
			false => Err(DriverError::Stale(format!("node {id} is detached from the document"))),
		}
	}

	fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> bool {
		let mut current = self.nodes[id].parent;
		while let Some(parent) = current {
			if parent == ancestor {
				return true;
			}
			current = self.nodes[parent].parent;
		}
		false
	}

	fn matches(&self, id: NodeId, locator: &Locator) -> bool {
		let node = &self.nodes[id];
		match locator {
			Locator::Class(class) => node.classes.iter().any(|c| c == class),
			Locator::Css(selector) => selector.split(',').map(str::trim).any(|part| match part.strip_prefix('.') {
				Some(class) => node.classes.iter().any(|c| c == class),
				None => node.tag == part,
			}),
		}
	}

	fn apply(&mut self, effect: Effect) {
		match effect {
			Effect::Detach(id) => self.nodes[id].attached = false,
			Effect::Attach(id) => self.nodes[id].attached = true,
			Effect::SetEnabled(id, enabled) => self.nodes[id].enabled = enabled,
			Effect::SetDisplayed(id, displayed) => self.nodes[id].displayed = displayed,
			Effect::Disconnect => self.disconnected = true,
		}
	}

	fn click(&mut self, id: NodeId, scripted: bool) -> DriverResult<()> {
		self.live(id)?;
		if self.stale_on_click.remove(&id) {
			return Err(DriverError::Stale(format!("node {id} went stale mid-click")));
		}
		if !scripted {
			if let Some(message) = self.click_failures.remove(&id) {
				return Err(DriverError::Other(message));
			}
		}
		match scripted {
			true => self.js_clicks.push(id),
			false => self.clicks.push(id),
		}
		let effects = self.on_click.get_mut(&id).and_then(VecDeque::pop_front).unwrap_or_default();
		for effect in effects {
			self.apply(effect);
		}
		Ok(())
	}
}

/// Scripted DOM. Element handles are plain node ids; a detached node (or a node under one) is stale.
#[derive(Debug, Default)]
pub struct FakePage {
	dom: Mutex<Dom>,
}

impl FakePage {
	pub fn new() -> Self {
		Self::default()
	}

	fn add(&self, parent: Option<NodeId>, tag: &str, classes: &[&str], text: &str) -> NodeId {
		let mut dom = self.dom.lock().unwrap();
		dom.nodes.push(Node {
			tag: tag.to_string(),
			classes: classes.iter().map(|c| c.to_string()).collect(),
			text: text.to_string(),
			html: None,
			displayed: true,
			enabled: true,
			attached: true,
			parent,
			png: Vec::new(),
			fail_inner_html: false,
		});
		dom.nodes.len() - 1
	}

	pub fn add_root(&self, tag: &str, classes: &[&str], text: &str) -> NodeId {
		self.add(None, tag, classes, text)
	}

	pub fn add_child(&self, parent: NodeId, tag: &str, classes: &[&str], text: &str) -> NodeId {
		self.add(Some(parent), tag, classes, text)
	}

	pub fn set_html(&self, id: NodeId, html: &str) {
		self.dom.lock().unwrap().nodes[id].html = Some(html.to_string());
	}

	pub fn set_png(&self, id: NodeId, png: Vec<u8>) {
		self.dom.lock().unwrap().nodes[id].png = png;
	}

	pub fn set_displayed(&self, id: NodeId, displayed: bool) {
		self.dom.lock().unwrap().apply(Effect::SetDisplayed(id, displayed));
	}

	pub fn set_enabled(&self, id: NodeId, enabled: bool) {
		self.dom.lock().unwrap().apply(Effect::SetEnabled(id, enabled));
	}

	pub fn fail_inner_html(&self, id: NodeId) {
		self.dom.lock().unwrap().nodes[id].fail_inner_html = true;
	}

	pub fn detach(&self, id: NodeId) {
		self.dom.lock().unwrap().apply(Effect::Detach(id));
	}

	pub fn disconnect(&self) {
		self.dom.lock().unwrap().apply(Effect::Disconnect);
	}

	/// Queues effects for the next click on `id`; each click consumes one batch
	pub fn on_click(&self, id: NodeId, effects: Vec<Effect>) {
		self.dom.lock().unwrap().on_click.entry(id).or_default().push_back(effects);
	}

	/// The next click on `id` fails as stale and has no effect
	pub fn stale_once(&self, id: NodeId) {
		self.dom.lock().unwrap().stale_on_click.insert(id);
	}

	/// The next native click on `id` fails with `message`; scripted clicks still land
	pub fn intercept_once(&self, id: NodeId, message: &str) {
		self.dom.lock().unwrap().click_failures.insert(id, message.to_string());
	}

	/// Applies `effects` right after the next top-level lookup of `locator` returns
	pub fn after_find(&self, locator: &Locator, effects: Vec<Effect>) {
		self.dom.lock().unwrap().after_find.insert(locator.to_css(), effects);
	}

	pub fn clicks(&self) -> Vec<NodeId> {
		self.dom.lock().unwrap().clicks.clone()
	}

	pub fn js_clicks(&self) -> Vec<NodeId> {
		self.dom.lock().unwrap().js_clicks.clone()
	}

	/// Every click that landed, native or scripted
	pub fn clicked(&self, id: NodeId) -> bool {
		let dom = self.dom.lock().unwrap();
		dom.clicks.contains(&id) || dom.js_clicks.contains(&id)
	}

	pub fn liveness_probes(&self) -> usize {
		self.dom.lock().unwrap().liveness_probes
	}
}

impl QuizPage for FakePage {
	type Element = NodeId;

	async fn find_all(&self, locator: &Locator) -> DriverResult<Vec<NodeId>> {
		let mut dom = self.dom.lock().unwrap();
		dom.check_connected()?;
		let found = (0..dom.nodes.len()).filter(|&id| dom.in_document(id) && dom.matches(id, locator)).collect();
		for effect in dom.after_find.remove(&locator.to_css()).unwrap_or_default() {
			dom.apply(effect);
		}
		Ok(found)
	}

	async fn find_within(&self, parent: &NodeId, locator: &Locator) -> DriverResult<Vec<NodeId>> {
		let dom = self.dom.lock().unwrap();
		dom.live(*parent)?;
		Ok((0..dom.nodes.len())
			.filter(|&id| dom.in_document(id) && dom.is_descendant(id, *parent) && dom.matches(id, locator))
			.collect())
	}

	async fn text(&self, element: &NodeId) -> DriverResult<String> {
		Ok(self.dom.lock().unwrap().live(*element)?.text.clone())
	}

	async fn inner_html(&self, element: &NodeId) -> DriverResult<String> {
		let dom = self.dom.lock().unwrap();
		let node = dom.live(*element)?;
		match node.fail_inner_html {
			true => Err(DriverError::Other("innerHTML is not available".to_string())),
			false => Ok(node.html.clone().unwrap_or_else(|| node.text.clone())),
		}
	}

	async fn is_displayed(&self, element: &NodeId) -> DriverResult<bool> {
		Ok(self.dom.lock().unwrap().live(*element)?.displayed)
	}

	async fn is_enabled(&self, element: &NodeId) -> DriverResult<bool> {
		Ok(self.dom.lock().unwrap().live(*element)?.enabled)
	}

	async fn is_stale(&self, element: &NodeId) -> DriverResult<bool> {
		let dom = self.dom.lock().unwrap();
		dom.check_connected()?;
		Ok(!dom.in_document(*element))
	}

	async fn screenshot(&self, element: &NodeId) -> DriverResult<Vec<u8>> {
		Ok(self.dom.lock().unwrap().live(*element)?.png.clone())
	}

	async fn click(&self, element: &NodeId) -> DriverResult<()> {
		self.dom.lock().unwrap().click(*element, false)
	}

	async fn js_click(&self, element: &NodeId) -> DriverResult<()> {
		self.dom.lock().unwrap().click(*element, true)
	}

	async fn is_alive(&self) -> bool {
		let mut dom = self.dom.lock().unwrap();
		dom.liveness_probes += 1;
		!dom.disconnected
	}
}

/// Node ids of one rendered question
#[derive(Clone, Debug)]
pub struct QuizNodes {
	pub container: NodeId,
	pub question: NodeId,
	/// In the order they were given, i.e. DOM order
	pub cards: Vec<NodeId>,
}

/// Renders a question container with one card per `(glyph, content)` pair, the way the quiz site lays them out
pub fn quiz_page(page: &FakePage, selectors: &SelectorConfig, question_class: &str, question: &str, options: &[(char, &str)]) -> QuizNodes {
	let container = page.add_root("div", &["quiz-container"], "");
	let question = page.add_child(container, "div", &[question_class], question);
	let cards = options
		.iter()
		.map(|(glyph, content)| {
			let card = page.add_child(container, "div", &[selectors.option_card_class.as_str()], "");
			page.add_child(card, "div", &[selectors.option_label_class.as_str()], &glyph.to_string());
			page.add_child(card, "div", &[selectors.option_text_class.as_str()], content);
			card
		})
		.collect();
	QuizNodes { container, question, cards }
}

#[derive(Debug)]
struct Script {
	responses: VecDeque<Result<String, String>>,
	when_exhausted: Result<String, String>,
	calls: Vec<Instant>,
	requests: Vec<Vec<Part>>,
}

/// Replays queued replies and records when (and with what) it was called
#[derive(Clone, Debug)]
pub struct ScriptedService {
	script: Arc<Mutex<Script>>,
}

impl ScriptedService {
	fn with(responses: VecDeque<Result<String, String>>, when_exhausted: Result<String, String>) -> Self {
		Self {
			script: Arc::new(Mutex::new(Script {
				responses,
				when_exhausted,
				calls: Vec::new(),
				requests: Vec::new(),
			})),
		}
	}

	pub fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
		let responses = replies.into_iter().map(|r| Ok(r.to_string())).collect();
		Self::with(responses, Err("no scripted reply left".to_string()))
	}

	/// Same reply forever
	pub fn always(reply: &str) -> Self {
		Self::with(VecDeque::new(), Ok(reply.to_string()))
	}

	pub fn failing(message: &str) -> Self {
		Self::with(VecDeque::new(), Err(message.to_string()))
	}

	pub fn call_count(&self) -> usize {
		self.script.lock().unwrap().calls.len()
	}

	pub fn call_times(&self) -> Vec<Instant> {
		self.script.lock().unwrap().calls.clone()
	}

	pub fn requests(&self) -> Vec<Vec<Part>> {
		self.script.lock().unwrap().requests.clone()
	}
}

impl ReasoningService for ScriptedService {
	async fn generate(&self, _system_instruction: &str, parts: &[Part]) -> Result<String> {
		let reply = {
			let mut script = self.script.lock().unwrap();
			script.calls.push(Instant::now());
			script.requests.push(parts.to_vec());
			let queued = script.responses.pop_front();
			queued.unwrap_or_else(|| script.when_exhausted.clone())
		};
		reply.map_err(|e| eyre!(e))
	}
}
