use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use color_eyre::Result;
use quiz_autopilot::{
	Mode,
	browser::{BrowserSession, ChromePage},
	config::{AppConfig, DEFAULT_CONFIG_PATH},
	controller::Controller,
	events::EventSink,
	llm::GeminiClient,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quiz_autopilot")]
#[command(about = "Answers multiple-choice quizzes in a Chrome window using Gemini", long_about = None)]
struct Args {
	/// Config file, re-read at every `start`
	#[arg(long, default_value = DEFAULT_CONFIG_PATH)]
	config: PathBuf,

	/// Force a visible browser window
	#[arg(long)]
	visible: bool,

	/// Attach to an already running Chrome (remote debugging URL) instead of launching one
	#[arg(long)]
	connect: Option<String>,

	/// Run every quiz in Booster mode unless `start` names a mode
	#[arg(long)]
	booster: bool,
}

#[derive(Debug, Eq, PartialEq)]
enum Command {
	Launch,
	Start(Option<Mode>),
	Stop,
	Status,
	Help,
	Quit,
}

impl FromStr for Command {
	type Err = String;

	fn from_str(line: &str) -> Result<Self, Self::Err> {
		let mut words = line.split_whitespace();
		let command = words.next().unwrap_or_default().to_ascii_lowercase();
		let command = match command.as_str() {
			"launch" => Command::Launch,
			"start" => Command::Start(words.next().map(str::parse).transpose()?),
			"stop" => Command::Stop,
			"status" => Command::Status,
			"help" | "?" => Command::Help,
			"quit" | "exit" | "q" => Command::Quit,
			other => return Err(format!("unknown command '{other}' (try `help`)")),
		};
		match words.next() {
			Some(extra) => Err(format!("unexpected argument '{extra}'")),
			None => Ok(command),
		}
	}
}

const HELP: &str = "Commands: start [standard|booster], stop, status, launch, quit";

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,quiz_autopilot::events=warn")))
		.with_writer(std::io::stderr)
		.init();
	let args = Args::parse();

	let config = AppConfig::load(&args.config)?;
	let mut settings = config.browser.clone();
	settings.visible |= args.visible;
	if let Some(url) = &args.connect {
		settings.connect_url = Some(url.clone());
	}

	let (events, mut rx) = EventSink::channel();
	let printer = tokio::spawn(async move {
		while let Some(event) = rx.recv().await {
			println!("{event}");
		}
	});

	events.info("Launching Chrome...");
	let session = BrowserSession::launch(&settings).await?;
	events.info(format!("Browser ready at {}. Log in and open a quiz, then type `start`.", settings.start_url));
	events.info(HELP);

	let mut session = session;
	let mut controller = Controller::new(session.page(), events.clone());
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		let line = tokio::select! {
			line = lines.next_line() => line?,
			_ = tokio::signal::ctrl_c() => {
				events.info("Interrupted.");
				None
			}
		};
		let Some(line) = line else { break };
		if line.trim().is_empty() {
			continue;
		}

		match line.parse::<Command>() {
			Ok(Command::Launch) => {
				if !controller.status().browser_closed {
					events.warn("Browser is already running.");
					continue;
				}
				match BrowserSession::launch(&settings).await {
					Ok(fresh) => {
						std::mem::replace(&mut session, fresh).close().await;
						let old = std::mem::replace(&mut controller, Controller::new(session.page(), events.clone()));
						old.shutdown().await;
						events.info("Browser relaunched.");
					}
					Err(e) => events.error(format!("Failed to launch browser: {e}")),
				}
			}
			Ok(Command::Start(mode)) => start(&controller, &args, mode, &events),
			Ok(Command::Stop) => {
				controller.stop();
			}
			Ok(Command::Status) => {
				let status = controller.status();
				let last = status.last_outcome.map(|o| o.to_string()).unwrap_or_else(|| "none".to_string());
				events.info(format!(
					"running: {}, browser closed: {}, last outcome: {last}",
					status.running, status.browser_closed
				));
			}
			Ok(Command::Help) => events.info(HELP),
			Ok(Command::Quit) => break,
			Err(e) => events.warn(e),
		}
	}

	events.info("Shutting down...");
	controller.shutdown().await;
	session.close().await;
	drop(events);
	printer.await?;
	Ok(())
}

/// Re-reads the config so edits take effect on the next run
fn start(controller: &Controller<ChromePage>, args: &Args, mode: Option<Mode>, events: &EventSink) {
	let mut config = match AppConfig::load(&args.config) {
		Ok(config) => config,
		Err(e) => {
			events.error(format!("Failed to load {}: {e}", args.config.display()));
			return;
		}
	};
	config.mode = mode.unwrap_or(if args.booster { Mode::Booster } else { config.mode });

	let client = match GeminiClient::new(config.api_key.clone(), config.model.clone()) {
		Ok(client) => client,
		Err(e) => {
			events.error(format!("Failed to initialize Gemini client: {e}"));
			return;
		}
	};
	events.info(format!(
		"Starting {} run (model {}, one request per {:.1}s).",
		config.mode,
		client.model(),
		config.rate_limit_interval().as_secs_f64()
	));
	if let Err(e) = controller.start(config, client) {
		tracing::debug!("Start rejected: {e}");
	}
}
