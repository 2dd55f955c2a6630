//! Command handlers for the nanlink CLI

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use nanlink_core::{AppEvent, Command, OrchestratorState, Role};

use crate::app::{format_event, ChatApp, PeerBehavior};
use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::error::{CliError, Result};

const LOOPBACK_TIMEOUT: Duration = Duration::from_secs(30);

const HELP: &str = "\
/link    request the data path (discoverer)
/retry   reconnect the stream after connect attempts ran out
/status  show the session status
/close   release everything and return to idle
/attach  attach again after a close
/start   start the role again after discovery ended
/quit    leave
anything else is sent as a chat line";

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    Start,
    Help,
    Quit,
    Unknown(String),
}

/// Map a typed line to what the user meant
pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if !trimmed.starts_with('/') {
        return Input::Command(Command::Send {
            line: line.to_string(),
        });
    }
    match trimmed {
        "/link" => Input::Command(Command::RequestLink),
        "/retry" => Input::Command(Command::RetryConnect),
        "/status" => Input::Command(Command::GetStatus),
        "/close" => Input::Command(Command::Close),
        "/attach" => Input::Command(Command::Attach),
        "/start" => Input::Start,
        "/help" => Input::Help,
        "/quit" | "/exit" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        match cli.command {
            Commands::Publish { echo } => {
                Self::handle_chat(config, Role::Advertiser, PeerBehavior { echo }, cli.json).await
            }
            Commands::Subscribe { echo } => {
                Self::handle_chat(config, Role::Discoverer, PeerBehavior { echo }, cli.json).await
            }
            Commands::Loopback { lines, echo } => {
                Self::handle_loopback(config, lines, PeerBehavior { echo }, cli.json).await
            }
            Commands::Config => {
                println!("{}", CliConfig::example_toml()?);
                Ok(())
            }
        }
    }

    /// Interactive chat: stdin lines become commands, app events are printed
    async fn handle_chat(
        config: CliConfig,
        role: Role,
        behavior: PeerBehavior,
        json: bool,
    ) -> Result<()> {
        info!("Starting interactive {} session", role);
        println!("{}", HELP);

        let descriptor = config.descriptor(role).clone();
        let mut app = ChatApp::start(&config, role, behavior).await?;
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = stdin.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    match parse_input(&line) {
                        Input::Command(command) => app.local.send(command).await?,
                        Input::Start => {
                            app.local
                                .send(Command::Start { descriptor: descriptor.clone() })
                                .await?
                        }
                        Input::Help => println!("{}", HELP),
                        Input::Quit => break,
                        Input::Unknown(command) => println!("Unknown command {}, try /help", command),
                    }
                }
                event = app.local.events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if let AppEvent::StateChanged {
                        from: OrchestratorState::Attaching,
                        to: OrchestratorState::Attached,
                    } = event
                    {
                        app.local
                            .send(Command::Start { descriptor: descriptor.clone() })
                            .await?;
                    }
                    if let Some(text) = format_event(&event, json)? {
                        println!("{}", text);
                    }
                }
            }
        }

        app.stop().await
    }

    /// Both roles unattended: link up, send `lines`, close, exit
    async fn handle_loopback(
        config: CliConfig,
        lines: Vec<String>,
        behavior: PeerBehavior,
        json: bool,
    ) -> Result<()> {
        let mut app = ChatApp::start(&config, Role::Discoverer, behavior).await?;
        let descriptor = config.subscribe.clone();
        let expected_replies = if behavior.echo { lines.len() } else { 0 };

        let exchange = async {
            let mut sent = 0;
            let mut replies = 0;
            let mut streamed = false;
            let mut closing = false;
            while let Some(event) = app.local.events.recv().await {
                if let Some(text) = format_event(&event, json)? {
                    println!("{}", text);
                }
                match event {
                    AppEvent::StateChanged { from, to } => match to {
                        OrchestratorState::Attached if from == OrchestratorState::Attaching => {
                            app.local
                                .send(Command::Start {
                                    descriptor: descriptor.clone(),
                                })
                                .await?;
                        }
                        OrchestratorState::Streaming => {
                            streamed = true;
                            for line in &lines {
                                app.local
                                    .send(Command::Send { line: line.clone() })
                                    .await?;
                            }
                        }
                        OrchestratorState::Idle if streamed => return Ok(()),
                        _ => {}
                    },
                    AppEvent::PeerDiscovered { .. } => app.local.send(Command::RequestLink).await?,
                    AppEvent::LineSent { .. } => sent += 1,
                    AppEvent::LineReceived { .. } => replies += 1,
                    _ => {}
                }
                if !closing && streamed && sent == lines.len() && replies >= expected_replies {
                    closing = true;
                    app.local.send(Command::Close).await?;
                }
            }
            Err(CliError::Session("Event channel closed".to_string()))
        };

        let result = match tokio::time::timeout(LOOPBACK_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(CliError::Session(format!(
                "Loopback did not finish within {}s",
                LOOPBACK_TIMEOUT.as_secs()
            ))),
        };
        app.stop().await?;
        result
    }
}
