//! Telnet connection to the game server.
//!
//! Owns the TCP stream in one io task: commands arrive over a channel,
//! raw output is forwarded as ordered `ConnectionEvent`s. During connect
//! the task also drives the credential exchange, scraping the banner for
//! the configured name/password prompts and login outcome markers.

use crate::config::GameSection;
use mudgate_core::connection::{ConnectParams, ConnectionEvent, GameConnection};
use mudgate_core::{BridgeError, BridgeResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How much banner text the login scraper keeps for prompt matching.
const SCRAPE_WINDOW: usize = 4096;

#[derive(Debug)]
enum Command {
    Write(String),
    Close,
    Pause,
    Resume,
}

/// A live telnet connection implementing the raw-connection contract.
pub struct TelnetConnection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::Receiver<ConnectionEvent>>,
}

impl TelnetConnection {
    /// Dial the game server and start the io task. The login exchange runs
    /// in the background; its outcome arrives as a `LoginResult` event.
    pub async fn connect(params: &ConnectParams, game: &GameSection) -> BridgeResult<Self> {
        let stream = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| {
                BridgeError::Connection(format!("{}:{}: {e}", params.host, params.port))
            })?;
        info!(host = %params.host, port = params.port, user = %params.username, "game connection open");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let scraper = LoginScraper::new(params, game);
        tokio::spawn(run_io(stream, cmd_rx, event_tx, scraper));

        Ok(Self {
            cmd_tx,
            events: Some(event_rx),
        })
    }
}

impl GameConnection for TelnetConnection {
    fn take_events(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events.take()
    }

    fn write(&self, text: &str) {
        if self.cmd_tx.send(Command::Write(text.to_string())).is_err() {
            warn!("write to closed game connection dropped");
        }
    }

    fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    fn pause(&self) {
        let _ = self.cmd_tx.send(Command::Pause);
    }

    fn resume(&self) {
        let _ = self.cmd_tx.send(Command::Resume);
    }
}

async fn run_io(
    stream: TcpStream,
    mut cmds: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    mut scraper: LoginScraper,
) {
    let _ = events.send(ConnectionEvent::Connected).await;
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(Command::Write(text)) => {
                    if let Err(e) = wr.write_all(text.as_bytes()).await {
                        warn!(error = %e, "game write failed");
                        let _ = events.send(ConnectionEvent::Disconnected { had_error: true }).await;
                        break;
                    }
                }
                Some(Command::Pause) => {
                    // The game session keeps running and keeps being read,
                    // so the replay buffer stays warm for the reconnect.
                    debug!("game connection paused");
                }
                Some(Command::Resume) => {
                    debug!("game connection resumed");
                }
                Some(Command::Close) | None => {
                    let _ = wr.shutdown().await;
                    let _ = events.send(ConnectionEvent::Disconnected { had_error: false }).await;
                    break;
                }
            },
            read = rd.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = events.send(ConnectionEvent::Disconnected { had_error: false }).await;
                    break;
                }
                Ok(n) => {
                    let chunk = &buf[..n];
                    for action in scraper.observe(chunk) {
                        match action {
                            ScrapeAction::Send(line) => {
                                if let Err(e) = wr.write_all(line.as_bytes()).await {
                                    warn!(error = %e, "credential write failed");
                                }
                            }
                            ScrapeAction::Result { success, reason } => {
                                let _ = events
                                    .send(ConnectionEvent::LoginResult { success, reason })
                                    .await;
                            }
                        }
                    }
                    if events.send(ConnectionEvent::Data(chunk.to_vec())).await.is_err() {
                        // Session pump gone; nothing left to feed.
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "game read failed");
                    let _ = events.send(ConnectionEvent::Disconnected { had_error: true }).await;
                    break;
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrapeState {
    AwaitingName,
    AwaitingPassword,
    AwaitingOutcome,
    Done,
}

#[derive(Debug, PartialEq, Eq)]
enum ScrapeAction {
    Send(String),
    Result {
        success: bool,
        reason: Option<String>,
    },
}

/// Watches the banner for login prompts and outcome markers. Emits
/// exactly one login result per connection attempt.
struct LoginScraper {
    username: String,
    password: String,
    name_prompt: String,
    password_prompt: String,
    success_marker: String,
    failure_marker: String,
    window: String,
    state: ScrapeState,
}

impl LoginScraper {
    fn new(params: &ConnectParams, game: &GameSection) -> Self {
        Self {
            username: params.username.clone(),
            password: params.password.clone(),
            name_prompt: game.name_prompt.to_lowercase(),
            password_prompt: game.password_prompt.to_lowercase(),
            success_marker: game.login_success.to_lowercase(),
            failure_marker: game.login_failure.to_lowercase(),
            window: String::new(),
            state: ScrapeState::AwaitingName,
        }
    }

    fn observe(&mut self, chunk: &[u8]) -> Vec<ScrapeAction> {
        if self.state == ScrapeState::Done {
            return Vec::new();
        }

        self.window.push_str(&String::from_utf8_lossy(chunk));
        if self.window.len() > SCRAPE_WINDOW {
            let cut = self.window.len() - SCRAPE_WINDOW;
            // Stay on a char boundary; the window is only for matching.
            let cut = (cut..self.window.len())
                .find(|i| self.window.is_char_boundary(*i))
                .unwrap_or(0);
            self.window.drain(..cut);
        }
        let lowered = self.window.to_lowercase();

        let mut actions = Vec::new();

        // The game can reject (or accept) at any stage.
        if lowered.contains(&self.success_marker) {
            self.state = ScrapeState::Done;
            actions.push(ScrapeAction::Result {
                success: true,
                reason: None,
            });
            return actions;
        }
        if lowered.contains(&self.failure_marker) {
            let reason = self
                .window
                .lines()
                .find(|l| l.to_lowercase().contains(&self.failure_marker))
                .map(|l| l.trim().to_string());
            self.state = ScrapeState::Done;
            actions.push(ScrapeAction::Result {
                success: false,
                reason,
            });
            return actions;
        }

        if self.state == ScrapeState::AwaitingName && lowered.contains(&self.name_prompt) {
            actions.push(ScrapeAction::Send(format!("{}\r\n", self.username)));
            self.state = ScrapeState::AwaitingPassword;
            self.window.clear();
        } else if self.state == ScrapeState::AwaitingPassword
            && lowered.contains(&self.password_prompt)
        {
            actions.push(ScrapeAction::Send(format!("{}\r\n", self.password)));
            self.state = ScrapeState::AwaitingOutcome;
            self.window.clear();
        }
        actions
    }
}
