//! Session pipeline: raw connection → frame splitter → classifier →
//! subscribers.
//!
//! One tokio task (the pump) per session consumes the connection's event
//! stream, drives the splitter's dirty-prompt timer, classifies frames and
//! fans finished blocks out over a broadcast channel. Everything stays in
//! arrival order; the only reordering-free drop is blocks classified
//! before login completes.

use crate::block::Block;
use crate::classify::{Classifier, ClassifierEvent, LineTagger, ProtocolMsg};
use crate::connection::{ConnectionEvent, GameConnection};
use crate::error::{BridgeError, BridgeResult};
use crate::splitter::{DirtyTailPolicy, FrameSplitter, StreamEvent, DIRTY_PROMPT_DELAY};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Default game realm; session keys only mention a realm when it differs.
pub const DEFAULT_REALM: &str = "avalon";

/// Capacity of the per-session event fan-out.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Directory key for a login: `user` or `user@realm`.
pub fn session_key(username: &str, realm: Option<&str>) -> String {
    match realm {
        Some(realm) if realm != DEFAULT_REALM => format!("{username}@{realm}"),
        _ => username.to_string(),
    }
}

/// Post-classification normalization applied to each block before
/// delivery. The concrete column tabulator lives in the server crate.
pub trait Tabulator: Send + Sync {
    fn tabulate(&self, block: Block) -> Block;
}

/// Pass-through tabulator.
#[derive(Debug, Default)]
pub struct NoopTabulator;

impl Tabulator for NoopTabulator {
    fn tabulate(&self, block: Block) -> Block {
        block
    }
}

/// Events a session delivers to its subscribers, in emission order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A finished, tabulated block.
    Block(Block),
    /// An out-of-band protocol message.
    Protocol(ProtocolMsg),
    /// Login outcome passthrough.
    LoginResult {
        success: bool,
        reason: Option<String>,
    },
    /// Game transport connected.
    Connected,
    /// Game transport closed; the session is over.
    Disconnected { had_error: bool },
}

/// Outcome of the login exchange, observable without subscribing.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

/// A raw connection with classification attached: one addressable game
/// session.
pub struct ParsedSession {
    conn: Arc<dyn GameConnection>,
    tx: broadcast::Sender<SessionEvent>,
    protocol_state: Arc<Mutex<BTreeMap<String, String>>>,
    login_rx: watch::Receiver<Option<LoginOutcome>>,
}

impl ParsedSession {
    /// Wire a pipeline onto `conn` and start its pump task.
    pub fn new(
        mut conn: Box<dyn GameConnection>,
        tagger: Arc<dyn LineTagger>,
        tabulator: Arc<dyn Tabulator>,
        policy: DirtyTailPolicy,
    ) -> BridgeResult<Self> {
        let events = conn
            .take_events()
            .ok_or_else(|| BridgeError::Channel("connection events already taken".into()))?;
        let conn: Arc<dyn GameConnection> = Arc::from(conn);
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (login_tx, login_rx) = watch::channel(None);
        let protocol_state = Arc::new(Mutex::new(BTreeMap::new()));

        let pump = Pump {
            splitter: FrameSplitter::new(policy),
            classifier: Classifier::new(tagger),
            conn: conn.clone(),
            tx: tx.clone(),
            protocol_state: protocol_state.clone(),
            tabulator,
            login_tx,
            logged_in: false,
        };
        tokio::spawn(pump.run(events));

        Ok(Self {
            conn,
            tx,
            protocol_state,
            login_rx,
        })
    }

    /// Subscribe to the live, ordered event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Send a command line to the game.
    pub fn write(&self, text: &str) {
        self.conn.write(text);
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn pause(&self) {
        self.conn.pause();
    }

    pub fn resume(&self) {
        self.conn.resume();
    }

    /// Snapshot of the last-seen content per protocol code.
    pub fn protocol_state(&self) -> BTreeMap<String, String> {
        self.protocol_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait for the login exchange to finish.
    pub async fn wait_login(&self) -> BridgeResult<LoginOutcome> {
        let mut rx = self.login_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return Ok(outcome);
            }
            rx.changed()
                .await
                .map_err(|_| BridgeError::SessionClosed)?;
        }
    }
}

struct Pump {
    splitter: FrameSplitter,
    classifier: Classifier,
    conn: Arc<dyn GameConnection>,
    tx: broadcast::Sender<SessionEvent>,
    protocol_state: Arc<Mutex<BTreeMap<String, String>>>,
    tabulator: Arc<dyn Tabulator>,
    login_tx: watch::Sender<Option<LoginOutcome>>,
    logged_in: bool,
}

impl Pump {
    async fn run(mut self, mut events: mpsc::Receiver<ConnectionEvent>) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle(event, &mut deadline) {
                            break;
                        }
                    }
                    None => {
                        // Connection dropped without a disconnect event;
                        // subscribers still get an observable end.
                        self.emit(SessionEvent::Disconnected { had_error: false });
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    deadline = None;
                    if let Some(event) = self.splitter.on_timeout() {
                        self.dispatch(event);
                    }
                }
            }
        }
    }

    /// Returns true when the session is over.
    fn handle(&mut self, event: ConnectionEvent, deadline: &mut Option<Instant>) -> bool {
        match event {
            ConnectionEvent::Data(bytes) => {
                for stream_event in self.splitter.feed(&bytes) {
                    self.dispatch(stream_event);
                }
                // Fresh data re-arms or cancels the dirty-prompt delay.
                *deadline = self
                    .splitter
                    .timer_armed()
                    .then(|| Instant::now() + DIRTY_PROMPT_DELAY);
                false
            }
            ConnectionEvent::LoginResult { success, reason } => {
                self.emit(SessionEvent::LoginResult {
                    success,
                    reason: reason.clone(),
                });
                let _ = self.login_tx.send(Some(LoginOutcome { success, reason }));
                if success {
                    self.logged_in = true;
                    self.conn.write("protocol on\r\n");
                    self.conn.write("macrolist\r\n");
                } else {
                    self.conn.close();
                }
                false
            }
            ConnectionEvent::Connected => {
                self.emit(SessionEvent::Connected);
                false
            }
            ConnectionEvent::Disconnected { had_error } => {
                self.emit(SessionEvent::Disconnected { had_error });
                true
            }
        }
    }

    fn dispatch(&mut self, event: StreamEvent) {
        let results = match event {
            StreamEvent::Line(line) => self.classifier.on_line(&line),
            StreamEvent::Prompt(prompt) => self.classifier.on_prompt(&prompt),
        };
        for result in results {
            match result {
                ClassifierEvent::Protocol(msg) => {
                    self.protocol_state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(msg.code.clone(), msg.content.clone());
                    self.emit(SessionEvent::Protocol(msg));
                }
                ClassifierEvent::Block(block) => {
                    if self.logged_in {
                        let block = self.tabulator.tabulate(block);
                        self.emit(SessionEvent::Block(block));
                    } else {
                        debug!("dropping block classified before login");
                    }
                }
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers just means nobody is watching right now.
        let _ = self.tx.send(event);
    }
}
