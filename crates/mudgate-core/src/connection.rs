//! Abstract raw connection to the game server.
//!
//! The concrete telnet implementation lives in the server crate; the core
//! only needs an ordered event stream plus write/close/pause handles.

use tokio::sync::mpsc;

/// Parameters identifying one login attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Game realm; `None` means the default realm.
    pub realm: Option<String>,
}

/// Events produced by a raw game connection, in arrival order.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A chunk of raw bytes from the game.
    Data(Vec<u8>),
    /// Outcome of the login exchange; emitted once per attempt.
    LoginResult {
        success: bool,
        reason: Option<String>,
    },
    /// The transport is up.
    Connected,
    /// The transport closed.
    Disconnected { had_error: bool },
}

/// A raw connection to the game server.
///
/// Implementations own their transport tasks and surface one ordered event
/// stream; the session pump consumes it single-threadedly. Writes are
/// fire-and-forget command lines.
pub trait GameConnection: Send + Sync {
    /// Take the event receiver. Yields the stream exactly once.
    fn take_events(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>>;

    /// Queue a command line for the game.
    fn write(&self, text: &str);

    /// Terminate the connection.
    fn close(&self);

    /// Detach front-end delivery without closing the game connection.
    fn pause(&self);

    /// Re-attach after a pause.
    fn resume(&self);
}
