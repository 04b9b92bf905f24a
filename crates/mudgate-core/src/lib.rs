//! mudgate-core: bridge core for a text-based multiplayer game.
//!
//! Reassembles the game's go-ahead-framed ANSI byte stream into lines and
//! prompts, classifies them into structured blocks via an ordered rule
//! cascade, and buffers emissions for reconnect replay. Each session owns
//! its own pipeline; there is no cross-session state.

pub mod block;
pub mod classify;
pub mod connection;
pub mod error;
pub mod replay;
pub mod session;
pub mod splitter;

// Re-export commonly used items at crate root.
pub use block::{Block, BlockStack, CommsQual, Entry, PromptVars};
pub use classify::{Classifier, ClassifierEvent, LineTagger, NoopTagger, ProtocolMsg};
pub use connection::{ConnectParams, ConnectionEvent, GameConnection};
pub use error::{BridgeError, BridgeResult};
pub use replay::{BufferedSession, ReplayBuffer, ReplayEntry, DEFAULT_REPLAY_CAPACITY};
pub use session::{
    session_key, LoginOutcome, NoopTabulator, ParsedSession, SessionEvent, Tabulator,
    DEFAULT_REALM,
};
pub use splitter::{DirtyTailPolicy, FrameSplitter, StreamEvent, DIRTY_PROMPT_DELAY, GO_AHEAD};
