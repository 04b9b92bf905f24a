//! Block data model and the nested-block assembly stack.
//!
//! A `Block` is one structured unit of classified game output: a flat
//! qualifier plus an ordered list of typed entries, possibly containing
//! closed nested blocks. The `BlockStack` groups entries into blocks as the
//! classifier walks the line stream.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Milliseconds since the Unix epoch; emission timestamps and replay
/// cursors are expressed in this unit.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Direction-encoding qualifier of a communication entry.
///
/// The serialized strings are the wire contract consumed by front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommsQual {
    #[serde(rename = "speech from")]
    SpeechFrom,
    #[serde(rename = "speech to")]
    SpeechTo,
    #[serde(rename = "tell from")]
    TellFrom,
    #[serde(rename = "tell to")]
    TellTo,
    #[serde(rename = "calling from")]
    CallingFrom,
    #[serde(rename = "calling to")]
    CallingTo,
    #[serde(rename = "novice-calling from")]
    NoviceCallingFrom,
    #[serde(rename = "novice-calling to")]
    NoviceCallingTo,
    #[serde(rename = "rune-bug")]
    RuneBug,
    #[serde(rename = "umbra")]
    Umbra,
}

impl CommsQual {
    /// Whether this entry records something the player themselves sent.
    pub fn is_outgoing(self) -> bool {
        matches!(self, CommsQual::SpeechTo | CommsQual::TellTo)
    }
}

/// A displayable line, optionally tagged ("monospaced", "oneliner") or
/// marked replaceable by the dictionary tagger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineEntry {
    pub qual: String,
    pub line: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "replacableId", skip_serializing_if = "Option::is_none")]
    pub replaceable_id: Option<String>,
}

impl LineEntry {
    pub fn plain(line: impl Into<String>) -> Self {
        Self {
            qual: "line".into(),
            line: line.into(),
            tags: Vec::new(),
            replaceable_id: None,
        }
    }

    pub fn tagged(line: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            qual: "line".into(),
            line: line.into(),
            tags,
            replaceable_id: None,
        }
    }

    pub fn replaceable(line: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            qual: "line".into(),
            line: line.into(),
            tags: Vec::new(),
            replaceable_id: Some(id.into()),
        }
    }
}

/// A captured vicinity map, re-indented to its common margin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapEntry {
    pub qual: String,
    pub loc: String,
    pub region: String,
    pub lines: Vec<String>,
}

/// A channel-membership announcement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelEntry {
    pub qual: String,
    pub code: String,
    pub name: String,
}

/// An in-band protocol entry (macro definitions arrive this way).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacroEntry {
    pub qual: String,
    pub code: String,
    pub content: String,
    #[serde(rename = "macroId")]
    pub macro_id: String,
    #[serde(rename = "macroName", skip_serializing_if = "Option::is_none")]
    pub macro_name: Option<String>,
    #[serde(rename = "macroDef")]
    pub macro_def: String,
}

/// Player communication: speech, tells, channel calls, overheard words.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommsEntry {
    pub qual: CommsQual,
    pub comms: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub who: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chan: Option<String>,
    pub msg: String,
}

impl CommsEntry {
    pub fn new(qual: CommsQual, who: Option<String>, chan: Option<String>, msg: String) -> Self {
        Self {
            qual,
            comms: true,
            who,
            chan,
            msg,
        }
    }
}

/// A single-line attribute message (`###msg@`, `###user@`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttrEntry {
    pub qual: String,
    #[serde(flatten)]
    pub attrs: BTreeMap<String, String>,
}

/// Tabulated rows derived from a run of monospaced lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableEntry {
    pub qual: String,
    pub rows: Vec<Vec<String>>,
}

/// One classified entry inside a block.
///
/// Untagged: each variant carries its own `qual` field, so the serialized
/// form is the flat object the front end expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entry {
    Line(LineEntry),
    Map(MapEntry),
    Channel(ChannelEntry),
    Macro(MacroEntry),
    Comms(CommsEntry),
    Attrs(AttrEntry),
    Table(TableEntry),
    Block(Block),
}

/// Vital statistics parsed from a well-formed prompt line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptVars {
    pub health: u32,
    #[serde(rename = "healthMax")]
    pub health_max: u32,
    pub mana: u32,
    #[serde(rename = "manaMax")]
    pub mana_max: u32,
    pub flags: String,
    #[serde(rename = "visFlags")]
    pub vis_flags: String,
}

/// One structured unit of game output.
///
/// Nested blocks (opened by multi-line message markers) appear as entries
/// of their parent. The root block of a flush additionally carries the raw
/// prompt, its stripped text, parsed vitals when the prompt is well-formed,
/// and the emission timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub qual: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub attrs: BTreeMap<String, String>,
    pub entries: Vec<Entry>,
    #[serde(rename = "ansiPrompt", skip_serializing_if = "Option::is_none")]
    pub ansi_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(rename = "promptVars", skip_serializing_if = "Option::is_none")]
    pub prompt_vars: Option<PromptVars>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emitted: Option<u64>,
}

impl Block {
    pub fn new(qual: impl Into<String>) -> Self {
        Self {
            qual: qual.into(),
            tags: Vec::new(),
            attrs: BTreeMap::new(),
            entries: Vec::new(),
            ansi_prompt: None,
            prompt: None,
            prompt_vars: None,
            emitted: None,
        }
    }
}

/// Stack of in-progress blocks, innermost last.
///
/// An explicit vector with top-of-stack access: open and close are O(1) and
/// there are no ownership cycles. The root block is created lazily on the
/// first entry or nested open, so a flush with no accumulated output yields
/// nothing rather than an empty block.
#[derive(Debug, Default)]
pub struct BlockStack {
    stack: Vec<Block>,
}

impl BlockStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_root(&mut self) {
        if self.stack.is_empty() {
            self.stack.push(Block::new("root"));
        }
    }

    /// Open a nested block on top of the stack.
    pub fn push(&mut self, block: Block) {
        self.ensure_root();
        self.stack.push(block);
    }

    /// Append an entry to the innermost open block.
    pub fn add_entry(&mut self, entry: Entry) {
        self.ensure_root();
        self.stack
            .last_mut()
            .expect("stack non-empty after ensure_root")
            .entries
            .push(entry);
    }

    /// Close the innermost block, attaching it to its parent. A close with
    /// nothing to attach to discards the popped block.
    pub fn pop(&mut self) {
        match self.stack.pop() {
            Some(closed) => {
                if let Some(parent) = self.stack.last_mut() {
                    parent.entries.push(Entry::Block(closed));
                } else {
                    warn!("closing unattached block, discarding {} entries", closed.entries.len());
                }
            }
            None => warn!("block close with empty stack"),
        }
    }

    /// Entries of the current innermost block.
    pub fn current_entries(&self) -> &[Entry] {
        self.stack.last().map(|b| b.entries.as_slice()).unwrap_or(&[])
    }

    /// Nesting depth (0 = nothing accumulated).
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Drain the stack into a single root block, or `None` if nothing was
    /// ever accumulated. A depth greater than one here means the remote
    /// never closed a nested block; the partial grouping is still returned.
    pub fn pop_all(&mut self) -> Option<Block> {
        if self.stack.len() > 1 {
            warn!(depth = self.stack.len(), "unclosed nested blocks at flush");
        }
        while self.stack.len() > 1 {
            self.pop();
        }
        self.stack.pop()
    }
}
