//! Stateful classification of framed game output.
//!
//! Each line is stripped of display escape codes and run through an ordered
//! rule cascade; the first matching rule wins, ties broken by declaration
//! order. Unmatched lines go to the replaceable-line tagger and then the
//! plain line buffer. A prompt closes the current block and emits it.
//!
//! The cascade order is a correctness contract, not an optimization:
//! protocol acknowledgements must win over map capture, map capture over
//! message markers, and the generic `###` fallback must come last.

use crate::block::{
    epoch_millis, AttrEntry, Block, BlockStack, ChannelEntry, CommsEntry, CommsQual, Entry,
    LineEntry, MacroEntry, MapEntry, PromptVars,
};
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::debug;

/// Out-of-band protocol message: never rendered, consumed by the front end
/// to track prompt variables, channel membership and similar state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolMsg {
    pub code: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ProtocolMsg {
    pub fn new(code: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            content: content.into(),
            name: None,
            value: None,
        }
    }
}

/// Classification output, in strict input order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierEvent {
    /// A finished block, flushed by a prompt.
    Block(Block),
    /// An out-of-band protocol message.
    Protocol(ProtocolMsg),
}

/// Tags lines that replace an earlier rendering of themselves (weather,
/// time-of-day and similar repeating chatter). Dictionary-driven
/// implementations live upstream; the core only needs the lookup.
pub trait LineTagger: Send + Sync {
    fn attempt(&self, clean_line: &str) -> Option<String>;
}

/// A tagger that never matches.
#[derive(Debug, Default)]
pub struct NoopTagger;

impl LineTagger for NoopTagger {
    fn attempt(&self, _clean_line: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Always,
    InMap,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    AckPromptVar,
    AckMacro,
    MacroDef,
    UmbraCall,
    SwallowProtocolInit,
    MapStart,
    MapEnd,
    MapBodyLine,
    AttrMsg,
    BeginBlock,
    EndBlock,
    DedupLocation,
    ChannelDef,
    RuneBugEcho,
    NoviceCall,
    GenericCall,
    CallsFrom,
    CallsTo,
    TellFrom,
    TellTo,
    SpeechFrom,
    SpeechTo,
    AttrUser,
    ProtocolFallback,
}

struct Rule {
    gate: Gate,
    regex: Regex,
    action: Action,
}

/// Declaration order is evaluation order.
const RULE_TABLE: &[(Gate, &str, Action)] = &[
    (Gate::Always, r"^###ack prompt (\S*) (.*)$", Action::AckPromptVar),
    (
        Gate::Always,
        r"^###ack macro@ ###id=(\d+) ###name=(.+) ###def=(.*)$",
        Action::AckMacro,
    ),
    (Gate::Always, r"^###macro (\d+) (.*)$", Action::MacroDef),
    (Gate::Always, r#"^>>> (.*) @ UMBRA: "(.*)"$"#, Action::UmbraCall),
    (
        Gate::Always,
        r"^Initiating CLIENT / AVALON protocol codes\.$",
        Action::SwallowProtocolInit,
    ),
    (
        Gate::Always,
        r#"^Vicinity MAP around "(.+)" location:$"#,
        Action::MapStart,
    ),
    (Gate::InMap, r"^Map (?:depicts|shows) (.*)$", Action::MapEnd),
    (Gate::InMap, r"^.*$", Action::MapBodyLine),
    (Gate::Always, r"^###msg@ (.+)$", Action::AttrMsg),
    (Gate::Always, r"^###begin@ (.+)$", Action::BeginBlock),
    (Gate::Always, r"^###end@.*$", Action::EndBlock),
    (
        Gate::Always,
        r#"^At "(.*)": (At "(.*)": )(.*)\.$"#,
        Action::DedupLocation,
    ),
    (Gate::Always, r"^###channel (\S+) (.+)$", Action::ChannelDef),
    (
        Gate::Always,
        r"^Your rune-bug picks up words: (.+)$",
        Action::RuneBugEcho,
    ),
    (
        Gate::Always,
        r#"^>>> (.+) @ NOVICES: "(.*)"$"#,
        Action::NoviceCall,
    ),
    (Gate::Always, r#"^>>> (.+) @ (.+): "(.*)"$"#, Action::GenericCall),
    (
        Gate::Always,
        r#"^(\S+) calls to (.+?): "(.*)"$"#,
        Action::CallsFrom,
    ),
    (
        Gate::Always,
        r#"^You call to (.+?): "(.*)"$"#,
        Action::CallsTo,
    ),
    (
        Gate::Always,
        r#"^(.*?) tells you, "(.*)"$"#,
        Action::TellFrom,
    ),
    (
        Gate::Always,
        r#"^You (tell|answer) (.*?), "(.*)"$"#,
        Action::TellTo,
    ),
    (
        Gate::Always,
        r#"^(.+?) (asks|says|exclaims), "(.+)"$"#,
        Action::SpeechFrom,
    ),
    (
        Gate::Always,
        r#"^You (ask|say|exclaim), "(.+)"$"#,
        Action::SpeechTo,
    ),
    (Gate::Always, r"^###user@ (.*)$", Action::AttrUser),
    (Gate::Always, r"^###(\S+) ?(.*)$", Action::ProtocolFallback),
];

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        RULE_TABLE
            .iter()
            .map(|(gate, pattern, action)| Rule {
                gate: *gate,
                regex: Regex::new(pattern).expect("rule pattern compiles"),
                action: *action,
            })
            .collect()
    })
}

fn prompt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+)/(\d+)h, (\d+)/(\d+)m (\S*) (.*)(?:-|=).*$").expect("prompt pattern")
    })
}

fn map_pad_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^((?:\x1b\[\d+m)*)(\s*)(.*?)$").expect("map pad pattern"))
}

/// Parse `###key=value###key=value` marker fields.
fn parse_eq_attrs(rest: &str) -> Vec<(String, String)> {
    rest.split("###")
        .skip(1)
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

/// Parse `###key value###key value` marker fields.
fn parse_space_attrs(rest: &str) -> Vec<(String, String)> {
    rest.split("###")
        .skip(1)
        .map(|part| match part.split_once(' ') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

fn parse_prompt_vars(prompt: &str) -> Option<PromptVars> {
    let caps = prompt_regex().captures(prompt)?;
    let num = |i: usize| caps[i].parse::<u32>().ok();
    Some(PromptVars {
        health: num(1)?,
        health_max: num(2)?,
        mana: num(3)?,
        mana_max: num(4)?,
        flags: caps[5].to_string(),
        vis_flags: caps[6].to_string(),
    })
}

/// The classification engine for one session.
///
/// Single-threaded per session; `on_line` and `on_prompt` must be called
/// in frame arrival order.
pub struct Classifier {
    stack: BlockStack,
    line_buffer: Vec<String>,
    monospaced: bool,
    in_map: bool,
    map_loc: String,
    map_lines: Vec<String>,
    tagger: Arc<dyn LineTagger>,
    events: Vec<ClassifierEvent>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Arc::new(NoopTagger))
    }
}

impl Classifier {
    pub fn new(tagger: Arc<dyn LineTagger>) -> Self {
        Self {
            stack: BlockStack::new(),
            line_buffer: Vec::new(),
            monospaced: false,
            in_map: false,
            map_loc: String::new(),
            map_lines: Vec::new(),
            tagger,
            events: Vec::new(),
        }
    }

    /// Classify one line. Returns any out-of-band events it produced.
    pub fn on_line(&mut self, raw: &str) -> Vec<ClassifierEvent> {
        let clean = strip_ansi_escapes::strip_str(raw);

        let mut matched = false;
        for rule in rules() {
            if rule.gate == Gate::InMap && !self.in_map {
                continue;
            }
            if let Some(caps) = rule.regex.captures(&clean) {
                // The location de-dup only applies when the clause really
                // repeats; otherwise the cascade continues.
                if matches!(rule.action, Action::DedupLocation) && caps[1] != caps[3] {
                    continue;
                }
                self.apply(rule.action, &caps, raw);
                matched = true;
                break;
            }
        }

        if !matched {
            match self.tagger.attempt(&clean) {
                Some(tag) => self.append_output(Entry::Line(LineEntry::replaceable(raw, tag))),
                None => self.append_line(raw),
            }
        }
        std::mem::take(&mut self.events)
    }

    /// A prompt arrived: flush everything accumulated into one block.
    pub fn on_prompt(&mut self, ansi_prompt: &str) -> Vec<ClassifierEvent> {
        if self.in_map {
            // The remote never closed the map body.
            self.end_map("unknown");
        }
        self.flush_line_buffer();
        match self.stack.pop_all() {
            Some(mut block) => {
                if !ansi_prompt.is_empty() {
                    block.ansi_prompt = Some(ansi_prompt.to_string());
                    let prompt =
                        strip_ansi_escapes::strip_str(ansi_prompt).trim().to_string();
                    block.prompt_vars = parse_prompt_vars(&prompt);
                    block.prompt = Some(prompt);
                }
                block.emitted = Some(epoch_millis());
                self.events.push(ClassifierEvent::Block(block));
            }
            None => debug!("flush with no accumulated output"),
        }
        std::mem::take(&mut self.events)
    }

    fn apply(&mut self, action: Action, caps: &Captures<'_>, raw: &str) {
        match action {
            Action::AckPromptVar => {
                self.events.push(ClassifierEvent::Protocol(ProtocolMsg {
                    code: "promptvar".into(),
                    content: caps[0].to_string(),
                    name: Some(caps[1].to_string()),
                    value: Some(caps[2].to_string()),
                }));
            }
            Action::AckMacro => {
                let entry = MacroEntry {
                    qual: "protocol".into(),
                    code: "macro".into(),
                    content: caps[0].to_string(),
                    macro_id: caps[1].to_string(),
                    macro_name: Some(caps[2].to_string()),
                    macro_def: caps[3].to_string(),
                };
                self.append_output(Entry::Macro(entry));
            }
            Action::MacroDef => {
                let entry = MacroEntry {
                    qual: "protocol".into(),
                    code: "macro".into(),
                    content: caps[0].to_string(),
                    macro_id: caps[1].to_string(),
                    macro_name: None,
                    macro_def: caps[2].to_string(),
                };
                self.append_output(Entry::Macro(entry));
            }
            Action::UmbraCall => {
                let entry = CommsEntry::new(
                    CommsQual::Umbra,
                    Some(caps[1].to_string()),
                    Some("umbra".into()),
                    caps[2].to_string(),
                );
                self.append_output(Entry::Comms(entry));
            }
            Action::SwallowProtocolInit => {}
            Action::MapStart => {
                self.map_loc = caps[1].to_string();
                self.in_map = true;
            }
            Action::MapEnd => {
                let region = caps[1].to_string();
                self.end_map(&region);
            }
            Action::MapBodyLine => {
                // Verbatim, escape codes included.
                self.map_lines.push(raw.to_string());
            }
            Action::AttrMsg => {
                let attrs: BTreeMap<String, String> = parse_eq_attrs(&caps[1])
                    .into_iter()
                    .map(|(k, v)| (k, v.trim().to_string()))
                    .collect();
                self.append_output(Entry::Attrs(AttrEntry {
                    qual: "avmsg".into(),
                    attrs,
                }));
            }
            Action::BeginBlock => {
                let mut block = Block::new("avmsg");
                let mut cmd = String::new();
                for (key, value) in parse_eq_attrs(&caps[1]) {
                    if key == "cmd" {
                        cmd = value.clone();
                    }
                    if key == "tag" {
                        let mut tags: Vec<String> =
                            value.split(' ').map(str::to_string).collect();
                        tags.push("block".into());
                        block.tags = tags;
                    } else {
                        block.attrs.insert(key, value.trim().to_string());
                    }
                }
                self.stack.push(block);
                if cmd.eq_ignore_ascii_case("WHO") {
                    self.append_line("You can see the following people in the land:");
                }
            }
            Action::EndBlock => {
                self.flush_line_buffer();
                self.stack.pop();
            }
            Action::DedupLocation => {
                let spammy = &caps[2];
                self.append_line(&raw.replacen(spammy, "", 1));
            }
            Action::ChannelDef => {
                let code = caps[1].to_string();
                let name = caps[2].to_string();
                let membership = match code.as_str() {
                    "ccc" => Some("city"),
                    "ccg" => Some("guild"),
                    "ccp" => Some("profession"),
                    "cco" => Some("order"),
                    _ => None,
                };
                if let Some(kind) = membership {
                    self.events
                        .push(ClassifierEvent::Protocol(ProtocolMsg::new(kind, name.clone())));
                }
                self.append_output(Entry::Channel(ChannelEntry {
                    qual: "channel".into(),
                    code,
                    name,
                }));
            }
            Action::RuneBugEcho => {
                let txt = caps[1].to_string();
                if !self.is_duplicate_overheard(&txt) {
                    let entry = CommsEntry::new(
                        CommsQual::RuneBug,
                        None,
                        Some("rune-bug".into()),
                        txt,
                    );
                    self.append_output(Entry::Comms(entry));
                }
            }
            Action::NoviceCall => {
                let who = caps[1].to_string();
                let qual = if who == "You call" {
                    CommsQual::NoviceCallingTo
                } else {
                    CommsQual::NoviceCallingFrom
                };
                let entry =
                    CommsEntry::new(qual, Some(who), Some("novices".into()), caps[2].to_string());
                self.append_output(Entry::Comms(entry));
            }
            Action::GenericCall => {
                let who = caps[1].to_string();
                let qual = if who == "You call" {
                    CommsQual::CallingTo
                } else {
                    CommsQual::CallingFrom
                };
                let entry = CommsEntry::new(
                    qual,
                    Some(who),
                    Some(caps[2].to_string()),
                    caps[3].to_string(),
                );
                self.append_output(Entry::Comms(entry));
            }
            Action::CallsFrom => {
                let entry = CommsEntry::new(
                    CommsQual::CallingFrom,
                    Some(caps[1].to_string()),
                    Some(caps[2].to_string()),
                    caps[3].to_string(),
                );
                self.append_output(Entry::Comms(entry));
            }
            Action::CallsTo => {
                let entry = CommsEntry::new(
                    CommsQual::CallingTo,
                    Some("You".into()),
                    Some(caps[1].to_string()),
                    caps[2].to_string(),
                );
                self.append_output(Entry::Comms(entry));
            }
            Action::TellFrom => {
                let entry = CommsEntry::new(
                    CommsQual::TellFrom,
                    Some(caps[1].to_string()),
                    None,
                    caps[2].to_string(),
                );
                self.append_output(Entry::Comms(entry));
            }
            Action::TellTo => {
                let entry = CommsEntry::new(
                    CommsQual::TellTo,
                    Some(caps[2].to_string()),
                    None,
                    caps[3].to_string(),
                );
                self.append_output(Entry::Comms(entry));
            }
            Action::SpeechFrom => {
                let entry = CommsEntry::new(
                    CommsQual::SpeechFrom,
                    Some(caps[1].to_string()),
                    None,
                    caps[3].to_string(),
                );
                self.append_output(Entry::Comms(entry));
            }
            Action::SpeechTo => {
                let entry =
                    CommsEntry::new(CommsQual::SpeechTo, None, None, caps[2].to_string());
                self.append_output(Entry::Comms(entry));
            }
            Action::AttrUser => {
                let attrs: BTreeMap<String, String> = parse_space_attrs(&caps[1])
                    .into_iter()
                    .map(|(k, v)| (k, v.trim().to_string()))
                    .collect();
                self.append_output(Entry::Attrs(AttrEntry {
                    qual: "user".into(),
                    attrs,
                }));
            }
            Action::ProtocolFallback => {
                self.events.push(ClassifierEvent::Protocol(ProtocolMsg::new(
                    caps[1].to_string(),
                    caps[2].to_string(),
                )));
            }
        }
    }

    /// An overheard echo is a duplicate when the current block already
    /// holds a communication whose message it contains, and that entry is
    /// either outgoing or names a speaker also present in the echo.
    fn is_duplicate_overheard(&self, txt: &str) -> bool {
        self.stack.current_entries().iter().any(|entry| {
            let Entry::Comms(c) = entry else {
                return false;
            };
            if !txt.contains(&c.msg) {
                return false;
            }
            if c.qual.is_outgoing() {
                return true;
            }
            c.who.as_deref().is_some_and(|who| txt.contains(who))
        })
    }

    fn append_line(&mut self, line: &str) {
        if line.contains("   ") {
            self.monospaced = true;
        }
        if !line.trim().is_empty() {
            self.line_buffer.push(line.to_string());
        }
    }

    fn append_output(&mut self, entry: Entry) {
        self.flush_line_buffer();
        self.stack.add_entry(entry);
    }

    fn flush_line_buffer(&mut self) {
        if self.line_buffer.is_empty() {
            return;
        }
        let mut tags = Vec::new();
        if self.monospaced {
            tags.push("monospaced".to_string());
        }
        if self.line_buffer.len() == 1 {
            tags.push("oneliner".to_string());
        }
        for line in std::mem::take(&mut self.line_buffer) {
            self.stack
                .add_entry(Entry::Line(LineEntry::tagged(line, tags.clone())));
        }
        self.monospaced = false;
    }

    fn end_map(&mut self, region: &str) {
        let pad_re = map_pad_regex();

        // Common indent: minimum pad width over lines with visible content,
        // escape-code prefixes excluded from the width.
        let mut padding = usize::MAX;
        for line in &self.map_lines {
            if line.is_empty() {
                continue;
            }
            if let Some(caps) = pad_re.captures(line) {
                if !caps[3].is_empty() {
                    padding = padding.min(caps[2].len());
                }
            }
        }
        if padding == usize::MAX {
            padding = 0;
        }

        let lines: Vec<String> = self
            .map_lines
            .iter()
            .map(|line| match pad_re.captures(line) {
                Some(caps) => {
                    let pad = caps[2].to_string();
                    format!(
                        "{}{}{}",
                        &caps[1],
                        pad.get(padding..).unwrap_or(""),
                        &caps[3]
                    )
                }
                None => line.clone(),
            })
            .collect();

        let loc = std::mem::take(&mut self.map_loc);
        self.append_output(Entry::Map(MapEntry {
            qual: "map".into(),
            loc,
            region: region.to_string(),
            lines,
        }));
        self.map_lines.clear();
        self.in_map = false;
    }
}
