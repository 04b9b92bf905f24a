//! Go-ahead frame splitting.
//!
//! The game terminates each burst of output with the telnet IAC GA
//! sequence. Everything up to a marker is a complete unit whose trailing
//! fragment is the status prompt; output with no marker yet is "dirty" and
//! its trailing fragment is withheld until more data or a timeout decides
//! what it was.
//!
//! The splitter itself is a synchronous state machine; the session pump
//! owns the actual timer and calls [`FrameSplitter::on_timeout`] when it
//! fires. `timer_armed` reports whether a dirty tail is pending, so the
//! pump re-arms the delay after every `feed`.

use std::time::Duration;

/// Telnet IAC GA: "output complete, awaiting input".
pub const GO_AHEAD: [u8; 2] = [0xFF, 0xF9];

/// Prefix of out-of-band protocol lines.
pub const PROTOCOL_PREFIX: &str = "###";

/// Delay before a withheld dirty tail is forced out as a prompt.
pub const DIRTY_PROMPT_DELAY: Duration = Duration::from_millis(600);

/// Framed output of the splitter, in strict arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete line (terminator stripped).
    Line(String),
    /// The trailing status line of an output unit; flushes the current block.
    Prompt(String),
}

/// What to do with a dirty tail that does not look like a protocol line.
///
/// The predecessor of this code had an operator-precedence slip that made
/// its protocol-prefix check always true, so it flushed every dirty tail
/// immediately as a line. `FlushAll` reproduces that legacy behavior;
/// `ProtocolOnly` withholds non-protocol tails for the timeout, which is
/// what the check was evidently meant to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirtyTailPolicy {
    #[default]
    ProtocolOnly,
    FlushAll,
}

/// Reassembles a raw byte stream into line and prompt events.
#[derive(Debug)]
pub struct FrameSplitter {
    /// Pending dirty tail, raw bytes. At most one partial unit.
    carry: Vec<u8>,
    armed: bool,
    policy: DirtyTailPolicy,
}

impl FrameSplitter {
    pub fn new(policy: DirtyTailPolicy) -> Self {
        Self {
            carry: Vec::new(),
            armed: false,
            policy,
        }
    }

    /// Feed a raw chunk, returning every event it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut rest = buf.as_slice();
        while let Some(pos) = find_marker(rest) {
            self.process_clean(&rest[..pos], &mut out);
            rest = &rest[pos + GO_AHEAD.len()..];
        }
        if !rest.is_empty() {
            self.process_dirty(rest, &mut out);
        }
        out
    }

    /// Whether a dirty tail is pending and the delay timer should run.
    pub fn timer_armed(&self) -> bool {
        self.armed
    }

    /// The delay timer fired: force the withheld tail out as a dirty
    /// prompt, unless it is blank.
    pub fn on_timeout(&mut self) -> Option<StreamEvent> {
        self.armed = false;
        let text = String::from_utf8_lossy(&self.carry);
        if text.trim().is_empty() {
            return None;
        }
        let prompt = text.into_owned();
        self.carry.clear();
        Some(StreamEvent::Prompt(prompt))
    }

    fn process_clean(&mut self, unit: &[u8], out: &mut Vec<StreamEvent>) {
        self.armed = false;
        let (lines, tail) = split_lines(unit);
        for line in lines {
            out.push(StreamEvent::Line(decode(line)));
        }
        out.push(StreamEvent::Prompt(decode(tail)));
    }

    fn process_dirty(&mut self, unit: &[u8], out: &mut Vec<StreamEvent>) {
        let (lines, tail) = split_lines(unit);
        for line in lines {
            out.push(StreamEvent::Line(decode(line)));
        }
        if tail.is_empty() {
            self.armed = false;
            return;
        }
        let flush = match self.policy {
            DirtyTailPolicy::FlushAll => true,
            DirtyTailPolicy::ProtocolOnly => tail.starts_with(PROTOCOL_PREFIX.as_bytes()),
        };
        if flush {
            self.armed = false;
            out.push(StreamEvent::Line(decode(tail)));
        } else {
            self.carry = tail.to_vec();
            self.armed = true;
        }
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(GO_AHEAD.len()).position(|w| w == GO_AHEAD)
}

/// Split on CRLF: complete lines plus the unterminated tail.
fn split_lines(unit: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < unit.len() {
        if unit[i] == b'\r' && unit[i + 1] == b'\n' {
            lines.push(&unit[start..i]);
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    (lines, &unit[start..])
}
