//! Column tabulation of monospaced output.
//!
//! The game renders inventories, who-lists and score sheets as runs of
//! whitespace-aligned lines. A run of two or more monospaced line entries
//! whose rows all split into multiple cells becomes one `table` entry, so
//! front ends can render real tables instead of preformatted text.

use mudgate_core::block::{Block, Entry, LineEntry, TableEntry};
use mudgate_core::session::Tabulator;
use regex::Regex;
use std::sync::OnceLock;

fn gap_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s{3,}").expect("gap pattern"))
}

/// Merges aligned line runs into table entries; everything else passes
/// through untouched.
#[derive(Debug, Default)]
pub struct ColumnTabulator;

impl Tabulator for ColumnTabulator {
    fn tabulate(&self, mut block: Block) -> Block {
        rewrite(&mut block);
        block
    }
}

fn rewrite(block: &mut Block) {
    let entries = std::mem::take(&mut block.entries);
    let mut out = Vec::with_capacity(entries.len());
    let mut run: Vec<LineEntry> = Vec::new();

    for entry in entries {
        match entry {
            Entry::Line(line) if is_monospaced(&line) => run.push(line),
            Entry::Block(mut nested) => {
                flush_run(&mut out, &mut run);
                rewrite(&mut nested);
                out.push(Entry::Block(nested));
            }
            other => {
                flush_run(&mut out, &mut run);
                out.push(other);
            }
        }
    }
    flush_run(&mut out, &mut run);
    block.entries = out;
}

fn is_monospaced(line: &LineEntry) -> bool {
    line.tags.iter().any(|t| t == "monospaced")
}

fn flush_run(out: &mut Vec<Entry>, run: &mut Vec<LineEntry>) {
    if run.len() < 2 {
        out.extend(run.drain(..).map(Entry::Line));
        return;
    }

    let rows: Vec<Vec<String>> = run.iter().map(|line| split_cells(&line.line)).collect();
    if rows.iter().all(|row| row.len() >= 2) {
        out.push(Entry::Table(TableEntry {
            qual: "table".into(),
            rows,
        }));
        run.clear();
    } else {
        // Aligned prose, not columns.
        out.extend(run.drain(..).map(Entry::Line));
    }
}

fn split_cells(line: &str) -> Vec<String> {
    let clean = strip_ansi_escapes::strip_str(line);
    gap_regex()
        .split(clean.trim_end())
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect()
}
