// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Change summary parsing from engine output

use ot_core::{Phase, Report};
use regex::Regex;
use std::sync::LazyLock;

static PLAN_SUMMARY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy").ok()
});

static APPLY_SUMMARY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:Apply|Destroy) complete! Resources: (?:(\d+) added, (\d+) changed, )?(\d+) destroyed")
        .ok()
});

const NO_CHANGES: &str = "No changes.";

/// Longest partial line held while scanning; longer lines keep their end.
const MAX_LINE_BYTES: usize = 4096;

/// Extract the resource change counts from a phase's stdout.
///
/// The last summary line wins. `None` when the output has neither a summary
/// nor a "No changes." line.
pub fn parse_report(phase: Phase, stdout: &str) -> Option<Report> {
    let mut scanner = ReportScanner::new(phase);
    scanner.feed(stdout.as_bytes());
    scanner.finish()
}

/// [`parse_report`] over output as it streams, holding one line at a time.
#[derive(Debug)]
pub struct ReportScanner {
    phase: Phase,
    line: Vec<u8>,
    report: Option<Report>,
    no_changes: bool,
}

impl ReportScanner {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            line: Vec::new(),
            report: None,
            no_changes: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        for piece in bytes.split_inclusive(|b| *b == b'\n') {
            self.line.extend_from_slice(piece);
            if piece.ends_with(b"\n") {
                self.scan_line();
            } else if self.line.len() > MAX_LINE_BYTES {
                self.line.drain(..self.line.len() - MAX_LINE_BYTES);
            }
        }
    }

    pub fn finish(mut self) -> Option<Report> {
        if !self.line.is_empty() {
            self.scan_line();
        }
        self.report.or(self.no_changes.then(Report::default))
    }

    fn scan_line(&mut self) {
        let text = String::from_utf8_lossy(&self.line);
        if let Some(report) = summary(self.phase, &text) {
            self.report = Some(report);
        } else if text.contains(NO_CHANGES) {
            self.no_changes = true;
        }
        self.line.clear();
    }
}

fn summary(phase: Phase, line: &str) -> Option<Report> {
    let pattern = match phase {
        Phase::Plan => PLAN_SUMMARY.as_ref()?,
        Phase::Apply => APPLY_SUMMARY.as_ref()?,
    };
    let count = |m: Option<regex::Match<'_>>| m.and_then(|m| m.as_str().parse::<u32>().ok()).unwrap_or(0);
    let caps = pattern.captures_iter(line).last()?;
    Some(Report::new(count(caps.get(1)), count(caps.get(2)), count(caps.get(3))))
}

#[cfg(test)]
#[path = "report_tests.rs"]
mod tests;
