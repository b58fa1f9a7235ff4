//! Reporting sink for test progress and fault readouts.
//!
//! The console reporter prints phase messages gated by verbosity, progress
//! either as plain lines or as in-place `indicatif` bars, and fault dumps
//! to stderr.

use crate::ledger::LedgerReadout;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// How much detail the reporter prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Test start and end messages only.
    Quiet = 0,
    /// Adds pattern messages inside tests.
    Patterns = 1,
    /// Adds per-window progress messages.
    Progress = 2,
}

impl Verbosity {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Quiet,
            1 => Self::Patterns,
            _ => Self::Progress,
        }
    }
}

/// Line-oriented consumer of test output.
pub trait Reporter: Send + Sync {
    /// A human-readable message, shown when `level` is within the verbosity.
    fn message(&self, level: Verbosity, text: &str);

    /// `finished` out of `total` blocks of `phase` are done.
    fn progress(&self, phase: &str, finished: usize, total: usize);

    /// Dump of a ledger readout that contained faults.
    fn faults(&self, phase: &str, readout: &LedgerReadout);
}

/// Renders a readout as the lines printed for it.
pub fn format_readout(phase: &str, readout: &LedgerReadout) -> Vec<String> {
    let mut lines = Vec::with_capacity(readout.records.len() + 2);
    lines.push(format!(
        "ERROR: {} fault(s) in {}; the last {} fault addresses are:",
        readout.total,
        phase,
        readout.records.len()
    ));
    for (i, record) in readout.records.iter().enumerate() {
        lines.push(format!(
            "  [{}] address={:#x} expected={:#x} observed={:#x} diff={:#x} reread={:#x} reread_diff={:#x}",
            i,
            record.address,
            record.expected,
            record.observed,
            record.diff(),
            record.reread,
            record.reread_diff()
        ));
    }
    if readout.dropped() > 0 {
        lines.push(format!(
            "  ... {} older record(s) overwritten",
            readout.dropped()
        ));
    }
    lines
}

/// Reporter writing to stdout/stderr.
pub struct ConsoleReporter {
    verbosity: Verbosity,
    interactive: bool,
    bar: Mutex<Option<(String, ProgressBar)>>,
}

impl ConsoleReporter {
    pub fn new(verbosity: Verbosity, interactive: bool) -> Self {
        Self {
            verbosity,
            interactive,
            bar: Mutex::new(None),
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut bar) = self.bar.lock() {
            if let Some((_, pb)) = bar.take() {
                pb.finish();
            }
        }
    }

    fn update_bar(&self, phase: &str, finished: usize, total: usize) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        let stale = slot.as_ref().map_or(true, |(name, _)| name != phase);
        if stale {
            if let Some((_, pb)) = slot.take() {
                pb.finish();
            }
            let pb = ProgressBar::new(total as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} blocks")
            {
                pb.set_style(style.progress_chars("=> "));
            }
            pb.set_message(phase.to_string());
            *slot = Some((phase.to_string(), pb));
        }
        if let Some((_, pb)) = slot.as_ref() {
            pb.set_position(finished as u64);
            if finished >= total {
                pb.finish();
            }
        }
    }
}

impl Reporter for ConsoleReporter {
    fn message(&self, level: Verbosity, text: &str) {
        if level <= self.verbosity {
            self.finish_bar();
            println!("{}", text);
        }
    }

    fn progress(&self, phase: &str, finished: usize, total: usize) {
        if self.verbosity < Verbosity::Progress {
            return;
        }
        if self.interactive {
            self.update_bar(phase, finished, total);
        } else {
            println!("{}: {} out of {} blocks finished", phase, finished, total);
        }
    }

    fn faults(&self, phase: &str, readout: &LedgerReadout) {
        self.finish_bar();
        for line in format_readout(phase, readout) {
            eprintln!("{}", line);
        }
    }
}

/// Reporter that keeps everything in memory, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct CaptureReporter {
    pub messages: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<(String, usize, usize)>>,
    pub readouts: Mutex<Vec<(String, LedgerReadout)>>,
}

#[cfg(test)]
impl CaptureReporter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn readouts(&self) -> Vec<(String, LedgerReadout)> {
        self.readouts.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Reporter for CaptureReporter {
    fn message(&self, _level: Verbosity, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }

    fn progress(&self, phase: &str, finished: usize, total: usize) {
        self.progress
            .lock()
            .unwrap()
            .push((phase.to_string(), finished, total));
    }

    fn faults(&self, phase: &str, readout: &LedgerReadout) {
        self.readouts
            .lock()
            .unwrap()
            .push((phase.to_string(), readout.clone()));
    }
}
