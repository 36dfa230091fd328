//! Replay of recorded statement logs
//!
//! Log format, one entry per line:
//!
//! ```text
//! >>> GET /users            begin a unit of work
//! SELECT * FROM users       one SQL statement
//! SELECT * FROM posts WHERE user_id = 1
//! <<<                       end the unit of work
//! // comment                ignored, as are blank lines
//! ```
//!
//! Each statement's call site is the log itself (`file:line`). A `>>>` while
//! a unit is open ends that unit first; an unterminated unit ends at end of
//! input; statements outside any unit are counted as orphans.

use crate::caller::CallSite;
use crate::finder::Finder;
use crate::report::Finding;

/// One parsed log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Begin(String),
    End,
    Statement { sql: String, line: u32 },
}

/// Parse a statement log into entries
pub fn parse_log(source: &str) -> Vec<LogEntry> {
    source
        .lines()
        .enumerate()
        .filter_map(|(index, raw)| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                return None;
            }
            if let Some(unit) = line.strip_prefix(">>>") {
                return Some(LogEntry::Begin(unit.trim().to_string()));
            }
            if line.starts_with("<<<") {
                return Some(LogEntry::End);
            }
            Some(LogEntry::Statement {
                sql: line.to_string(),
                line: u32::try_from(index + 1).unwrap_or(u32::MAX),
            })
        })
        .collect()
}

/// Outcome of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub units: usize,
    pub statements: usize,
    /// Statements outside any unit of work
    pub orphans: usize,
    pub findings: Vec<Finding>,
}

/// Feed a statement log through `finder`
///
/// `label` names the log in call sites (usually its path).
pub fn replay(finder: &Finder, label: &str, source: &str) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    let mut open = false;

    for entry in parse_log(source) {
        match entry {
            LogEntry::Begin(unit) => {
                if open {
                    summary.findings.extend(finder.end());
                }
                match finder.begin(unit) {
                    Ok(()) => {
                        open = true;
                        summary.units += 1;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Skipping unit of work");
                        open = false;
                    }
                }
            }
            LogEntry::End => {
                if open {
                    summary.findings.extend(finder.end());
                    open = false;
                } else {
                    tracing::debug!("Unmatched end marker ignored");
                }
            }
            LogEntry::Statement { sql, line } => {
                if open {
                    summary.statements += 1;
                    finder.record(&sql, Some(CallSite::new(label, line)));
                } else {
                    summary.orphans += 1;
                }
            }
        }
    }

    if open {
        summary.findings.extend(finder.end());
    }

    tracing::debug!(
        units = summary.units,
        statements = summary.statements,
        orphans = summary.orphans,
        findings = summary.findings.len(),
        "Replay finished"
    );
    summary
}
