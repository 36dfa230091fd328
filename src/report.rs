//! Threshold evaluation and finding emission
//!
//! At the end of a unit of work every fingerprint seen at least `threshold`
//! times becomes a [`Finding`]. Findings go to a [`FindingSink`]; a failing
//! sink is logged and otherwise ignored so reporting can never break the
//! request that was being measured.

use crate::aggregator::AggregationContext;
use crate::caller::CallSite;
use crate::error::{FinderError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

/// Log message attached to every finding
pub const FINDING_MESSAGE: &str = "N+1 query detected";

/// A fingerprint that repeated at least `threshold` times in one unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub unit_id: String,
    pub fingerprint: String,
    pub count: usize,
    pub call_site: Option<CallSite>,
}

impl Finding {
    /// `file:line`, or `unknown` when no application frame was found
    pub fn caller(&self) -> String {
        self.call_site
            .as_ref()
            .map_or_else(|| "unknown".to_string(), CallSite::to_string)
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}x [{}] {} at {}",
            FINDING_MESSAGE,
            self.count,
            self.unit_id,
            self.fingerprint,
            self.caller()
        )
    }
}

/// Destination for findings
pub trait FindingSink: Send + Sync {
    fn emit(&self, finding: &Finding) -> Result<()>;
}

impl<S: FindingSink + ?Sized> FindingSink for Arc<S> {
    fn emit(&self, finding: &Finding) -> Result<()> {
        (**self).emit(finding)
    }
}

impl<S: FindingSink + ?Sized> FindingSink for Box<S> {
    fn emit(&self, finding: &Finding) -> Result<()> {
        (**self).emit(finding)
    }
}

/// Emits each finding as a WARN event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl FindingSink for TracingSink {
    fn emit(&self, finding: &Finding) -> Result<()> {
        tracing::warn!(
            query = %finding.fingerprint,
            count = finding.count,
            unit = %finding.unit_id,
            caller = %finding.caller(),
            "{}",
            FINDING_MESSAGE
        );
        Ok(())
    }
}

/// One JSON object per finding, one per line
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> FindingSink for JsonLinesSink<W> {
    fn emit(&self, finding: &Finding) -> Result<()> {
        let record = serde_json::json!({
            "level": "WARN",
            "msg": FINDING_MESSAGE,
            "query": finding.fingerprint,
            "count": finding.count,
            "unit": finding.unit_id,
            "caller": finding.caller(),
        });
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Human-readable line per finding
#[derive(Debug)]
pub struct TextSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> FindingSink for TextSink<W> {
    fn emit(&self, finding: &Finding) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", finding)?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps findings in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    findings: Arc<Mutex<Vec<Finding>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<Finding> {
        std::mem::take(&mut *self.findings.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FindingSink for CollectingSink {
    fn emit(&self, finding: &Finding) -> Result<()> {
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(finding.clone());
        Ok(())
    }
}

/// Sends every finding to each inner sink
///
/// All sinks run even if one fails; the first error is returned.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn FindingSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl FindingSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FindingSink for FanoutSink {
    fn emit(&self, finding: &Finding) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(finding) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Turns closed aggregation contexts into findings
#[derive(Clone)]
pub struct Reporter {
    threshold: usize,
    sink: Arc<dyn FindingSink>,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    pub fn new(threshold: usize, sink: Arc<dyn FindingSink>) -> Self {
        Self { threshold, sink }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Findings for a context, most repeated first, without emitting them
    pub fn evaluate(&self, context: &AggregationContext) -> Vec<Finding> {
        let mut findings: Vec<Finding> = context
            .entries
            .iter()
            .filter(|(_, stats)| stats.count >= self.threshold)
            .map(|(fingerprint, stats)| Finding {
                unit_id: context.unit_id.clone(),
                fingerprint: fingerprint.clone(),
                count: stats.count,
                call_site: stats.first_call_site.clone(),
            })
            .collect();

        findings.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        findings
    }

    /// Evaluate and hand every finding to the sink
    ///
    /// Sink failures are logged and echoed to stderr, never propagated.
    pub fn report(&self, context: &AggregationContext) -> Vec<Finding> {
        let findings = self.evaluate(context);

        for finding in &findings {
            if let Err(err) = self.sink.emit(finding) {
                report_sink_failure(finding, &err);
            }
        }

        findings
    }
}

fn report_sink_failure(finding: &Finding, err: &FinderError) {
    tracing::error!(
        error = %err,
        unit = %finding.unit_id,
        query = %finding.fingerprint,
        "Failed to emit finding"
    );
    eprintln!("nplusone: failed to emit finding ({}): {}", err, finding);
}
