//! Statement capture from `tracing` events
//!
//! Several Rust database drivers already report each executed statement as a
//! `tracing` event (`sqlx` logs under the `sqlx::query` target with the SQL
//! in `db.statement`). [`QueryCaptureLayer`] sits in the subscriber stack,
//! picks those events up and forwards the SQL to a [`QueryHook`], so no
//! driver wrapping is needed:
//!
//! ```no_run
//! use nplusone::{capture::QueryCaptureLayer, Finder, FinderConfig};
//! use tracing_subscriber::prelude::*;
//!
//! # fn main() -> nplusone::Result<()> {
//! let finder = Finder::new(FinderConfig::default())?;
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(QueryCaptureLayer::new(finder.clone()))
//!     .init();
//! # Ok(())
//! # }
//! ```

use crate::finder::QueryHook;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Event target prefix used by `sqlx` for executed statements
pub const SQLX_QUERY_TARGET: &str = "sqlx::query";

/// Field carrying the full statement, in lookup order of preference
const STATEMENT_FIELDS: [&str; 3] = ["db.statement", "summary", "message"];

/// Forwards SQL found in matching `tracing` events to a [`QueryHook`]
pub struct QueryCaptureLayer<H> {
    hook: H,
    targets: Vec<String>,
}

impl<H: QueryHook + 'static> QueryCaptureLayer<H> {
    /// Capture `sqlx` statement events
    pub fn new(hook: H) -> Self {
        Self {
            hook,
            targets: vec![SQLX_QUERY_TARGET.to_string()],
        }
    }

    /// Also capture events whose target starts with `target`
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    fn matches(&self, target: &str) -> bool {
        self.targets.iter().any(|t| target.starts_with(t.as_str()))
    }
}

impl<H> fmt::Debug for QueryCaptureLayer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCaptureLayer")
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

impl<S, H> Layer<S> for QueryCaptureLayer<H>
where
    S: Subscriber,
    H: QueryHook + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.matches(event.metadata().target()) {
            return;
        }

        let mut visitor = StatementVisitor::default();
        event.record(&mut visitor);
        if let Some(sql) = visitor.into_statement() {
            self.hook.on_query(&sql);
        }
    }
}

/// Collects the candidate statement fields of one event
#[derive(Debug, Default)]
struct StatementVisitor {
    found: [Option<String>; STATEMENT_FIELDS.len()],
}

impl StatementVisitor {
    fn slot(&mut self, field: &Field) -> Option<&mut Option<String>> {
        let index = STATEMENT_FIELDS.iter().position(|name| *name == field.name())?;
        Some(&mut self.found[index])
    }

    fn into_statement(self) -> Option<String> {
        self.found
            .into_iter()
            .flatten()
            .find(|sql| !sql.trim().is_empty())
    }
}

impl Visit for StatementVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(format!("{:?}", value));
        }
    }
}
