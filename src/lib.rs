//! nplusone - in-process N+1 query detection with call-site attribution
//!
//! Every SQL statement executed during a unit of work (typically one HTTP
//! request) is reduced to a shape fingerprint and counted. When the unit of
//! work ends, each fingerprint that repeated at least `threshold` times is
//! reported together with the unit id and the application frame that first
//! issued it.
//!
//! ```
//! use nplusone::{report::CollectingSink, Finder, FinderConfig, QueryHook};
//!
//! # fn main() -> nplusone::Result<()> {
//! let sink = CollectingSink::new();
//! let finder = Finder::builder()
//!     .config(FinderConfig::default())
//!     .sink(sink.clone())
//!     .build()?;
//!
//! finder.instrument("GET /users", || {
//!     for id in 1..=3 {
//!         finder.on_query(&format!("SELECT * FROM posts WHERE user_id = {}", id));
//!     }
//! });
//!
//! let findings = sink.findings();
//! assert_eq!(findings.len(), 1);
//! assert_eq!(findings[0].count, 3);
//! assert_eq!(findings[0].fingerprint, "select * from posts where user_id = ?");
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod caller;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod finder;
pub mod fingerprint;
pub mod replay;
pub mod report;
pub mod sidecar;

pub use caller::CallSite;
pub use config::{AggregationMode, FinderConfig, ReentrancyPolicy};
pub use error::{FinderError, Result};
pub use finder::{Finder, FinderBuilder, QueryHook, UnitOfWork};
pub use fingerprint::{Fingerprinter, SqlFingerprinter};
pub use report::{Finding, FindingSink};
