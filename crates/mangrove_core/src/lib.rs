//! Mangrove report lifecycle and condition triage.
//!
//! Field reports enter as `pending`, are moderated once, and valid reports
//! are analyzed into an urgency-ranked `Analisis` that also updates the
//! reporting site's aggregate.

pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod location;
pub mod moderation;
pub mod schema;
pub mod triage;
pub mod urgency;

pub use engine::{RetrySummary, TriageEngine};
pub use error::{Result, TriageError};

use time::macros::{datetime, format_description};
use time::{OffsetDateTime, UtcOffset};

/// Earliest instant with a four-digit year; older instants are stored as it.
const EARLIEST_TIMESTAMP: OffsetDateTime = datetime!(0000-01-01 0:00 UTC);

/// RFC 3339 in UTC with fixed microsecond precision, so stored timestamps
/// sort lexically.
pub fn format_timestamp(at: OffsetDateTime) -> Result<String> {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    let at = at.to_offset(UtcOffset::UTC).max(EARLIEST_TIMESTAMP);
    Ok(at.format(&format)?)
}

pub fn now_rfc3339() -> Result<String> {
    format_timestamp(OffsetDateTime::now_utc())
}
