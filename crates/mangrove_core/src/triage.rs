use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering;

use crate::db;
use crate::error::Result;
use crate::schema::{AnalysisSource, Cause, Condition, Urgency};

/// One actionable finding in the intervention queue.
#[derive(Debug, Clone, Serialize)]
pub struct TriageEntry {
    pub report_id: String,
    pub analysis_id: String,
    pub site_id: String,
    pub site_name: String,
    pub urgency: Urgency,
    pub condition: Condition,
    pub cause: Cause,
    pub confidence: f64,
    pub source: AnalysisSource,
    pub recommendation: String,
    pub analyzed_at: String,
    pub analysis_pending: bool,
}

/// Current analyses of valid reports, most urgent first. Within an urgency
/// level higher confidence comes first, then the oldest analysis.
pub fn triage_queue(conn: &Connection, limit: Option<usize>) -> Result<Vec<TriageEntry>> {
    let mut entries: Vec<TriageEntry> = db::current_analyses_with_sites(conn)?
        .into_iter()
        .map(|(analysis, report, site)| TriageEntry {
            report_id: report.id,
            analysis_id: analysis.id,
            site_id: site.id,
            site_name: site.name,
            urgency: analysis.urgency,
            condition: analysis.condition,
            cause: analysis.cause,
            confidence: analysis.confidence,
            source: analysis.source,
            recommendation: analysis.recommendation,
            analyzed_at: analysis.analyzed_at,
            analysis_pending: report.analysis_pending,
        })
        .collect();

    entries.sort_by(compare_entries);
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    Ok(entries)
}

fn compare_entries(a: &TriageEntry, b: &TriageEntry) -> Ordering {
    b.urgency
        .cmp(&a.urgency)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.analyzed_at.cmp(&b.analyzed_at))
        .then_with(|| a.report_id.cmp(&b.report_id))
}
