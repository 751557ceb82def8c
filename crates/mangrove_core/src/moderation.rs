//! Moderation state machine
//!
//! pending -> valid | ditolak. Both targets are terminal.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Result, TriageError};
use crate::schema::{Measurements, ReportDraft, ReportRecord, ReportStatus};

pub fn is_legal_transition(from: ReportStatus, to: ReportStatus) -> bool {
    matches!(
        (from, to),
        (ReportStatus::Pending, ReportStatus::Valid)
            | (ReportStatus::Pending, ReportStatus::Ditolak)
    )
}

pub fn check_transition(report: &ReportRecord, to: ReportStatus) -> Result<()> {
    if is_legal_transition(report.status, to) {
        Ok(())
    } else {
        Err(TriageError::InvalidTransition {
            report_id: report.id.clone(),
            from: report.status,
            to,
        })
    }
}

/// Build a pending record from a draft. Site existence is checked by the
/// repository on insert.
pub fn new_record(draft: ReportDraft, submitted_at: OffsetDateTime) -> Result<ReportRecord> {
    validate_draft(&draft)?;
    Ok(ReportRecord {
        id: Uuid::new_v4().to_string(),
        site_id: draft.site_id.trim().to_string(),
        submitter_id: non_empty(draft.submitter_id),
        species_id: non_empty(draft.species_id),
        report_type: draft.report_type.trim().to_string(),
        body: draft.body.trim().to_string(),
        photo_ref: non_empty(draft.photo_ref),
        measurements: draft.measurements,
        status: ReportStatus::Pending,
        submitted_at: crate::format_timestamp(submitted_at)?,
        decided_at: None,
        moderator_id: None,
        analysis_pending: false,
    })
}

pub fn validate_draft(draft: &ReportDraft) -> Result<()> {
    require_text("site_id", &draft.site_id)?;
    require_text("report_type", &draft.report_type)?;
    require_text("body", &draft.body)?;
    validate_measurements(&draft.measurements)
}

pub fn validate_measurements(m: &Measurements) -> Result<()> {
    let fields = [
        ("density", m.density),
        ("avg_height", m.avg_height),
        ("avg_diameter", m.avg_diameter),
        ("area", m.area),
    ];
    for (field, value) in fields {
        if let Some(value) = value {
            if !value.is_finite() || value < 0.0 {
                return Err(TriageError::validation(
                    "report",
                    format!("measurements.{field}"),
                    format!("{value} is not a non-negative number"),
                ));
            }
        }
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TriageError::validation("report", field, "must not be empty"));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
