//! Site aggregates
//!
//! A site's measurements are folded from validated, analyzed reports.

use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::config::AggregatePolicy;
use crate::db::{self, ObservationMeans};
use crate::error::{Result, TriageError};
use crate::schema::{
    Analisis, Condition, LocationAggregate, Measurements, NewLocation, ReportRecord, ReportStatus,
    SiteCondition,
};

pub fn create_site(conn: &Connection, input: NewLocation) -> Result<LocationAggregate> {
    if input.name.trim().is_empty() {
        return Err(TriageError::validation("location", "name", "must not be empty"));
    }
    let lat = input.coordinate.latitude;
    let lon = input.coordinate.longitude;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(TriageError::validation(
            "location",
            "coordinate.latitude",
            format!("{lat} is out of range"),
        ));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(TriageError::validation(
            "location",
            "coordinate.longitude",
            format!("{lon} is out of range"),
        ));
    }
    if let Some(area) = input.area {
        if !area.is_finite() || area < 0.0 {
            return Err(TriageError::validation(
                "location",
                "area",
                format!("{area} is not a non-negative number"),
            ));
        }
    }

    let site = LocationAggregate {
        id: input
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: input.name.trim().to_string(),
        coordinate: input.coordinate,
        specimen_count: None,
        density: None,
        avg_height: None,
        avg_diameter: None,
        condition: None,
        area: input.area,
        description: input.description,
        updated_at: crate::now_rfc3339()?,
    };
    db::insert_location(conn, &site)?;
    Ok(site)
}

/// Fold a valid report and its analysis into the report's site.
pub fn update(
    conn: &Connection,
    report: &ReportRecord,
    analysis: &Analisis,
    policy: AggregatePolicy,
) -> Result<LocationAggregate> {
    if report.status != ReportStatus::Valid {
        return Err(TriageError::validation(
            "report",
            "status",
            format!("report {} is {}, only valid reports update a site", report.id, report.status),
        ));
    }
    if analysis.report_id != report.id {
        return Err(TriageError::validation(
            "analysis",
            "report_id",
            format!("analysis {} belongs to report {}", analysis.id, analysis.report_id),
        ));
    }

    let site = db::get_location(conn, &report.site_id)?
        .ok_or_else(|| TriageError::not_found("location", &report.site_id))?;
    let recency = if db::is_latest_observation(conn, &site.id, &report.id)? {
        Recency::Latest
    } else {
        Recency::Older
    };

    let mut updated = fold(&site, &report.measurements, analysis.condition, recency);
    if policy == AggregatePolicy::MovingAverage {
        apply_means(&mut updated, &db::observation_means(conn, &site.id)?);
    }
    updated.updated_at = crate::now_rfc3339()?;
    db::save_location_state(conn, &updated)?;

    debug!(
        site_id = %updated.id,
        report_id = %report.id,
        ?recency,
        condition = ?updated.condition,
        "site aggregate updated"
    );
    Ok(updated)
}

/// Position of a report among the analyzed reports of its site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recency {
    /// No other analyzed report at the site was decided after it.
    Latest,
    Older,
}

/// Pure fold of one observation into a site. The latest observation
/// overwrites each field it carries; an older one only fills fields the
/// site has never seen.
pub fn fold(
    site: &LocationAggregate,
    m: &Measurements,
    condition: Condition,
    recency: Recency,
) -> LocationAggregate {
    let observed = SiteCondition::from(condition);
    let mut next = site.clone();
    match recency {
        Recency::Latest => {
            next.specimen_count = m.specimen_count.or(site.specimen_count);
            next.density = m.density.or(site.density);
            next.avg_height = m.avg_height.or(site.avg_height);
            next.avg_diameter = m.avg_diameter.or(site.avg_diameter);
            next.area = m.area.or(site.area);
            next.condition = Some(observed);
        }
        Recency::Older => {
            next.specimen_count = site.specimen_count.or(m.specimen_count);
            next.density = site.density.or(m.density);
            next.avg_height = site.avg_height.or(m.avg_height);
            next.avg_diameter = site.avg_diameter.or(m.avg_diameter);
            next.area = site.area.or(m.area);
            next.condition = site.condition.or(Some(observed));
        }
    }
    next
}

/// Replace sampled measurements with their means. Area is a survey
/// boundary and keeps its latest value.
pub fn apply_means(site: &mut LocationAggregate, means: &ObservationMeans) {
    if let Some(count) = means.specimen_count {
        site.specimen_count = Some(count.round() as u32);
    }
    site.density = means.density.or(site.density);
    site.avg_height = means.avg_height.or(site.avg_height);
    site.avg_diameter = means.avg_diameter.or(site.avg_diameter);
}
