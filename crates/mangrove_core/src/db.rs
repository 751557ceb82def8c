use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, TriageError};
use crate::schema::{
    Analisis, Coordinate, LocationAggregate, Measurements, ReportRecord, ReportStatus,
};

pub fn open(db_path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    init(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    Ok(conn)
}

fn init(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS locations (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          latitude REAL NOT NULL,
          longitude REAL NOT NULL,
          specimen_count INTEGER,
          density REAL,
          avg_height REAL,
          avg_diameter REAL,
          condition TEXT CHECK (condition IN ('baik', 'sedang', 'buruk')),
          area REAL,
          description TEXT,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reports (
          id TEXT PRIMARY KEY,
          site_id TEXT NOT NULL REFERENCES locations(id),
          submitter_id TEXT,
          species_id TEXT,
          report_type TEXT NOT NULL,
          body TEXT NOT NULL,
          photo_ref TEXT,
          specimen_count INTEGER,
          density REAL,
          avg_height REAL,
          avg_diameter REAL,
          area REAL,
          status TEXT NOT NULL CHECK (status IN ('pending', 'valid', 'ditolak')),
          submitted_at TEXT NOT NULL,
          decided_at TEXT,
          moderator_id TEXT,
          analysis_pending INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_reports_site ON reports(site_id, submitted_at);
        CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status);

        CREATE TABLE IF NOT EXISTS analyses (
          id TEXT PRIMARY KEY,
          report_id TEXT NOT NULL REFERENCES reports(id),
          condition TEXT NOT NULL,
          confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
          cause TEXT NOT NULL,
          recommendation TEXT NOT NULL,
          urgency TEXT NOT NULL,
          source TEXT NOT NULL,
          analyzed_at TEXT NOT NULL,
          superseded_by TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_analyses_current
          ON analyses(report_id) WHERE superseded_by IS NULL;

        CREATE TRIGGER IF NOT EXISTS reports_no_delete BEFORE DELETE ON reports
        BEGIN
          SELECT RAISE(ABORT, 'reports are never deleted');
        END;

        CREATE TRIGGER IF NOT EXISTS analyses_no_delete BEFORE DELETE ON analyses
        BEGIN
          SELECT RAISE(ABORT, 'analyses are never deleted');
        END;
        "#,
    )?;
    Ok(())
}

// =============================================================================
// Locations
// =============================================================================

const LOCATION_COLUMNS: &str = "id, name, latitude, longitude, specimen_count, density, \
     avg_height, avg_diameter, condition, area, description, updated_at";

pub fn insert_location(conn: &Connection, site: &LocationAggregate) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO locations (
          id, name, latitude, longitude, specimen_count, density,
          avg_height, avg_diameter, condition, area, description, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            site.id,
            site.name,
            site.coordinate.latitude,
            site.coordinate.longitude,
            site.specimen_count,
            site.density,
            site.avg_height,
            site.avg_diameter,
            site.condition.map(|c| c.as_str()),
            site.area,
            site.description,
            site.updated_at,
        ],
    )?;
    Ok(())
}

/// Persist measurements and condition. Name, coordinate and description are
/// administrative and left untouched.
pub fn save_location_state(conn: &Connection, site: &LocationAggregate) -> Result<()> {
    let changed = conn.execute(
        r#"
        UPDATE locations SET
          specimen_count = ?2,
          density = ?3,
          avg_height = ?4,
          avg_diameter = ?5,
          condition = ?6,
          area = ?7,
          updated_at = ?8
        WHERE id = ?1
        "#,
        params![
            site.id,
            site.specimen_count,
            site.density,
            site.avg_height,
            site.avg_diameter,
            site.condition.map(|c| c.as_str()),
            site.area,
            site.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(TriageError::not_found("location", &site.id));
    }
    Ok(())
}

pub fn get_location(conn: &Connection, id: &str) -> Result<Option<LocationAggregate>> {
    let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], location_from_row).optional()?)
}

pub fn location_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM locations WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn list_locations(conn: &Connection) -> Result<Vec<LocationAggregate>> {
    let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations ORDER BY name, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], location_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn location_from_row(row: &Row<'_>) -> rusqlite::Result<LocationAggregate> {
    let condition: Option<String> = row.get(8)?;
    Ok(LocationAggregate {
        id: row.get(0)?,
        name: row.get(1)?,
        coordinate: Coordinate {
            latitude: row.get(2)?,
            longitude: row.get(3)?,
        },
        specimen_count: row.get(4)?,
        density: row.get(5)?,
        avg_height: row.get(6)?,
        avg_diameter: row.get(7)?,
        condition: condition.map(|raw| parse_text(8, &raw)).transpose()?,
        area: row.get(9)?,
        description: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

// =============================================================================
// Reports
// =============================================================================

const REPORT_COLUMNS: &str = "id, site_id, submitter_id, species_id, report_type, body, \
     photo_ref, specimen_count, density, avg_height, avg_diameter, area, status, \
     submitted_at, decided_at, moderator_id, analysis_pending";

/// Filter for `list_reports`. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct ReportQuery {
    pub site_id: Option<String>,
    pub status: Option<ReportStatus>,
    pub analysis_pending: Option<bool>,
}

pub fn insert_report(conn: &Connection, report: &ReportRecord) -> Result<()> {
    if !location_exists(conn, &report.site_id)? {
        return Err(TriageError::validation(
            "report",
            "site_id",
            format!("location {} does not exist", report.site_id),
        ));
    }
    let m = &report.measurements;
    conn.execute(
        r#"
        INSERT INTO reports (
          id, site_id, submitter_id, species_id, report_type, body, photo_ref,
          specimen_count, density, avg_height, avg_diameter, area,
          status, submitted_at, decided_at, moderator_id, analysis_pending
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
        params![
            report.id,
            report.site_id,
            report.submitter_id,
            report.species_id,
            report.report_type,
            report.body,
            report.photo_ref,
            m.specimen_count,
            m.density,
            m.avg_height,
            m.avg_diameter,
            m.area,
            report.status.as_str(),
            report.submitted_at,
            report.decided_at,
            report.moderator_id,
            report.analysis_pending,
        ],
    )?;
    Ok(())
}

pub fn get_report(conn: &Connection, id: &str) -> Result<Option<ReportRecord>> {
    let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], report_from_row).optional()?)
}

pub fn list_reports(conn: &Connection, query: &ReportQuery) -> Result<Vec<ReportRecord>> {
    let mut sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(site_id) = &query.site_id {
        sql.push_str(" AND site_id = ?");
        params_vec.push(Box::new(site_id.clone()));
    }
    if let Some(status) = query.status {
        sql.push_str(" AND status = ?");
        params_vec.push(Box::new(status.as_str()));
    }
    if let Some(pending) = query.analysis_pending {
        sql.push_str(" AND analysis_pending = ?");
        params_vec.push(Box::new(pending));
    }
    sql.push_str(" ORDER BY submitted_at, id");

    let mut stmt = conn.prepare(&sql)?;
    let refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(refs.as_slice(), report_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Move a pending report to `status`. Returns false when the report was no
/// longer pending, so at most one decision can ever land.
pub fn record_decision(
    conn: &Connection,
    id: &str,
    status: ReportStatus,
    moderator_id: &str,
    decided_at: &str,
    analysis_pending: bool,
) -> Result<bool> {
    let changed = conn.execute(
        r#"
        UPDATE reports
        SET status = ?2, moderator_id = ?3, decided_at = ?4, analysis_pending = ?5
        WHERE id = ?1 AND status = 'pending'
        "#,
        params![id, status.as_str(), moderator_id, decided_at, analysis_pending],
    )?;
    Ok(changed == 1)
}

pub fn set_analysis_pending(conn: &Connection, id: &str, pending: bool) -> Result<()> {
    conn.execute(
        "UPDATE reports SET analysis_pending = ?2 WHERE id = ?1",
        params![id, pending],
    )?;
    Ok(())
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<ReportRecord> {
    let status: String = row.get(12)?;
    Ok(ReportRecord {
        id: row.get(0)?,
        site_id: row.get(1)?,
        submitter_id: row.get(2)?,
        species_id: row.get(3)?,
        report_type: row.get(4)?,
        body: row.get(5)?,
        photo_ref: row.get(6)?,
        measurements: Measurements {
            specimen_count: row.get(7)?,
            density: row.get(8)?,
            avg_height: row.get(9)?,
            avg_diameter: row.get(10)?,
            area: row.get(11)?,
        },
        status: parse_text(12, &status)?,
        submitted_at: row.get(13)?,
        decided_at: row.get(14)?,
        moderator_id: row.get(15)?,
        analysis_pending: row.get(16)?,
    })
}

// =============================================================================
// Analyses
// =============================================================================

const ANALYSIS_COLUMNS: &str = "id, report_id, condition, confidence, cause, recommendation, \
     urgency, source, analyzed_at, superseded_by";

/// Store `analysis` as the current analysis of its report.
///
/// The report must be valid. With `supersede` the existing current analysis
/// is marked superseded by the new one; without it an existing current
/// analysis is an error.
pub fn insert_analysis(conn: &Connection, analysis: &Analisis, supersede: bool) -> Result<()> {
    let report = get_report(conn, &analysis.report_id)?
        .ok_or_else(|| TriageError::not_found("report", &analysis.report_id))?;
    if report.status != ReportStatus::Valid {
        return Err(TriageError::validation(
            "analysis",
            "report_id",
            format!("report {} is {}, only valid reports are analyzed", report.id, report.status),
        ));
    }

    if let Some(current) = current_analysis(conn, &analysis.report_id)? {
        if !supersede {
            return Err(TriageError::validation(
                "analysis",
                "supersede",
                format!("report {} already has analysis {}", report.id, current.id),
            ));
        }
        conn.execute(
            "UPDATE analyses SET superseded_by = ?2 WHERE id = ?1",
            params![current.id, analysis.id],
        )?;
    }

    conn.execute(
        r#"
        INSERT INTO analyses (
          id, report_id, condition, confidence, cause, recommendation,
          urgency, source, analyzed_at, superseded_by
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)
        "#,
        params![
            analysis.id,
            analysis.report_id,
            analysis.condition.as_str(),
            analysis.confidence,
            analysis.cause.as_str(),
            analysis.recommendation,
            analysis.urgency.as_str(),
            analysis.source.as_str(),
            analysis.analyzed_at,
        ],
    )?;
    Ok(())
}

pub fn current_analysis(conn: &Connection, report_id: &str) -> Result<Option<Analisis>> {
    let sql = format!(
        "SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE report_id = ?1 AND superseded_by IS NULL"
    );
    Ok(conn.query_row(&sql, params![report_id], analysis_from_row).optional()?)
}

/// Every analysis of a report, oldest first.
pub fn analysis_history(conn: &Connection, report_id: &str) -> Result<Vec<Analisis>> {
    let sql = format!(
        "SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE report_id = ?1 ORDER BY analyzed_at, rowid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![report_id], analysis_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_analyses(conn: &Connection, report_id: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM analyses WHERE report_id = ?1",
        params![report_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Whether `report_id` is the most recently decided valid report at its
/// site that carries a current analysis. Ties on `decided_at` go to the
/// later submission.
pub fn is_latest_observation(conn: &Connection, site_id: &str, report_id: &str) -> Result<bool> {
    let newer: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM reports r
        JOIN analyses a ON a.report_id = r.id AND a.superseded_by IS NULL
        JOIN reports t ON t.id = ?2
        WHERE r.site_id = ?1 AND r.status = 'valid' AND r.id <> t.id
          AND (r.decided_at > t.decided_at
               OR (r.decided_at = t.decided_at AND r.rowid > t.rowid))
        "#,
        params![site_id, report_id],
        |row| row.get(0),
    )?;
    Ok(newer == 0)
}

/// Per-field means over the analyzed valid reports of a site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationMeans {
    pub specimen_count: Option<f64>,
    pub density: Option<f64>,
    pub avg_height: Option<f64>,
    pub avg_diameter: Option<f64>,
}

/// Means are taken over the reports that carry each field; a field no
/// report carries is `None`.
pub fn observation_means(conn: &Connection, site_id: &str) -> Result<ObservationMeans> {
    Ok(conn.query_row(
        r#"
        SELECT AVG(r.specimen_count), AVG(r.density), AVG(r.avg_height), AVG(r.avg_diameter)
        FROM reports r
        JOIN analyses a ON a.report_id = r.id AND a.superseded_by IS NULL
        WHERE r.site_id = ?1 AND r.status = 'valid'
        "#,
        params![site_id],
        |row| {
            Ok(ObservationMeans {
                specimen_count: row.get(0)?,
                density: row.get(1)?,
                avg_height: row.get(2)?,
                avg_diameter: row.get(3)?,
            })
        },
    )?)
}

/// Current analyses of valid reports joined with their site, unordered.
pub fn current_analyses_with_sites(
    conn: &Connection,
) -> Result<Vec<(Analisis, ReportRecord, LocationAggregate)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT a.id FROM analyses a
        JOIN reports r ON r.id = a.report_id
        WHERE a.superseded_by IS NULL AND r.status = 'valid'
        "#,
    )?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE id = ?1");
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let analysis = conn.query_row(&sql, params![id], analysis_from_row)?;
        let report = get_report(conn, &analysis.report_id)?
            .ok_or_else(|| TriageError::not_found("report", &analysis.report_id))?;
        let site = get_location(conn, &report.site_id)?
            .ok_or_else(|| TriageError::not_found("location", &report.site_id))?;
        out.push((analysis, report, site));
    }
    Ok(out)
}

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<Analisis> {
    let condition: String = row.get(2)?;
    let cause: String = row.get(4)?;
    let urgency: String = row.get(6)?;
    let source: String = row.get(7)?;
    Ok(Analisis {
        id: row.get(0)?,
        report_id: row.get(1)?,
        condition: parse_text(2, &condition)?,
        confidence: row.get(3)?,
        cause: parse_text(4, &cause)?,
        recommendation: row.get(5)?,
        urgency: parse_text(6, &urgency)?,
        source: parse_text(7, &source)?,
        analyzed_at: row.get(8)?,
        superseded_by: row.get(9)?,
    })
}

fn parse_text<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = TriageError>,
{
    raw.parse().map_err(|e: TriageError| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}
