use anyhow::Result;
use mangrove_core::db::{self, ReportQuery};
use mangrove_core::schema::{Analisis, LocationAggregate, ReportRecord, ReportStatus};
use mangrove_core::triage;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub struct VaultPaths {
    pub root: PathBuf,
    pub index_dir: PathBuf,
    pub sites_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_dir: root.join("00_Index"),
            sites_dir: root.join("Sites"),
            reports_dir: root.join("Reports"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.index_dir)?;
        fs::create_dir_all(&self.sites_dir)?;
        fs::create_dir_all(&self.reports_dir)?;
        Ok(())
    }
}

/// Counts of notes written by `build_vault`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VaultSummary {
    pub sites: usize,
    pub reports: usize,
    pub triage_entries: usize,
}

pub fn build_vault(conn: &Connection, vault_root: &Path) -> Result<VaultSummary> {
    let paths = VaultPaths::new(vault_root);
    paths.ensure()?;
    let mut summary = VaultSummary::default();

    // 1) Report notes, grouped per site for the site notes
    let reports = db::list_reports(conn, &ReportQuery::default())?;
    let mut by_site: BTreeMap<String, Vec<ReportRecord>> = BTreeMap::new();
    for report in reports {
        let history = db::analysis_history(conn, &report.id)?;
        write_report_note(&paths, &report, &history)?;
        summary.reports += 1;
        by_site.entry(report.site_id.clone()).or_default().push(report);
    }

    // 2) Site notes and MOC
    let mut index_lines: Vec<String> = Vec::new();
    index_lines.push("# MOC - Sites".to_string());
    index_lines.push(String::new());
    index_lines.push("This index is generated. Do not edit manually.".to_string());
    index_lines.push(String::new());

    for site in db::list_locations(conn)? {
        let site_reports = by_site.remove(&site.id).unwrap_or_default();
        write_site_note(&paths, &site, &site_reports)?;
        index_lines.push(format!(
            "- [[Sites/{}|{}]] ({})",
            site.id,
            site.name,
            site.condition.map(|c| c.as_str()).unwrap_or("belum dinilai")
        ));
        summary.sites += 1;
    }
    fs::write(paths.index_dir.join("MOC - Sites.md"), index_lines.join("\n"))?;

    // 3) Triage board
    let queue = triage::triage_queue(conn, None)?;
    let mut board: Vec<String> = Vec::new();
    board.push("# Triage Board".to_string());
    board.push(String::new());
    board.push("This index is generated. Do not edit manually.".to_string());
    board.push(format!("Generated at `{}`.", mangrove_core::now_rfc3339()?));
    board.push(String::new());
    if queue.is_empty() {
        board.push("_No analyzed reports._".to_string());
    } else {
        board.push(
            "| Urgency | Site | Condition | Cause | Confidence | Action | Report |".to_string(),
        );
        board.push("|---|---|---|---|---|---|---|".to_string());
        for entry in &queue {
            let retry = if entry.analysis_pending { " (retry)" } else { "" };
            board.push(format!(
                "| {} | [[Sites/{}|{}]] | {} | {} | {:.2} ({}{}) | {} | [[Reports/{}]] |",
                entry.urgency,
                entry.site_id,
                entry.site_name,
                entry.condition,
                entry.cause,
                entry.confidence,
                entry.source,
                retry,
                entry.recommendation,
                entry.report_id
            ));
        }
    }
    summary.triage_entries = queue.len();
    fs::write(paths.index_dir.join("Triage Board.md"), board.join("\n"))?;

    Ok(summary)
}

fn write_site_note(
    paths: &VaultPaths,
    site: &LocationAggregate,
    reports: &[ReportRecord],
) -> Result<()> {
    let note_path = paths.sites_dir.join(format!("{}.md", site.id));

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("id: {}\n", site.id));
    md.push_str(&format!("latitude: {}\n", site.coordinate.latitude));
    md.push_str(&format!("longitude: {}\n", site.coordinate.longitude));
    if let Some(condition) = site.condition {
        md.push_str(&format!("condition: {}\n", condition));
    }
    md.push_str(&format!("updated_at: {}\n", site.updated_at));
    md.push_str("---\n\n");

    md.push_str(&format!("# {}\n\n", site.name));
    if let Some(description) = site.description.as_deref().filter(|d| !d.trim().is_empty()) {
        md.push_str(description);
        md.push_str("\n\n");
    }

    md.push_str("## Measurements\n");
    md.push_str(&format!("- Specimens: {}\n", show(site.specimen_count)));
    md.push_str(&format!("- Density: {}\n", show(site.density)));
    md.push_str(&format!("- Average height: {}\n", show(site.avg_height)));
    md.push_str(&format!("- Average diameter: {}\n", show(site.avg_diameter)));
    md.push_str(&format!("- Area: {}\n\n", show(site.area)));

    md.push_str("## Reports\n");
    if reports.is_empty() {
        md.push_str("_No reports yet._\n");
    }
    for report in reports.iter().rev() {
        md.push_str(&format!(
            "- [[Reports/{}|{}]] `{}` {}\n",
            report.id, report.submitted_at, report.status, report.report_type
        ));
    }

    fs::write(note_path, md)?;
    Ok(())
}

fn write_report_note(
    paths: &VaultPaths,
    report: &ReportRecord,
    history: &[Analisis],
) -> Result<()> {
    let note_path = paths.reports_dir.join(format!("{}.md", report.id));

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("id: {}\n", report.id));
    md.push_str(&format!("site_id: {}\n", report.site_id));
    md.push_str(&format!("status: {}\n", report.status));
    md.push_str(&format!("submitted_at: {}\n", report.submitted_at));
    if let Some(decided_at) = &report.decided_at {
        md.push_str(&format!("decided_at: {}\n", decided_at));
    }
    md.push_str("measurements_json: |\n");
    md.push_str(&indent_yaml_block(&serde_json::to_string_pretty(&report.measurements)?));
    md.push_str("---\n\n");

    md.push_str(&format!("# {} at [[Sites/{}]]\n\n", report.report_type, report.site_id));
    md.push_str(&format!("- Status: `{}`\n", report.status));
    if let Some(moderator) = &report.moderator_id {
        md.push_str(&format!("- Moderator: `{}`\n", moderator));
    }
    if let Some(photo) = &report.photo_ref {
        md.push_str(&format!("- Photo: `{}`\n", photo));
    }
    if report.analysis_pending {
        md.push_str("- Analysis: awaiting classifier retry\n");
    }
    md.push('\n');

    md.push_str("## Observation\n");
    md.push_str(&report.body);
    md.push_str("\n\n");

    md.push_str("## Analysis\n");
    match history.iter().find(|a| a.superseded_by.is_none()) {
        Some(current) => {
            md.push_str(&format!("- Condition: `{}`\n", current.condition));
            md.push_str(&format!("- Cause: `{}`\n", current.cause));
            md.push_str(&format!("- Confidence: {:.2} ({})\n", current.confidence, current.source));
            md.push_str(&format!("- Urgency: **{}**\n", current.urgency));
            md.push_str(&format!("- Action: {}\n", current.recommendation));
        }
        None if report.status == ReportStatus::Valid => {
            md.push_str("_Analysis pending._\n");
        }
        None => {
            md.push_str("_Not analyzed._\n");
        }
    }
    let superseded = history.iter().filter(|a| a.superseded_by.is_some()).count();
    if superseded > 0 {
        md.push_str(&format!("\n{superseded} earlier analysis record(s) superseded.\n"));
    }

    fs::write(note_path, md)?;
    Ok(())
}

fn show<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn indent_yaml_block(s: &str) -> String {
    let mut out = String::new();
    for line in s.lines() {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangrove_core::TriageEngine;
    use mangrove_core::config::EngineConfig;
    use mangrove_core::schema::{Coordinate, NewLocation, Outcome, ReportDraft};
    use tempfile::TempDir;

    #[test]
    fn writes_site_report_and_board_notes() {
        let conn = db::open_in_memory().unwrap();
        let mut engine = TriageEngine::new(conn, &EngineConfig::default());
        engine
            .create_site(NewLocation {
                id: Some("teluk-a".to_string()),
                name: "Teluk A".to_string(),
                coordinate: Coordinate {
                    latitude: -6.9,
                    longitude: 107.6,
                },
                area: None,
                description: None,
            })
            .unwrap();
        let report = engine
            .submit(ReportDraft {
                site_id: "teluk-a".to_string(),
                report_type: "kerusakan".to_string(),
                body: "Terkena abrasi".to_string(),
                ..ReportDraft::default()
            })
            .unwrap();
        engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();

        let dir = TempDir::new().unwrap();
        let summary = build_vault(engine.connection(), dir.path()).unwrap();
        assert_eq!(
            summary,
            VaultSummary {
                sites: 1,
                reports: 1,
                triage_entries: 1
            }
        );

        let board = fs::read_to_string(dir.path().join("00_Index/Triage Board.md")).unwrap();
        assert!(board.contains("| rendah | [[Sites/teluk-a|Teluk A]] | rusak_ringan | erosi |"));
        let site_note = fs::read_to_string(dir.path().join("Sites/teluk-a.md")).unwrap();
        assert!(site_note.contains("condition: sedang"));
        let report_note =
            fs::read_to_string(dir.path().join(format!("Reports/{}.md", report.id))).unwrap();
        assert!(report_note.contains("- Urgency: **rendah**"));
    }
}
