//! Report lifecycle engine
//!
//! Owns the database connection and drives a report from submission through
//! moderation to analysis and the site update. Decisions and analysis are
//! separate failure domains: a recorded decision is never rolled back
//! because analysis failed.

use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::analyzer::ConditionAnalyzer;
use crate::classifier::{self, Classifier, TimedClassifier};
use crate::config::{AggregatePolicy, ClassifierConfig, DEFAULT_TIMEOUT_MS, EngineConfig};
use crate::db::{self, ReportQuery};
use crate::error::{Result, TriageError};
use crate::location;
use crate::moderation;
use crate::schema::{
    Analisis, ClassifierOutput, LocationAggregate, NewLocation, Outcome,
    ReportDraft, ReportRecord, ReportStatus,
};
use crate::triage::{self, TriageEntry};

pub struct TriageEngine {
    conn: Connection,
    analyzer: ConditionAnalyzer,
    classifier: TimedClassifier,
    policy: AggregatePolicy,
}

/// Outcome of `retry_pending_analyses`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub completed: usize,
    pub still_pending: usize,
}

/// Where an analysis request came from; decides what a classifier failure
/// does to an existing analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Decision,
    Retry,
    Reanalyze,
}

impl TriageEngine {
    pub fn new(conn: Connection, config: &EngineConfig) -> Self {
        let classifier = classifier::from_config(&config.classifier);
        Self::with_classifier(conn, config, classifier)
    }

    pub fn with_classifier(
        conn: Connection,
        config: &EngineConfig,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let classifier_timeout = match &config.classifier {
            ClassifierConfig::Command { timeout, .. } => *timeout,
            ClassifierConfig::None => Duration::from_millis(DEFAULT_TIMEOUT_MS),
        };
        Self {
            conn,
            analyzer: ConditionAnalyzer::new(config.keywords.clone()),
            classifier: TimedClassifier::new(classifier, classifier_timeout),
            policy: config.aggregate,
        }
    }

    pub fn set_classifier_timeout(&mut self, timeout: Duration) {
        self.classifier.set_timeout(timeout);
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // -------------------------------------------------------------------------
    // Sites
    // -------------------------------------------------------------------------

    pub fn create_site(&self, input: NewLocation) -> Result<LocationAggregate> {
        let site = location::create_site(&self.conn, input)?;
        info!(site_id = %site.id, name = %site.name, "site registered");
        Ok(site)
    }

    pub fn get_site(&self, id: &str) -> Result<LocationAggregate> {
        db::get_location(&self.conn, id)?.ok_or_else(|| TriageError::not_found("location", id))
    }

    pub fn list_sites(&self) -> Result<Vec<LocationAggregate>> {
        db::list_locations(&self.conn)
    }

    // -------------------------------------------------------------------------
    // Moderation
    // -------------------------------------------------------------------------

    pub fn submit(&self, draft: ReportDraft) -> Result<ReportRecord> {
        let record = moderation::new_record(draft, OffsetDateTime::now_utc())?;
        db::insert_report(&self.conn, &record)?;
        info!(report_id = %record.id, site_id = %record.site_id, "report submitted");
        Ok(record)
    }

    pub fn decide(
        &mut self,
        report_id: &str,
        outcome: Outcome,
        moderator_id: &str,
    ) -> Result<ReportRecord> {
        if moderator_id.trim().is_empty() {
            return Err(TriageError::validation("decision", "moderator_id", "must not be empty"));
        }
        let target = ReportStatus::from(outcome);

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = db::get_report(&tx, report_id)?
            .ok_or_else(|| TriageError::not_found("report", report_id))?;
        moderation::check_transition(&report, target)?;

        let decided_at = crate::now_rfc3339()?;
        let landed = db::record_decision(
            &tx,
            report_id,
            target,
            moderator_id.trim(),
            &decided_at,
            outcome == Outcome::Valid,
        )?;
        if !landed {
            return Err(TriageError::InvalidTransition {
                report_id: report_id.to_string(),
                from: report.status,
                to: target,
            });
        }
        tx.commit()?;
        info!(report_id, status = %target, moderator_id, "report moderated");

        let decided = self.get_report(report_id)?;
        if outcome == Outcome::Valid {
            if let Err(err) = self.run_analysis(&decided, None, Trigger::Decision) {
                warn!(report_id, error = %err, "analysis deferred; report left analysis_pending");
            }
            return self.get_report(report_id);
        }
        Ok(decided)
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    /// Analyze a valid report again. With `output` the classifier is skipped.
    /// An existing current analysis is only replaced when `supersede` is set.
    pub fn reanalyze(
        &mut self,
        report_id: &str,
        output: Option<ClassifierOutput>,
        supersede: bool,
    ) -> Result<Analisis> {
        let report = self.get_report(report_id)?;
        if report.status != ReportStatus::Valid {
            return Err(TriageError::validation(
                "report",
                "status",
                format!("report {report_id} is {}, only valid reports are analyzed", report.status),
            ));
        }
        if !supersede && db::current_analysis(&self.conn, report_id)?.is_some() {
            return Err(TriageError::validation(
                "analysis",
                "supersede",
                format!("report {report_id} already has an analysis"),
            ));
        }
        self.run_analysis(&report, output, Trigger::Reanalyze)
    }

    /// Re-run the classifier for every report flagged `analysis_pending`.
    pub fn retry_pending_analyses(&mut self) -> Result<RetrySummary> {
        let pending = db::list_reports(
            &self.conn,
            &ReportQuery {
                status: Some(ReportStatus::Valid),
                analysis_pending: Some(true),
                ..ReportQuery::default()
            },
        )?;

        let mut summary = RetrySummary::default();
        for report in pending {
            summary.attempted += 1;
            match self.run_analysis(&report, None, Trigger::Retry) {
                Ok(_) => {
                    if self.get_report(&report.id)?.analysis_pending {
                        summary.still_pending += 1;
                    } else {
                        summary.completed += 1;
                    }
                }
                Err(err) => {
                    warn!(report_id = %report.id, error = %err, "analysis retry failed");
                    summary.still_pending += 1;
                }
            }
        }
        info!(
            attempted = summary.attempted,
            completed = summary.completed,
            still_pending = summary.still_pending,
            "analysis retry finished"
        );
        Ok(summary)
    }

    fn run_analysis(
        &mut self,
        report: &ReportRecord,
        explicit: Option<ClassifierOutput>,
        trigger: Trigger,
    ) -> Result<Analisis> {
        let mut classifier_failed = false;
        let output = match (explicit, report.photo_ref.as_deref()) {
            (Some(output), _) => Some(output),
            (None, Some(photo_ref)) => {
                match self.classifier.invoke(photo_ref) {
                    Ok(output) => output,
                    Err(reason) => {
                        let failure = TriageError::AnalysisFailure {
                            report_id: report.id.clone(),
                            reason,
                        };
                        warn!(error = %failure, "falling back to heuristic analysis");
                        classifier_failed = true;
                        None
                    }
                }
            }
            (None, None) => None,
        };

        let analysis = match self.analyzer.analyze(report, output.as_ref()) {
            Ok(analysis) => analysis,
            Err(err) if explicit.is_none() && output.is_some() => {
                warn!(report_id = %report.id, error = %err, "classifier output rejected");
                classifier_failed = true;
                self.analyzer.analyze(report, None)?
            }
            Err(err) => return Err(err),
        };

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = db::current_analysis(&tx, &report.id)?;
        if classifier_failed && trigger == Trigger::Retry && existing.is_some() {
            // Keep the fallback analysis already on record; try again later.
            return Err(TriageError::AnalysisFailure {
                report_id: report.id.clone(),
                reason: "classifier still unavailable".to_string(),
            });
        }
        if trigger == Trigger::Decision && existing.is_some() {
            return Err(TriageError::validation(
                "analysis",
                "report_id",
                format!("report {} already analyzed", report.id),
            ));
        }

        let current = db::get_report(&tx, &report.id)?
            .ok_or_else(|| TriageError::not_found("report", &report.id))?;
        db::insert_analysis(&tx, &analysis, existing.is_some())?;
        location::update(&tx, &current, &analysis, self.policy)?;
        db::set_analysis_pending(&tx, &report.id, classifier_failed)?;
        tx.commit()?;

        info!(
            report_id = %report.id,
            analysis_id = %analysis.id,
            urgency = %analysis.urgency,
            source = %analysis.source,
            "report analyzed"
        );
        Ok(analysis)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_report(&self, id: &str) -> Result<ReportRecord> {
        db::get_report(&self.conn, id)?.ok_or_else(|| TriageError::not_found("report", id))
    }

    pub fn list_reports(&self, query: &ReportQuery) -> Result<Vec<ReportRecord>> {
        db::list_reports(&self.conn, query)
    }

    pub fn current_analysis(&self, report_id: &str) -> Result<Option<Analisis>> {
        self.get_report(report_id)?;
        db::current_analysis(&self.conn, report_id)
    }

    pub fn analysis_history(&self, report_id: &str) -> Result<Vec<Analisis>> {
        self.get_report(report_id)?;
        db::analysis_history(&self.conn, report_id)
    }

    pub fn triage_queue(&self, limit: Option<usize>) -> Result<Vec<TriageEntry>> {
        triage::triage_queue(&self.conn, limit)
    }
}
