//! End-to-end report lifecycle tests
//!
//! Covers submission, moderation, analysis with and without a classifier,
//! retry of deferred analyses, and the site aggregate update.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mangrove_core::classifier::Classifier;
use mangrove_core::config::{AggregatePolicy, EngineConfig};
use mangrove_core::db::{self, ReportQuery};
use mangrove_core::schema::{
    AnalysisSource, Cause, ClassifierOutput, Condition, Coordinate, Measurements, NewLocation,
    Outcome, ReportDraft, ReportStatus, SiteCondition, Urgency,
};
use mangrove_core::{TriageEngine, TriageError};

// =============================================================================
// Fixtures
// =============================================================================

/// Returns a fixed output, or fails while `down` is set.
struct StubClassifier {
    output: Option<ClassifierOutput>,
    down: AtomicBool,
}

impl StubClassifier {
    fn new(output: Option<ClassifierOutput>) -> Arc<Self> {
        Arc::new(Self {
            output,
            down: AtomicBool::new(false),
        })
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &str {
        "stub"
    }

    fn classify(&self, _photo_ref: &str) -> Result<Option<ClassifierOutput>, String> {
        if self.down.load(Ordering::SeqCst) {
            Err("classifier unreachable".to_string())
        } else {
            Ok(self.output)
        }
    }
}

struct HangingClassifier;

impl Classifier for HangingClassifier {
    fn name(&self) -> &str {
        "hanging"
    }

    fn classify(&self, _photo_ref: &str) -> Result<Option<ClassifierOutput>, String> {
        std::thread::sleep(Duration::from_secs(2));
        Ok(None)
    }
}

fn severe_trash() -> ClassifierOutput {
    ClassifierOutput {
        condition: Condition::RusakBerat,
        confidence: 0.7,
        cause: Cause::Sampah,
    }
}

fn engine_with(classifier: Arc<dyn Classifier>) -> TriageEngine {
    let conn = db::open_in_memory().unwrap();
    let engine = TriageEngine::with_classifier(conn, &EngineConfig::default(), classifier);
    engine
        .create_site(NewLocation {
            id: Some("teluk-a".to_string()),
            name: "Teluk A".to_string(),
            coordinate: Coordinate {
                latitude: -6.95,
                longitude: 107.65,
            },
            area: Some(3.5),
            description: Some("Muara sisi timur".to_string()),
        })
        .unwrap();
    engine
}

fn draft(photo: Option<&str>) -> ReportDraft {
    ReportDraft {
        site_id: "teluk-a".to_string(),
        submitter_id: Some("warga-17".to_string()),
        species_id: Some("rhizophora-mucronata".to_string()),
        report_type: "kerusakan".to_string(),
        body: "Banyak sampah plastik tersangkut di akar".to_string(),
        photo_ref: photo.map(str::to_string),
        measurements: Measurements {
            specimen_count: Some(120),
            density: Some(0.8),
            avg_height: Some(2.4),
            avg_diameter: Some(9.5),
            area: None,
        },
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_valid_report_is_analyzed_and_folded_into_site() {
    let mut engine = engine_with(StubClassifier::new(Some(severe_trash())));

    let report = engine.submit(draft(Some("photo/001.jpg"))).unwrap();
    assert_eq!(report.status, ReportStatus::Pending);
    assert!(engine.current_analysis(&report.id).unwrap().is_none());

    let decided = engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();
    assert_eq!(decided.status, ReportStatus::Valid);
    assert_eq!(decided.moderator_id.as_deref(), Some("moderator-1"));
    assert!(decided.decided_at.is_some());
    assert!(!decided.analysis_pending);

    let analysis = engine.current_analysis(&report.id).unwrap().unwrap();
    assert_eq!(analysis.urgency, Urgency::Tinggi);
    assert_eq!(analysis.source, AnalysisSource::Classifier);
    assert_eq!(db::count_analyses(engine.connection(), &report.id).unwrap(), 1);

    let site = engine.get_site("teluk-a").unwrap();
    assert_eq!(site.condition, Some(SiteCondition::Buruk));
    assert_eq!(site.specimen_count, Some(120));
    assert_eq!(site.avg_diameter, Some(9.5));
    assert_eq!(site.area, Some(3.5));
}

#[test]
fn test_missing_site_is_rejected_without_record() {
    let engine = engine_with(StubClassifier::new(None));

    let mut no_site = draft(None);
    no_site.site_id = String::new();
    let err = engine.submit(no_site).unwrap_err();
    assert!(matches!(err, TriageError::Validation { ref field, .. } if field == "site_id"));

    let mut unknown_site = draft(None);
    unknown_site.site_id = "teluk-z".to_string();
    assert!(matches!(engine.submit(unknown_site), Err(TriageError::Validation { .. })));

    assert!(engine.list_reports(&ReportQuery::default()).unwrap().is_empty());
}

#[test]
fn test_rejected_report_never_gets_analysis() {
    let mut engine = engine_with(StubClassifier::new(Some(severe_trash())));
    let report = engine.submit(draft(Some("photo/002.jpg"))).unwrap();

    let decided = engine.decide(&report.id, Outcome::Ditolak, "moderator-1").unwrap();
    assert_eq!(decided.status, ReportStatus::Ditolak);
    assert_eq!(db::count_analyses(engine.connection(), &report.id).unwrap(), 0);

    let err = engine.reanalyze(&report.id, Some(severe_trash()), true).unwrap_err();
    assert!(matches!(err, TriageError::Validation { .. }));
    assert_eq!(db::count_analyses(engine.connection(), &report.id).unwrap(), 0);

    let site = engine.get_site("teluk-a").unwrap();
    assert_eq!(site.condition, None);
    assert_eq!(site.specimen_count, None);
}

#[test]
fn test_second_decision_is_invalid_transition() {
    let mut engine = engine_with(StubClassifier::new(None));
    let report = engine.submit(draft(None)).unwrap();

    engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();
    for outcome in [Outcome::Valid, Outcome::Ditolak] {
        let err = engine.decide(&report.id, outcome, "moderator-2").unwrap_err();
        assert!(matches!(
            err,
            TriageError::InvalidTransition { from: ReportStatus::Valid, .. }
        ));
    }

    let stored = engine.get_report(&report.id).unwrap();
    assert_eq!(stored.moderator_id.as_deref(), Some("moderator-1"));
    assert_eq!(db::count_analyses(engine.connection(), &report.id).unwrap(), 1);
}

#[test]
fn test_decide_unknown_report_is_not_found() {
    let mut engine = engine_with(StubClassifier::new(None));
    let err = engine.decide("nope", Outcome::Valid, "moderator-1").unwrap_err();
    assert!(matches!(err, TriageError::NotFound { entity: "report", .. }));
}

#[test]
fn test_report_without_photo_uses_heuristic() {
    let mut engine = engine_with(StubClassifier::new(Some(severe_trash())));
    let report = engine.submit(draft(None)).unwrap();

    let decided = engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();
    assert!(!decided.analysis_pending);

    let analysis = engine.current_analysis(&report.id).unwrap().unwrap();
    assert_eq!(analysis.source, AnalysisSource::Heuristic);
    assert_eq!(analysis.condition, Condition::RusakRingan);
    assert_eq!(analysis.cause, Cause::Sampah);
    assert_eq!(analysis.confidence, 0.5);
    assert_eq!(analysis.urgency, Urgency::Sedang);
    assert_eq!(engine.get_site("teluk-a").unwrap().condition, Some(SiteCondition::Sedang));
}

// =============================================================================
// Classifier failures and retry
// =============================================================================

#[test]
fn test_classifier_outage_keeps_decision_and_flags_retry() {
    let stub = StubClassifier::new(Some(severe_trash()));
    stub.down.store(true, Ordering::SeqCst);
    let mut engine = engine_with(stub.clone());

    let report = engine.submit(draft(Some("photo/003.jpg"))).unwrap();
    let decided = engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();
    assert_eq!(decided.status, ReportStatus::Valid);
    assert!(decided.analysis_pending);

    let fallback = engine.current_analysis(&report.id).unwrap().unwrap();
    assert_eq!(fallback.source, AnalysisSource::Heuristic);

    // Still down: nothing changes.
    let summary = engine.retry_pending_analyses().unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.still_pending, 1);
    assert_eq!(engine.analysis_history(&report.id).unwrap().len(), 1);

    stub.down.store(false, Ordering::SeqCst);
    let summary = engine.retry_pending_analyses().unwrap();
    assert_eq!(summary.completed, 1);
    assert!(!engine.get_report(&report.id).unwrap().analysis_pending);

    let current = engine.current_analysis(&report.id).unwrap().unwrap();
    assert_eq!(current.source, AnalysisSource::Classifier);
    assert_eq!(current.urgency, Urgency::Tinggi);
    let history = engine.analysis_history(&report.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].superseded_by.as_deref(), Some(current.id.as_str()));
    assert_eq!(engine.get_site("teluk-a").unwrap().condition, Some(SiteCondition::Buruk));
}

#[test]
fn test_hanging_classifier_times_out_to_heuristic() {
    let mut engine = engine_with(Arc::new(HangingClassifier));
    engine.set_classifier_timeout(Duration::from_millis(50));

    let report = engine.submit(draft(Some("photo/004.jpg"))).unwrap();
    let started = std::time::Instant::now();
    let decided = engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(decided.analysis_pending);
    assert_eq!(
        engine.current_analysis(&report.id).unwrap().unwrap().source,
        AnalysisSource::Heuristic
    );
}

#[test]
fn test_out_of_range_classifier_output_falls_back() {
    let bogus = ClassifierOutput {
        condition: Condition::Mati,
        confidence: 1.7,
        cause: Cause::Alam,
    };
    let mut engine = engine_with(StubClassifier::new(Some(bogus)));
    let report = engine.submit(draft(Some("photo/005.jpg"))).unwrap();

    let decided = engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();
    assert!(decided.analysis_pending);
    let analysis = engine.current_analysis(&report.id).unwrap().unwrap();
    assert_eq!(analysis.source, AnalysisSource::Heuristic);

    let err = engine.reanalyze(&report.id, Some(bogus), true).unwrap_err();
    assert!(matches!(err, TriageError::Validation { ref field, .. } if field == "confidence"));
}

// =============================================================================
// Re-analysis and aggregation
// =============================================================================

#[test]
fn test_reanalysis_requires_supersede_flag() {
    let mut engine = engine_with(StubClassifier::new(None));
    let report = engine.submit(draft(None)).unwrap();
    engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();

    let err = engine.reanalyze(&report.id, Some(severe_trash()), false).unwrap_err();
    assert!(matches!(err, TriageError::Validation { ref field, .. } if field == "supersede"));

    let dead = ClassifierOutput {
        condition: Condition::Mati,
        confidence: 0.1,
        cause: Cause::Erosi,
    };
    let analysis = engine.reanalyze(&report.id, Some(dead), true).unwrap();
    assert_eq!(analysis.urgency, Urgency::Kritis);
    assert_eq!(analysis.recommendation, "Perlu penanaman ulang segera");
    assert_eq!(engine.analysis_history(&report.id).unwrap().len(), 2);
    assert_eq!(engine.current_analysis(&report.id).unwrap().unwrap().id, analysis.id);
}

#[test]
fn test_repeated_identical_reports_do_not_drift_site() {
    let mut engine = engine_with(StubClassifier::new(Some(severe_trash())));

    let first = engine.submit(draft(Some("photo/a.jpg"))).unwrap();
    engine.decide(&first.id, Outcome::Valid, "moderator-1").unwrap();
    let after_first = engine.get_site("teluk-a").unwrap();

    let second = engine.submit(draft(Some("photo/b.jpg"))).unwrap();
    engine.decide(&second.id, Outcome::Valid, "moderator-1").unwrap();
    let after_second = engine.get_site("teluk-a").unwrap();

    assert_eq!(after_first.specimen_count, after_second.specimen_count);
    assert_eq!(after_first.density, after_second.density);
    assert_eq!(after_first.avg_height, after_second.avg_height);
    assert_eq!(after_first.avg_diameter, after_second.avg_diameter);
    assert_eq!(after_first.area, after_second.area);
    assert_eq!(after_first.condition, after_second.condition);
}

fn moving_average_engine(classifier: Arc<dyn Classifier>) -> TriageEngine {
    let conn = db::open_in_memory().unwrap();
    let config = EngineConfig {
        aggregate: AggregatePolicy::MovingAverage,
        ..EngineConfig::default()
    };
    let engine = TriageEngine::with_classifier(conn, &config, classifier);
    engine
        .create_site(NewLocation {
            id: Some("teluk-a".to_string()),
            name: "Teluk A".to_string(),
            coordinate: Coordinate {
                latitude: 1.0,
                longitude: 104.0,
            },
            area: None,
            description: None,
        })
        .unwrap();
    engine
}

/// Submit and validate a report carrying `count` specimens.
fn validated(engine: &mut TriageEngine, count: u32, photo: Option<&str>) -> String {
    let mut d = draft(photo);
    d.measurements.specimen_count = Some(count);
    let report = engine.submit(d).unwrap();
    engine.decide(&report.id, Outcome::Valid, "moderator-1").unwrap();
    report.id
}

fn specimen_count(engine: &TriageEngine) -> Option<u32> {
    engine.get_site("teluk-a").unwrap().specimen_count
}

#[test]
fn test_moving_average_policy_blends_reports() {
    let mut engine = moving_average_engine(StubClassifier::new(None));
    validated(&mut engine, 100, None);
    validated(&mut engine, 200, None);
    assert_eq!(specimen_count(&engine), Some(150));
}

#[test]
fn test_retry_of_older_report_keeps_newer_observation() {
    let stub = StubClassifier::new(Some(severe_trash()));
    stub.down.store(true, Ordering::SeqCst);
    let mut engine = engine_with(stub.clone());

    let older = validated(&mut engine, 100, Some("photo/older.jpg"));
    assert_eq!(specimen_count(&engine), Some(100));
    assert_eq!(engine.get_site("teluk-a").unwrap().condition, Some(SiteCondition::Sedang));

    // The newer report has no photo, so its heuristic analysis stands.
    stub.down.store(false, Ordering::SeqCst);
    validated(&mut engine, 300, None);
    assert_eq!(specimen_count(&engine), Some(300));

    let summary = engine.retry_pending_analyses().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(
        engine.current_analysis(&older).unwrap().unwrap().source,
        AnalysisSource::Classifier
    );

    let site = engine.get_site("teluk-a").unwrap();
    assert_eq!(site.specimen_count, Some(300));
    assert_eq!(site.condition, Some(SiteCondition::Sedang));
}

#[test]
fn test_reanalysis_only_moves_site_for_latest_report() {
    let mut engine = engine_with(StubClassifier::new(None));
    let older = validated(&mut engine, 100, None);
    let newer = validated(&mut engine, 300, None);

    let dead = ClassifierOutput {
        condition: Condition::Mati,
        confidence: 0.9,
        cause: Cause::Limbah,
    };
    engine.reanalyze(&older, Some(dead), true).unwrap();
    let site = engine.get_site("teluk-a").unwrap();
    assert_eq!(site.specimen_count, Some(300));
    assert_eq!(site.condition, Some(SiteCondition::Sedang));

    engine.reanalyze(&newer, Some(dead), true).unwrap();
    let site = engine.get_site("teluk-a").unwrap();
    assert_eq!(site.specimen_count, Some(300));
    assert_eq!(site.condition, Some(SiteCondition::Buruk));
}

#[test]
fn test_moving_average_is_stable_under_reanalysis() {
    let mut engine = moving_average_engine(StubClassifier::new(None));
    let first = validated(&mut engine, 100, None);
    validated(&mut engine, 200, None);
    assert_eq!(specimen_count(&engine), Some(150));

    for _ in 0..3 {
        engine.reanalyze(&first, None, true).unwrap();
    }
    assert_eq!(specimen_count(&engine), Some(150));
    assert_eq!(engine.analysis_history(&first).unwrap().len(), 4);
}

#[test]
fn test_moving_average_is_stable_under_retry() {
    let stub = StubClassifier::new(Some(severe_trash()));
    stub.down.store(true, Ordering::SeqCst);
    let mut engine = moving_average_engine(stub.clone());

    validated(&mut engine, 100, Some("photo/older.jpg"));
    stub.down.store(false, Ordering::SeqCst);
    validated(&mut engine, 200, Some("photo/newer.jpg"));
    assert_eq!(specimen_count(&engine), Some(150));

    assert_eq!(engine.retry_pending_analyses().unwrap().completed, 1);
    assert_eq!(specimen_count(&engine), Some(150));
    assert_eq!(engine.retry_pending_analyses().unwrap().attempted, 0);
    assert_eq!(specimen_count(&engine), Some(150));
}

#[test]
fn test_triage_queue_orders_by_urgency() {
    let mut engine = engine_with(StubClassifier::new(Some(severe_trash())));

    let mild = engine.submit(draft(None)).unwrap();
    engine.decide(&mild.id, Outcome::Valid, "moderator-1").unwrap();
    let severe = engine.submit(draft(Some("photo/x.jpg"))).unwrap();
    engine.decide(&severe.id, Outcome::Valid, "moderator-1").unwrap();
    let rejected = engine.submit(draft(Some("photo/y.jpg"))).unwrap();
    engine.decide(&rejected.id, Outcome::Ditolak, "moderator-1").unwrap();
    engine.submit(draft(None)).unwrap();

    let queue = engine.triage_queue(None).unwrap();
    let ids: Vec<&str> = queue.iter().map(|e| e.report_id.as_str()).collect();
    assert_eq!(ids, [severe.id.as_str(), mild.id.as_str()]);
    assert_eq!(queue[0].site_name, "Teluk A");
    assert_eq!(engine.triage_queue(Some(1)).unwrap().len(), 1);
}
