//! Condition analysis
//!
//! Turns a validated report, and optionally a classifier's raw output, into
//! an `Analisis`. Urgency always comes from `urgency::classify` and the
//! recommendation from a fixed table; neither is ever taken from input.

use uuid::Uuid;

use crate::config::KeywordTable;
use crate::error::{Result, TriageError};
use crate::schema::{
    Analisis, AnalysisSource, Cause, ClassifierOutput, Condition, ReportRecord,
};
use crate::urgency;

/// Condition assumed when no classifier output is available.
pub const FALLBACK_CONDITION: Condition = Condition::RusakRingan;
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

pub struct ConditionAnalyzer {
    keywords: KeywordTable,
}

impl ConditionAnalyzer {
    pub fn new(keywords: KeywordTable) -> Self {
        Self { keywords }
    }

    pub fn analyze(
        &self,
        report: &ReportRecord,
        classifier_output: Option<&ClassifierOutput>,
    ) -> Result<Analisis> {
        let (condition, cause, confidence, source) = match classifier_output {
            Some(output) => {
                validate_confidence(output.confidence)?;
                (output.condition, output.cause, output.confidence, AnalysisSource::Classifier)
            }
            None => (
                FALLBACK_CONDITION,
                self.heuristic_cause(report),
                FALLBACK_CONFIDENCE,
                AnalysisSource::Heuristic,
            ),
        };

        Ok(Analisis {
            id: Uuid::new_v4().to_string(),
            report_id: report.id.clone(),
            condition,
            confidence,
            cause,
            recommendation: recommendation(condition, cause).to_string(),
            urgency: urgency::classify(condition, cause, confidence),
            source,
            analyzed_at: crate::now_rfc3339()?,
            superseded_by: None,
        })
    }

    /// Cause inferred from the report type and body text.
    pub fn heuristic_cause(&self, report: &ReportRecord) -> Cause {
        let text = format!("{} {}", report.report_type, report.body);
        self.keywords.match_cause(&text).unwrap_or(Cause::Lainnya)
    }
}

impl Default for ConditionAnalyzer {
    fn default() -> Self {
        Self::new(KeywordTable::default())
    }
}

fn validate_confidence(confidence: f64) -> Result<()> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(TriageError::validation(
            "analysis",
            "confidence",
            format!("{confidence} is outside [0, 1]"),
        ))
    }
}

pub fn recommendation(condition: Condition, cause: Cause) -> &'static str {
    match (condition, cause) {
        (Condition::Mati, _) => "Perlu penanaman ulang segera",

        (Condition::RusakBerat, Cause::Sampah) => {
            "Kerahkan aksi bersih sampah dan lakukan penyulaman bibit"
        }
        (Condition::RusakBerat, Cause::Limbah) => {
            "Laporkan sumber limbah ke dinas lingkungan hidup dan lakukan rehabilitasi"
        }
        (Condition::RusakBerat, Cause::Erosi) => {
            "Pasang alat pemecah ombak dan tanam ulang di zona tergerus"
        }
        (Condition::RusakBerat, Cause::IkanPemakan) => {
            "Pasang pelindung bibit dan kendalikan populasi hama"
        }
        (Condition::RusakBerat, Cause::Alam) => {
            "Lakukan rehabilitasi dan penyulaman setelah kondisi alam stabil"
        }
        (Condition::RusakBerat, Cause::Lainnya) => {
            "Lakukan survei lapangan lanjutan dan rencanakan rehabilitasi"
        }

        (Condition::RusakRingan, Cause::Sampah) => "Jadwalkan aksi bersih sampah",
        (Condition::RusakRingan, Cause::Limbah) => "Identifikasi dan hentikan sumber limbah",
        (Condition::RusakRingan, Cause::Erosi) => "Pantau laju erosi dan perkuat tepian",
        (Condition::RusakRingan, Cause::IkanPemakan) => "Pasang pelindung pada bibit muda",
        (Condition::RusakRingan, Cause::Alam) => "Pantau pemulihan alami secara berkala",
        (Condition::RusakRingan, Cause::Lainnya) => "Lakukan pemantauan berkala",

        (Condition::Sehat, _) => "Pertahankan kondisi dan lanjutkan pemantauan rutin",
    }
}
