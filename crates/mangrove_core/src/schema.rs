use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TriageError;

/// Observed state of the mangrove stand in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Sehat,
    RusakRingan,
    RusakBerat,
    Mati,
}

/// Probable cause of the observed damage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Sampah,
    Limbah,
    Erosi,
    IkanPemakan,
    Alam,
    Lainnya,
}

/// Triage priority, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Rendah,
    Sedang,
    Tinggi,
    Kritis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Valid,
    Ditolak,
}

/// Moderator verdict passed to `decide`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Valid,
    Ditolak,
}

/// Site-level condition, derived from the latest analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SiteCondition {
    Baik,
    Sedang,
    Buruk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Classifier,
    Heuristic,
}

macro_rules! vocabulary {
    ($ty:ident, $entity:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = TriageError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(TriageError::validation(
                        $entity,
                        stringify!($ty),
                        format!("unknown value `{other}`"),
                    )),
                }
            }
        }
    };
}

vocabulary!(Condition, "analysis" {
    Sehat => "sehat",
    RusakRingan => "rusak_ringan",
    RusakBerat => "rusak_berat",
    Mati => "mati",
});

vocabulary!(Cause, "analysis" {
    Sampah => "sampah",
    Limbah => "limbah",
    Erosi => "erosi",
    IkanPemakan => "ikan_pemakan",
    Alam => "alam",
    Lainnya => "lainnya",
});

vocabulary!(Urgency, "analysis" {
    Rendah => "rendah",
    Sedang => "sedang",
    Tinggi => "tinggi",
    Kritis => "kritis",
});

vocabulary!(ReportStatus, "report" {
    Pending => "pending",
    Valid => "valid",
    Ditolak => "ditolak",
});

vocabulary!(Outcome, "report" {
    Valid => "valid",
    Ditolak => "ditolak",
});

vocabulary!(SiteCondition, "location" {
    Baik => "baik",
    Sedang => "sedang",
    Buruk => "buruk",
});

vocabulary!(AnalysisSource, "analysis" {
    Classifier => "classifier",
    Heuristic => "heuristic",
});

impl Urgency {
    /// One level down, saturating at `Rendah`.
    pub fn lowered(self) -> Self {
        match self {
            Urgency::Kritis => Urgency::Tinggi,
            Urgency::Tinggi => Urgency::Sedang,
            Urgency::Sedang | Urgency::Rendah => Urgency::Rendah,
        }
    }
}

impl ReportStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReportStatus::Pending)
    }
}

impl From<Outcome> for ReportStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Valid => ReportStatus::Valid,
            Outcome::Ditolak => ReportStatus::Ditolak,
        }
    }
}

impl From<Condition> for SiteCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Sehat => SiteCondition::Baik,
            Condition::RusakRingan => SiteCondition::Sedang,
            Condition::RusakBerat | Condition::Mati => SiteCondition::Buruk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Physical measurements carried by a report. Omitted fields leave the
/// site's previous value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Measurements {
    pub specimen_count: Option<u32>,
    pub density: Option<f64>,       // specimens per m2
    pub avg_height: Option<f64>,    // metres
    pub avg_diameter: Option<f64>,  // centimetres
    pub area: Option<f64>,          // hectares
}

/// Submission payload from the reporting transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReportDraft {
    pub site_id: String,
    pub submitter_id: Option<String>,
    pub species_id: Option<String>,
    pub report_type: String,
    pub body: String,
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub measurements: Measurements,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReportRecord {
    pub id: String,
    pub site_id: String,
    pub submitter_id: Option<String>,
    pub species_id: Option<String>,
    pub report_type: String,
    pub body: String,
    pub photo_ref: Option<String>,
    pub measurements: Measurements,
    pub status: ReportStatus,
    pub submitted_at: String,      // RFC 3339, UTC
    pub decided_at: Option<String>,
    pub moderator_id: Option<String>,
    pub analysis_pending: bool,
}

/// Raw output from an external classifier, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClassifierOutput {
    pub condition: Condition,
    pub confidence: f64,
    pub cause: Cause,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Analisis {
    pub id: String,
    pub report_id: String,
    pub condition: Condition,
    pub confidence: f64,
    pub cause: Cause,
    pub recommendation: String,
    pub urgency: Urgency,
    pub source: AnalysisSource,
    pub analyzed_at: String,
    pub superseded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LocationAggregate {
    pub id: String,
    pub name: String,
    pub coordinate: Coordinate,
    pub specimen_count: Option<u32>,
    pub density: Option<f64>,
    pub avg_height: Option<f64>,
    pub avg_diameter: Option<f64>,
    pub condition: Option<SiteCondition>,
    pub area: Option<f64>,
    pub description: Option<String>,
    pub updated_at: String,
}

/// Administrative input for registering a monitored site.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewLocation {
    pub id: Option<String>,
    pub name: String,
    pub coordinate: Coordinate,
    pub area: Option<f64>,
    pub description: Option<String>,
}
