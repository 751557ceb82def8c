//! Urgency classification
//!
//! Deterministic and total: every (condition, cause, confidence) maps to
//! exactly one urgency level.

use crate::schema::{Cause, Condition, Urgency};

/// Confidence from which severe damage is escalated to `Tinggi`.
pub const SEVERE_CONFIDENCE: f64 = 0.6;

/// Findings below this confidence are lowered one level.
pub const LOW_CONFIDENCE: f64 = 0.3;

pub fn classify(condition: Condition, cause: Cause, confidence: f64) -> Urgency {
    let confidence = clamp_confidence(confidence);

    if condition == Condition::Mati {
        return Urgency::Kritis;
    }

    let base = table_urgency(condition, cause, confidence);
    if confidence < LOW_CONFIDENCE {
        base.lowered()
    } else {
        base
    }
}

fn table_urgency(condition: Condition, cause: Cause, confidence: f64) -> Urgency {
    match condition {
        Condition::Mati => Urgency::Kritis,
        Condition::RusakBerat => {
            if confidence >= SEVERE_CONFIDENCE {
                Urgency::Tinggi
            } else {
                Urgency::Sedang
            }
        }
        Condition::RusakRingan => {
            if is_human_correctable(cause) {
                Urgency::Sedang
            } else {
                Urgency::Rendah
            }
        }
        Condition::Sehat => Urgency::Rendah,
    }
}

/// Causes a field team can remove directly.
pub fn is_human_correctable(cause: Cause) -> bool {
    match cause {
        Cause::Sampah | Cause::Limbah | Cause::IkanPemakan => true,
        Cause::Erosi | Cause::Alam | Cause::Lainnya => false,
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_stands_are_always_critical() {
        for cause in Cause::ALL {
            for confidence in [0.0, 0.1, 0.29, 0.3, 0.5, 0.99, 1.0] {
                assert_eq!(classify(Condition::Mati, *cause, confidence), Urgency::Kritis);
            }
        }
    }

    #[test]
    fn mild_damage_depends_on_cause() {
        assert_eq!(classify(Condition::RusakRingan, Cause::Sampah, 0.9), Urgency::Sedang);
        assert_eq!(classify(Condition::RusakRingan, Cause::Limbah, 0.9), Urgency::Sedang);
        assert_eq!(classify(Condition::RusakRingan, Cause::IkanPemakan, 0.9), Urgency::Sedang);
        assert_eq!(classify(Condition::RusakRingan, Cause::Erosi, 0.9), Urgency::Rendah);
        assert_eq!(classify(Condition::RusakRingan, Cause::Alam, 0.9), Urgency::Rendah);
    }

    #[test]
    fn severe_damage_threshold_is_inclusive() {
        assert_eq!(classify(Condition::RusakBerat, Cause::Alam, 0.6), Urgency::Tinggi);
        assert_eq!(classify(Condition::RusakBerat, Cause::Alam, 0.59), Urgency::Sedang);
    }

    #[test]
    fn low_confidence_caps_one_level() {
        let low = classify(Condition::RusakBerat, Cause::Alam, 0.2);
        let high = classify(Condition::RusakBerat, Cause::Alam, 0.8);
        assert!(low < high);
        assert_eq!(low, Urgency::Rendah);
        assert_eq!(classify(Condition::RusakRingan, Cause::Sampah, 0.1), Urgency::Rendah);
        assert_eq!(classify(Condition::Sehat, Cause::Lainnya, 0.0), Urgency::Rendah);
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        assert_eq!(classify(Condition::RusakBerat, Cause::Erosi, 7.0), Urgency::Tinggi);
        assert_eq!(classify(Condition::RusakBerat, Cause::Erosi, f64::NAN), Urgency::Rendah);
    }
}
