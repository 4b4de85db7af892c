//! Attendance decision table.
//!
//! Rows are evaluated top to bottom, first match wins:
//!
//! | match | inside fence | score vs near-match | status |
//! |-------|--------------|---------------------|--------|
//! | yes   | yes          | -                   | Valid |
//! | yes   | no           | -                   | ManualVerification |
//! | no    | yes          | > near-match        | ManualVerification |
//! | no    | yes          | <= near-match       | Invalid |
//! | no    | no           | -                   | Invalid |

use crate::types::{AttendanceStatus, VerificationResult};
use serde::{Deserialize, Serialize};

/// Non-matching scores above this, inside the geofence, go to human review.
pub const DEFAULT_NEAR_MATCH_THRESHOLD: f32 = 0.45;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub near_match_threshold: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            near_match_threshold: DEFAULT_NEAR_MATCH_THRESHOLD,
        }
    }
}

/// Which row of the table produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    Verified,
    MatchOutsideGeofence,
    NearMatchInsideGeofence,
    NoMatchInsideGeofence,
    NoMatchOutsideGeofence,
}

impl DecisionRule {
    pub fn status(&self) -> AttendanceStatus {
        match self {
            DecisionRule::Verified => AttendanceStatus::Valid,
            DecisionRule::MatchOutsideGeofence | DecisionRule::NearMatchInsideGeofence => {
                AttendanceStatus::ManualVerification
            }
            DecisionRule::NoMatchInsideGeofence | DecisionRule::NoMatchOutsideGeofence => {
                AttendanceStatus::Invalid
            }
        }
    }

    fn note(&self, score: f32) -> String {
        match self {
            DecisionRule::Verified => format!("verified, score={score:.2}"),
            DecisionRule::MatchOutsideGeofence => {
                format!("face verified ({score:.2}) but outside geofence")
            }
            DecisionRule::NearMatchInsideGeofence => {
                format!("near-match ({score:.2}) inside geofence")
            }
            DecisionRule::NoMatchInsideGeofence => {
                format!("face not verified ({score:.2}) despite geofence")
            }
            DecisionRule::NoMatchOutsideGeofence => {
                format!("face not verified ({score:.2}) and outside geofence")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub rule: DecisionRule,
    pub status: AttendanceStatus,
    pub note: String,
}

/// Pure, total decision over `(is_match, within_geofence, score)`.
#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    policy: DecisionPolicy,
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn decide(&self, verification: VerificationResult, within_geofence: bool) -> Decision {
        let rule = match (verification.is_match, within_geofence) {
            (true, true) => DecisionRule::Verified,
            (true, false) => DecisionRule::MatchOutsideGeofence,
            (false, true) if verification.score > self.policy.near_match_threshold => {
                DecisionRule::NearMatchInsideGeofence
            }
            (false, true) => DecisionRule::NoMatchInsideGeofence,
            (false, false) => DecisionRule::NoMatchOutsideGeofence,
        };

        Decision {
            rule,
            status: rule.status(),
            note: rule.note(verification.score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::DEFAULT_MATCH_THRESHOLD;

    fn verification(score: f32) -> VerificationResult {
        VerificationResult {
            is_match: score > DEFAULT_MATCH_THRESHOLD,
            score,
        }
    }

    #[test]
    fn test_scenario_match_inside_is_valid() {
        let d = DecisionEngine::default().decide(verification(0.72), true);
        assert_eq!(d.status, AttendanceStatus::Valid);
        assert_eq!(d.rule, DecisionRule::Verified);
        assert_eq!(d.note, "verified, score=0.72");
    }

    #[test]
    fn test_scenario_low_score_inside_is_invalid() {
        let d = DecisionEngine::default().decide(verification(0.30), true);
        assert_eq!(d.status, AttendanceStatus::Invalid);
        assert_eq!(d.note, "face not verified (0.30) despite geofence");
    }

    #[test]
    fn test_scenario_boundary_score_goes_to_review() {
        let v = verification(0.50);
        assert!(!v.is_match, "match threshold is exclusive");
        let d = DecisionEngine::default().decide(v, true);
        assert_eq!(d.status, AttendanceStatus::ManualVerification);
        assert_eq!(d.rule, DecisionRule::NearMatchInsideGeofence);
        assert_eq!(d.note, "near-match (0.50) inside geofence");
    }

    #[test]
    fn test_scenario_match_outside_goes_to_review() {
        let d = DecisionEngine::default().decide(verification(0.80), false);
        assert_eq!(d.status, AttendanceStatus::ManualVerification);
        assert_eq!(d.note, "face verified (0.80) but outside geofence");
    }

    #[test]
    fn test_near_threshold_is_exclusive() {
        let d = DecisionEngine::default().decide(
            VerificationResult { is_match: false, score: DEFAULT_NEAR_MATCH_THRESHOLD },
            true,
        );
        assert_eq!(d.status, AttendanceStatus::Invalid);
    }

    #[test]
    fn test_no_match_outside_is_invalid_even_when_near() {
        let d = DecisionEngine::default().decide(verification(0.49), false);
        assert_eq!(d.rule, DecisionRule::NoMatchOutsideGeofence);
        assert_eq!(d.note, "face not verified (0.49) and outside geofence");
    }

    #[test]
    fn test_table_is_exhaustive_and_consistent() {
        let engine = DecisionEngine::default();
        let scores = [0.0, 0.2, 0.45, 0.4501, 0.5, 0.5001, 0.9, 1.0];
        let mut seen = std::collections::HashSet::new();

        for is_match in [true, false] {
            for within in [true, false] {
                for score in scores {
                    let d = engine.decide(VerificationResult { is_match, score }, within);
                    assert_eq!(d.status, d.rule.status());
                    let expected = match (is_match, within) {
                        (true, true) => DecisionRule::Verified,
                        (true, false) => DecisionRule::MatchOutsideGeofence,
                        (false, true) if score > 0.45 => DecisionRule::NearMatchInsideGeofence,
                        (false, true) => DecisionRule::NoMatchInsideGeofence,
                        (false, false) => DecisionRule::NoMatchOutsideGeofence,
                    };
                    assert_eq!(d.rule, expected, "match={is_match} within={within} score={score}");
                    seen.insert(d.rule);
                }
            }
        }

        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_decide_is_idempotent() {
        let engine = DecisionEngine::default();
        for (score, within) in [(0.72, true), (0.47, true), (0.1, false), (0.9, false)] {
            let v = verification(score);
            assert_eq!(engine.decide(v, within), engine.decide(v, within));
        }
    }

    #[test]
    fn test_custom_near_threshold() {
        let engine = DecisionEngine::new(DecisionPolicy { near_match_threshold: 0.2 });
        let d = engine.decide(verification(0.30), true);
        assert_eq!(d.status, AttendanceStatus::ManualVerification);
    }
}
