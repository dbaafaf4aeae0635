//! Health-state enums for the three per-patient machines.
//!
//! Every machine is a closed sum type matched exhaustively at each transition
//! site, so adding a state fails to compile until every consumer handles it.
//! The `code()` values are the stable interop mapping shared with external
//! backends and the trace format; they are append-only and never reordered.

use serde::{Deserialize, Serialize};

use crate::risk::CvdOutcome;

// ── Cardiac ──────────────────────────────────────────────────────────────────

/// Stochastic machine. Acute states last exactly one cycle, then take their
/// single deterministic cooldown transition; post states persist and feed
/// multipliers back into the risk equations. Death states are terminal for
/// the whole patient, not just this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardiacState {
    Stable,
    AcuteMi,
    PostMi,
    AcuteIschemicStroke,
    AcuteHemorrhagicStroke,
    PostStroke,
    Tia,
    AcuteHf,
    ChronicHf,
    CvDeath,
    NonCvDeath,
}

impl CardiacState {
    pub const COUNT: usize = 11;

    pub fn is_terminal(self) -> bool {
        matches!(self, CardiacState::CvDeath | CardiacState::NonCvDeath)
    }

    pub fn is_acute(self) -> bool {
        matches!(
            self,
            CardiacState::AcuteMi
                | CardiacState::AcuteIschemicStroke
                | CardiacState::AcuteHemorrhagicStroke
                | CardiacState::Tia
                | CardiacState::AcuteHf
        )
    }

    /// The single legal transition out of an acute state, taken on the cycle
    /// after the event fired. `None` for every non-acute state.
    pub fn cooldown(self) -> Option<CardiacState> {
        match self {
            CardiacState::AcuteMi => Some(CardiacState::PostMi),
            CardiacState::AcuteIschemicStroke => Some(CardiacState::PostStroke),
            CardiacState::AcuteHemorrhagicStroke => Some(CardiacState::PostStroke),
            CardiacState::Tia => Some(CardiacState::Stable),
            CardiacState::AcuteHf => Some(CardiacState::ChronicHf),
            CardiacState::Stable
            | CardiacState::PostMi
            | CardiacState::PostStroke
            | CardiacState::ChronicHf
            | CardiacState::CvDeath
            | CardiacState::NonCvDeath => None,
        }
    }

    /// Multiplier applied on top of the base equation while the patient
    /// occupies this background state. Survivors of an event carry elevated
    /// risk for the same and related outcomes.
    pub fn risk_multiplier(self, outcome: CvdOutcome) -> f64 {
        match self {
            CardiacState::PostMi => match outcome {
                CvdOutcome::Mi => 2.4,
                CvdOutcome::HeartFailure => 2.0,
                CvdOutcome::CvDeath => 1.9,
                CvdOutcome::IschemicStroke | CvdOutcome::HemorrhagicStroke | CvdOutcome::Tia => 1.3,
            },
            CardiacState::PostStroke => match outcome {
                CvdOutcome::IschemicStroke => 2.6,
                CvdOutcome::HemorrhagicStroke => 1.8,
                CvdOutcome::Tia => 1.8,
                CvdOutcome::CvDeath => 1.7,
                CvdOutcome::Mi | CvdOutcome::HeartFailure => 1.2,
            },
            CardiacState::ChronicHf => match outcome {
                CvdOutcome::HeartFailure => 1.0,
                CvdOutcome::CvDeath => 2.8,
                CvdOutcome::Mi => 1.4,
                CvdOutcome::IschemicStroke | CvdOutcome::HemorrhagicStroke | CvdOutcome::Tia => 1.2,
            },
            CardiacState::Stable
            | CardiacState::AcuteMi
            | CardiacState::AcuteIschemicStroke
            | CardiacState::AcuteHemorrhagicStroke
            | CardiacState::Tia
            | CardiacState::AcuteHf
            | CardiacState::CvDeath
            | CardiacState::NonCvDeath => 1.0,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            CardiacState::Stable => 0,
            CardiacState::AcuteMi => 1,
            CardiacState::PostMi => 2,
            CardiacState::AcuteIschemicStroke => 3,
            CardiacState::AcuteHemorrhagicStroke => 4,
            CardiacState::PostStroke => 5,
            CardiacState::Tia => 6,
            CardiacState::AcuteHf => 7,
            CardiacState::ChronicHf => 8,
            CardiacState::CvDeath => 9,
            CardiacState::NonCvDeath => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CardiacState::Stable),
            1 => Some(CardiacState::AcuteMi),
            2 => Some(CardiacState::PostMi),
            3 => Some(CardiacState::AcuteIschemicStroke),
            4 => Some(CardiacState::AcuteHemorrhagicStroke),
            5 => Some(CardiacState::PostStroke),
            6 => Some(CardiacState::Tia),
            7 => Some(CardiacState::AcuteHf),
            8 => Some(CardiacState::ChronicHf),
            9 => Some(CardiacState::CvDeath),
            10 => Some(CardiacState::NonCvDeath),
            _ => None,
        }
    }

    /// Accumulator slot; identical to `code()` so per-state month counters
    /// and the interop mapping can never drift apart.
    pub fn index(self) -> usize {
        self.code() as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CardiacState::Stable => "stable",
            CardiacState::AcuteMi => "acute_mi",
            CardiacState::PostMi => "post_mi",
            CardiacState::AcuteIschemicStroke => "acute_ischemic_stroke",
            CardiacState::AcuteHemorrhagicStroke => "acute_hemorrhagic_stroke",
            CardiacState::PostStroke => "post_stroke",
            CardiacState::Tia => "tia",
            CardiacState::AcuteHf => "acute_hf",
            CardiacState::ChronicHf => "chronic_hf",
            CardiacState::CvDeath => "cv_death",
            CardiacState::NonCvDeath => "non_cv_death",
        }
    }

    pub const ALL: [CardiacState; Self::COUNT] = [
        CardiacState::Stable,
        CardiacState::AcuteMi,
        CardiacState::PostMi,
        CardiacState::AcuteIschemicStroke,
        CardiacState::AcuteHemorrhagicStroke,
        CardiacState::PostStroke,
        CardiacState::Tia,
        CardiacState::AcuteHf,
        CardiacState::ChronicHf,
        CardiacState::CvDeath,
        CardiacState::NonCvDeath,
    ];
}

// ── Renal ────────────────────────────────────────────────────────────────────

/// Deterministic machine: the stage is a pure function of the continuous
/// eGFR value, re-derived every cycle after the decline update. `RenalDeath`
/// is never produced by `from_egfr`; it enters through the competing-risk
/// list while the patient is in `KidneyFailure`.
///
/// Declaration order is severity order; the derived `Ord` is relied on by
/// the monotone-progression tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RenalStage {
    Normal,
    Stage3a,
    Stage3b,
    Stage4,
    KidneyFailure,
    RenalDeath,
}

impl RenalStage {
    pub const COUNT: usize = 6;

    /// KDIGO-style thresholds in mL/min/1.73m².
    pub fn from_egfr(egfr: f64) -> RenalStage {
        if egfr >= 60.0 {
            RenalStage::Normal
        } else if egfr >= 45.0 {
            RenalStage::Stage3a
        } else if egfr >= 30.0 {
            RenalStage::Stage3b
        } else if egfr >= 15.0 {
            RenalStage::Stage4
        } else {
            RenalStage::KidneyFailure
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RenalStage::RenalDeath)
    }

    pub fn on_dialysis(self) -> bool {
        matches!(self, RenalStage::KidneyFailure)
    }

    /// Reduced kidney function raises cardiovascular risk across the board.
    pub fn risk_multiplier(self) -> f64 {
        match self {
            RenalStage::Normal => 1.0,
            RenalStage::Stage3a => 1.2,
            RenalStage::Stage3b => 1.5,
            RenalStage::Stage4 => 2.0,
            RenalStage::KidneyFailure => 2.8,
            RenalStage::RenalDeath => 1.0,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RenalStage::Normal => 0,
            RenalStage::Stage3a => 1,
            RenalStage::Stage3b => 2,
            RenalStage::Stage4 => 3,
            RenalStage::KidneyFailure => 4,
            RenalStage::RenalDeath => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RenalStage::Normal),
            1 => Some(RenalStage::Stage3a),
            2 => Some(RenalStage::Stage3b),
            3 => Some(RenalStage::Stage4),
            4 => Some(RenalStage::KidneyFailure),
            5 => Some(RenalStage::RenalDeath),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self.code() as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            RenalStage::Normal => "normal",
            RenalStage::Stage3a => "stage_3a",
            RenalStage::Stage3b => "stage_3b",
            RenalStage::Stage4 => "stage_4",
            RenalStage::KidneyFailure => "kidney_failure",
            RenalStage::RenalDeath => "renal_death",
        }
    }
}

// ── Neurological ─────────────────────────────────────────────────────────────

/// Monotonic machine: no recovery transitions exist, so `advance` can only
/// move rightwards through the declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NeuroState {
    Normal,
    MildImpairment,
    Dementia,
}

impl NeuroState {
    pub const COUNT: usize = 3;

    /// The next stage, if any. Progression never skips a stage.
    pub fn advance(self) -> Option<NeuroState> {
        match self {
            NeuroState::Normal => Some(NeuroState::MildImpairment),
            NeuroState::MildImpairment => Some(NeuroState::Dementia),
            NeuroState::Dementia => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            NeuroState::Normal => 0,
            NeuroState::MildImpairment => 1,
            NeuroState::Dementia => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(NeuroState::Normal),
            1 => Some(NeuroState::MildImpairment),
            2 => Some(NeuroState::Dementia),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self.code() as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            NeuroState::Normal => "normal",
            NeuroState::MildImpairment => "mild_impairment",
            NeuroState::Dementia => "dementia",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Cardiac ──────────────────────────────────────────────────────────────

    #[test]
    fn cardiac_codes_round_trip() {
        for state in CardiacState::ALL {
            assert_eq!(CardiacState::from_code(state.code()), Some(state));
        }
        assert_eq!(CardiacState::from_code(200), None);
    }

    #[test]
    fn cardiac_codes_are_dense_and_stable() {
        // The interop contract: codes are exactly 0..COUNT with no gaps.
        let mut seen = [false; CardiacState::COUNT];
        for state in CardiacState::ALL {
            let idx = state.index();
            assert!(!seen[idx], "duplicate code {idx}");
            seen[idx] = true;
        }
        assert!(seen.iter().all(|&s| s));
        // Spot-pin a few values so a reorder cannot slip through.
        assert_eq!(CardiacState::Stable.code(), 0);
        assert_eq!(CardiacState::CvDeath.code(), 9);
        assert_eq!(CardiacState::NonCvDeath.code(), 10);
    }

    #[test]
    fn every_acute_state_has_exactly_one_cooldown() {
        for state in CardiacState::ALL {
            assert_eq!(
                state.cooldown().is_some(),
                state.is_acute(),
                "cooldown/acute mismatch for {state:?}"
            );
        }
    }

    #[test]
    fn cooldown_targets_are_never_acute_or_terminal() {
        for state in CardiacState::ALL {
            if let Some(target) = state.cooldown() {
                assert!(!target.is_acute(), "{state:?} cools into acute {target:?}");
                assert!(!target.is_terminal(), "{state:?} cools into terminal {target:?}");
            }
        }
    }

    #[test]
    fn tia_cools_back_to_stable() {
        assert_eq!(CardiacState::Tia.cooldown(), Some(CardiacState::Stable));
        assert_eq!(CardiacState::AcuteMi.cooldown(), Some(CardiacState::PostMi));
        assert_eq!(CardiacState::AcuteHf.cooldown(), Some(CardiacState::ChronicHf));
    }

    #[test]
    fn post_states_raise_risk_above_stable() {
        for outcome in CvdOutcome::ALL {
            assert!(CardiacState::PostMi.risk_multiplier(outcome) >= 1.0);
            assert!(CardiacState::PostStroke.risk_multiplier(outcome) >= 1.0);
            assert_eq!(CardiacState::Stable.risk_multiplier(outcome), 1.0);
        }
        assert!(
            CardiacState::PostMi.risk_multiplier(CvdOutcome::Mi)
                > CardiacState::PostMi.risk_multiplier(CvdOutcome::Tia)
        );
    }

    // ── Renal ────────────────────────────────────────────────────────────────

    #[test]
    fn renal_stage_thresholds() {
        assert_eq!(RenalStage::from_egfr(90.0), RenalStage::Normal);
        assert_eq!(RenalStage::from_egfr(60.0), RenalStage::Normal);
        assert_eq!(RenalStage::from_egfr(59.9), RenalStage::Stage3a);
        assert_eq!(RenalStage::from_egfr(45.0), RenalStage::Stage3a);
        assert_eq!(RenalStage::from_egfr(44.9), RenalStage::Stage3b);
        assert_eq!(RenalStage::from_egfr(30.0), RenalStage::Stage3b);
        assert_eq!(RenalStage::from_egfr(15.0), RenalStage::Stage4);
        assert_eq!(RenalStage::from_egfr(14.9), RenalStage::KidneyFailure);
        assert_eq!(RenalStage::from_egfr(0.0), RenalStage::KidneyFailure);
    }

    #[test]
    fn renal_severity_order_matches_declaration() {
        assert!(RenalStage::Normal < RenalStage::Stage3a);
        assert!(RenalStage::Stage3a < RenalStage::Stage3b);
        assert!(RenalStage::Stage4 < RenalStage::KidneyFailure);
        assert!(RenalStage::KidneyFailure < RenalStage::RenalDeath);
    }

    #[test]
    fn renal_multiplier_rises_with_stage() {
        assert!(RenalStage::Stage3a.risk_multiplier() > RenalStage::Normal.risk_multiplier());
        assert!(RenalStage::Stage4.risk_multiplier() > RenalStage::Stage3b.risk_multiplier());
        assert!(RenalStage::KidneyFailure.risk_multiplier() > RenalStage::Stage4.risk_multiplier());
    }

    // ── Neuro ────────────────────────────────────────────────────────────────

    #[test]
    fn neuro_progression_is_monotonic_and_bounded() {
        assert_eq!(NeuroState::Normal.advance(), Some(NeuroState::MildImpairment));
        assert_eq!(NeuroState::MildImpairment.advance(), Some(NeuroState::Dementia));
        assert_eq!(NeuroState::Dementia.advance(), None);
        for state in [NeuroState::Normal, NeuroState::MildImpairment] {
            let next = state.advance().unwrap();
            assert!(next > state);
        }
    }

    #[test]
    fn state_serde_shapes_are_stable() {
        // The trace format writes bare variant names.
        assert_eq!(serde_json::to_string(&CardiacState::AcuteMi).unwrap(), "\"AcuteMi\"");
        assert_eq!(serde_json::to_string(&RenalStage::Stage3a).unwrap(), "\"Stage3a\"");
        assert_eq!(serde_json::to_string(&NeuroState::Dementia).unwrap(), "\"Dementia\"");
        let back: CardiacState = serde_json::from_str("\"PostStroke\"").unwrap();
        assert_eq!(back, CardiacState::PostStroke);
    }
}
