//! The scoring contract (§4.A): a pure, deterministic function shared by
//! device and server. No suspension point may ever be introduced here —
//! callers await around it, never inside it.

use crate::models::{Band, Channels, Mode};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput {
    pub channels: Channels,
    pub mode: Mode,
    pub distance_to_perimeter_m: f64,
    pub is_night: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutput {
    pub score: f64,
    pub band: Band,
}

fn clamp01(x: f64) -> f64 {
    x.max(0.0).min(1.0)
}

fn mode_factor(mode: Mode) -> f64 {
    match mode {
        Mode::Stealth => 0.70,
        Mode::Guardian => 1.00,
        Mode::Perimeter => 1.30,
        // Life-safety modes bypass scoring-driven gating entirely (§4.D);
        // treat them as the most permissive guardian-equivalent factor.
        Mode::Emergency | Mode::Alarm => 1.00,
    }
}

fn thresholds(mode: Mode) -> (f64, f64) {
    match mode {
        Mode::Stealth => (0.35, 0.65),
        Mode::Guardian => (0.30, 0.60),
        Mode::Perimeter => (0.25, 0.50),
        Mode::Emergency | Mode::Alarm => (0.30, 0.60),
    }
}

/// Exactly the §4.A formula. Two implementations of this function, given
/// identical inputs, must agree to at least 1e-9 on `score`.
pub fn score(input: ScoreInput) -> ScoreOutput {
    let c = input.channels;
    let base = 1.00 * b(c.person) + 0.70 * b(c.vehicle) + 0.15 * b(c.linger);
    let pet_factor = 1.0 - 0.60 * b(c.pet);
    let perimeter_factor = if input.distance_to_perimeter_m < 1.5 {
        1.25
    } else {
        1.00
    };
    let night_factor = if input.is_night { 1.15 } else { 1.00 };

    let score = clamp01(base * pet_factor * perimeter_factor * night_factor * mode_factor(input.mode));

    let (low_cutoff, high_cutoff) = thresholds(input.mode);
    let band = if score < low_cutoff {
        Band::Low
    } else if score < high_cutoff {
        Band::Medium
    } else {
        Band::High
    };

    ScoreOutput { score, band }
}

fn b(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

/// Inputs to the Candidate Store's intra-home ordering score (§4.A). This
/// is a distinct quantity from `score` above: only monotonicity matters,
/// not absolute magnitude.
#[derive(Debug, Clone, Copy)]
pub struct PriorityScoreInput {
    pub priority_weight: f64,
    pub person: bool,
    pub vehicle: bool,
    pub motion_score: f64,
    pub time_of_day_factor: f64,
    pub location_importance: f64,
    pub age_minutes: f64,
    pub tier_ordinal: u8,
}

/// `priority*100 + channel bonuses + motion` scaled by time-of-day and
/// location importance, plus a recency bonus decaying from 120 at age=0 to
/// 0 at age=60min, all scaled by `(1 + 0.2*tier_ordinal)` (§4.A).
pub fn priority_score(input: PriorityScoreInput) -> f64 {
    let base = input.priority_weight * 100.0
        + if input.person { 50.0 } else { 0.0 }
        + if input.vehicle { 30.0 } else { 0.0 }
        + 20.0 * input.motion_score;

    let scaled = base * input.time_of_day_factor * input.location_importance;

    let recency_bonus = (120.0 * (1.0 - (input.age_minutes / 60.0).min(1.0))).max(0.0);

    (scaled + recency_bonus) * (1.0 + 0.2 * input.tier_ordinal as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;

    fn channels(person: bool, vehicle: bool, pet: bool, linger: bool) -> Channels {
        Channels {
            person,
            vehicle,
            pet,
            linger,
        }
    }

    #[test]
    fn deterministic_across_repeated_calls() {
        let input = ScoreInput {
            channels: channels(true, false, false, true),
            mode: Mode::Guardian,
            distance_to_perimeter_m: 1.0,
            is_night: true,
        };
        let a = score(input);
        let b = score(input);
        assert_eq!(a.score, b.score);
        assert!((a.score - b.score).abs() < 1e-9);
    }

    #[test]
    fn formula_matches_worked_example() {
        // person + linger, close to perimeter, night, guardian mode.
        let input = ScoreInput {
            channels: channels(true, false, false, true),
            mode: Mode::Guardian,
            distance_to_perimeter_m: 1.0,
            is_night: true,
        };
        // base = 1.00 + 0.15 = 1.15; pet_factor=1; perimeter=1.25; night=1.15; mode=1.00
        let expected = (1.15_f64 * 1.0 * 1.25 * 1.15 * 1.00).min(1.0);
        let out = score(input);
        assert!((out.score - expected).abs() < 1e-9);
        assert_eq!(out.band, Band::High);
    }

    #[test]
    fn bands_respect_mode_specific_thresholds() {
        let low_input = ScoreInput {
            channels: channels(false, false, true, false),
            mode: Mode::Stealth,
            distance_to_perimeter_m: 10.0,
            is_night: false,
        };
        assert_eq!(score(low_input).band, Band::Low);

        let high_input = ScoreInput {
            channels: channels(true, true, false, true),
            mode: Mode::Perimeter,
            distance_to_perimeter_m: 0.5,
            is_night: true,
        };
        assert_eq!(score(high_input).band, Band::High);
    }

    #[test]
    fn score_is_clamped_to_unit_interval() {
        let input = ScoreInput {
            channels: channels(true, true, false, true),
            mode: Mode::Perimeter,
            distance_to_perimeter_m: 0.1,
            is_night: true,
        };
        assert!(score(input).score <= 1.0);
    }

    #[test]
    fn priority_score_is_monotone_in_priority() {
        let base = PriorityScoreInput {
            priority_weight: 1.0,
            person: false,
            vehicle: false,
            motion_score: 0.0,
            time_of_day_factor: 1.0,
            location_importance: 1.0,
            age_minutes: 0.0,
            tier_ordinal: Tier::Standard.ordinal(),
        };
        let low = priority_score(base);
        let high = priority_score(PriorityScoreInput {
            priority_weight: 4.0,
            ..base
        });
        assert!(high > low);
    }

    #[test]
    fn recency_bonus_decays_to_zero_by_sixty_minutes() {
        let fresh = PriorityScoreInput {
            priority_weight: 1.0,
            person: false,
            vehicle: false,
            motion_score: 0.0,
            time_of_day_factor: 1.0,
            location_importance: 1.0,
            age_minutes: 0.0,
            tier_ordinal: 0,
        };
        let stale = PriorityScoreInput {
            age_minutes: 120.0,
            ..fresh
        };
        assert!(priority_score(fresh) > priority_score(stale));
        let at_cap = PriorityScoreInput {
            age_minutes: 60.0,
            ..fresh
        };
        let past_cap = PriorityScoreInput {
            age_minutes: 90.0,
            ..fresh
        };
        assert!((priority_score(at_cap) - priority_score(past_cap)).abs() < 1e-9);
    }
}
