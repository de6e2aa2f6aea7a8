//! Opening-range computation, lock validation and breakout detection.
//!
//! - The range covers every admitted bar with `range_start <= open < slot_time`.
//! - `freeze_close` is the close of the latest such bar.
//! - Breakout levels sit one tick beyond the range high and low.
//! - A bar whose high strictly exceeds the long level, or whose low strictly
//!   undercuts the short level, is a breakout. The first such bar in
//!   chronological order wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TieBreakPolicy;
use crate::types::{round_to_tick, Bar, Direction};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub high: f64,
    pub low: f64,
    pub freeze_close: f64,
    pub bar_count: usize,
}

/// Partial view of the window; fields are absent until a bar is seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeCandidate {
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub freeze_close: Option<f64>,
    pub bar_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RangeRejection {
    MissingValues,
    NotWide { high: f64, low: f64 },
    InsufficientBars { have: usize, need: usize },
}

/// Recompute from scratch over `bars` (expected oldest first, already windowed).
pub fn compute_range(bars: &[Bar]) -> RangeCandidate {
    let mut c = RangeCandidate::default();
    for b in bars {
        c.high = Some(c.high.map_or(b.high, |h| h.max(b.high)));
        c.low = Some(c.low.map_or(b.low, |l| l.min(b.low)));
        c.bar_count += 1;
    }
    c.freeze_close = bars
        .iter()
        .max_by_key(|b| b.open_timestamp_utc)
        .map(|b| b.close);
    c
}

/// Bars needed for a window: `ceil(expected * fraction)`, never below one.
pub fn min_bar_count(window: chrono::Duration, bar_period: chrono::Duration, fraction: f64) -> usize {
    let period = bar_period.num_seconds().max(1);
    let expected = (window.num_seconds().max(0) / period) as f64;
    let need = (expected * fraction.clamp(0.0, 1.0)).ceil() as usize;
    need.max(1)
}

pub fn validate_range(candidate: &RangeCandidate, min_bars: usize) -> Result<Range, RangeRejection> {
    let (Some(high), Some(low), Some(freeze_close)) =
        (candidate.high, candidate.low, candidate.freeze_close)
    else {
        return Err(RangeRejection::MissingValues);
    };
    if !(high > low) {
        return Err(RangeRejection::NotWide { high, low });
    }
    if candidate.bar_count < min_bars {
        return Err(RangeRejection::InsufficientBars {
            have: candidate.bar_count,
            need: min_bars,
        });
    }
    Ok(Range {
        high,
        low,
        freeze_close,
        bar_count: candidate.bar_count,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakoutLevels {
    pub long: f64,
    pub short: f64,
}

impl BreakoutLevels {
    pub fn from_range(range: &Range, tick: f64) -> Self {
        Self {
            long: round_to_tick(range.high + tick, tick),
            short: round_to_tick(range.low - tick, tick),
        }
    }

    pub fn level(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.long,
            Direction::Short => self.short,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Breakout {
    pub direction: Direction,
    pub bar_open: DateTime<Utc>,
    /// Both levels were pierced by the same bar and the policy picked a side.
    pub ambiguous: bool,
}

/// Evaluate a single bar against the levels.
pub fn evaluate_bar(bar: &Bar, levels: &BreakoutLevels, policy: TieBreakPolicy) -> Option<Breakout> {
    let long = bar.high > levels.long;
    let short = bar.low < levels.short;
    let direction = match (long, short) {
        (false, false) => return None,
        (true, false) => Direction::Long,
        (false, true) => Direction::Short,
        (true, true) => match policy {
            TieBreakPolicy::LongWins => Direction::Long,
            TieBreakPolicy::ShortWins => Direction::Short,
            TieBreakPolicy::Skip => return None,
        },
    };
    Some(Breakout {
        direction,
        bar_open: bar.open_timestamp_utc,
        ambiguous: long && short,
    })
}

/// First breakout in chronological order among `bars`.
pub fn first_breakout(bars: &[Bar], levels: &BreakoutLevels, policy: TieBreakPolicy) -> Option<Breakout> {
    let mut ordered: Vec<&Bar> = bars.iter().collect();
    ordered.sort_by_key(|b| b.open_timestamp_utc);
    ordered.into_iter().find_map(|b| evaluate_bar(b, levels, policy))
}

/// Protective prices for a breakout entry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BracketPrices {
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub break_even_trigger: f64,
}

pub struct BracketParams {
    pub tick_size: f64,
    pub target_points: f64,
    pub stop_cap_points: Option<f64>,
    pub break_even_fraction: f64,
}

/// Stop sits at the opposite range extreme (capped when configured), target at
/// a fixed distance, break-even trigger at a fraction of the target distance.
pub fn bracket_prices(
    direction: Direction,
    range: &Range,
    levels: &BreakoutLevels,
    p: &BracketParams,
) -> BracketPrices {
    let entry = levels.level(direction);
    let sign = direction.sign();
    let opposite = match direction {
        Direction::Long => range.low,
        Direction::Short => range.high,
    };
    let mut stop_distance = (entry - opposite).abs();
    if let Some(cap) = p.stop_cap_points {
        stop_distance = stop_distance.min(cap);
    }
    BracketPrices {
        entry,
        stop: round_to_tick(entry - sign * stop_distance, p.tick_size),
        target: round_to_tick(entry + sign * p.target_points, p.tick_size),
        break_even_trigger: round_to_tick(
            entry + sign * p.target_points * p.break_even_fraction,
            p.tick_size,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarSource, Instrument};
    use chrono::TimeZone;

    fn bar(m: u32, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            instrument: Instrument("ES".into()),
            open_timestamp_utc: Utc.with_ymd_and_hms(2025, 7, 1, 13, m, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            source: BarSource::Live,
        }
    }

    #[test]
    fn range_is_deterministic_regardless_of_recompute_count() {
        let bars = vec![
            bar(0, 101.0, 99.0, 100.0),
            bar(1, 103.0, 100.0, 102.0),
            bar(2, 102.0, 98.5, 99.0),
        ];
        let first = compute_range(&bars);
        for _ in 0..5 {
            assert_eq!(compute_range(&bars), first);
        }
        assert_eq!(first.high, Some(103.0));
        assert_eq!(first.low, Some(98.5));
        assert_eq!(first.freeze_close, Some(99.0));
        assert_eq!(first.bar_count, 3);
    }

    #[test]
    fn freeze_close_uses_latest_bar_even_if_unordered() {
        let bars = vec![bar(2, 102.0, 98.5, 99.0), bar(0, 101.0, 99.0, 100.0)];
        assert_eq!(compute_range(&bars).freeze_close, Some(99.0));
    }

    #[test]
    fn validation_refuses_missing_flat_and_thin_ranges() {
        assert_eq!(
            validate_range(&RangeCandidate::default(), 1),
            Err(RangeRejection::MissingValues)
        );
        let flat = compute_range(&[bar(0, 100.0, 100.0, 100.0)]);
        assert!(matches!(validate_range(&flat, 1), Err(RangeRejection::NotWide { .. })));
        let thin = compute_range(&[bar(0, 101.0, 99.0, 100.0)]);
        assert_eq!(
            validate_range(&thin, 2),
            Err(RangeRejection::InsufficientBars { have: 1, need: 2 })
        );
        assert!(validate_range(&thin, 1).is_ok());
    }

    #[test]
    fn min_bar_count_applies_fraction() {
        let hour = chrono::Duration::minutes(60);
        let minute = chrono::Duration::minutes(1);
        assert_eq!(min_bar_count(hour, minute, 0.85), 51);
        assert_eq!(min_bar_count(hour, minute, 0.0), 1);
    }

    #[test]
    fn levels_are_one_tick_beyond_range() {
        let range = Range { high: 4510.0, low: 4490.0, freeze_close: 4500.0, bar_count: 60 };
        let levels = BreakoutLevels::from_range(&range, 0.25);
        assert_eq!(levels.long, 4510.25);
        assert_eq!(levels.short, 4489.75);
    }

    #[test]
    fn breakout_requires_strict_crossing() {
        let levels = BreakoutLevels { long: 105.0, short: 95.0 };
        assert!(evaluate_bar(&bar(10, 105.0, 96.0, 100.0), &levels, TieBreakPolicy::LongWins).is_none());
        let up = evaluate_bar(&bar(10, 105.25, 96.0, 105.0), &levels, TieBreakPolicy::LongWins).unwrap();
        assert_eq!(up.direction, Direction::Long);
        let down = evaluate_bar(&bar(10, 100.0, 94.75, 95.0), &levels, TieBreakPolicy::LongWins).unwrap();
        assert_eq!(down.direction, Direction::Short);
    }

    #[test]
    fn tie_break_policy_is_explicit() {
        let levels = BreakoutLevels { long: 105.0, short: 95.0 };
        let both = bar(10, 106.0, 94.0, 100.0);
        let long = evaluate_bar(&both, &levels, TieBreakPolicy::LongWins).unwrap();
        assert_eq!(long.direction, Direction::Long);
        assert!(long.ambiguous);
        assert_eq!(
            evaluate_bar(&both, &levels, TieBreakPolicy::ShortWins).unwrap().direction,
            Direction::Short
        );
        assert!(evaluate_bar(&both, &levels, TieBreakPolicy::Skip).is_none());
    }

    #[test]
    fn first_breakout_is_chronological() {
        let levels = BreakoutLevels { long: 105.0, short: 95.0 };
        let bars = vec![bar(12, 110.0, 100.0, 108.0), bar(11, 100.0, 90.0, 91.0)];
        let b = first_breakout(&bars, &levels, TieBreakPolicy::LongWins).unwrap();
        assert_eq!(b.direction, Direction::Short);
    }

    #[test]
    fn bracket_prices_cap_stop_and_place_break_even() {
        let range = Range { high: 4510.0, low: 4490.0, freeze_close: 4500.0, bar_count: 60 };
        let levels = BreakoutLevels::from_range(&range, 0.25);
        let mut params = BracketParams {
            tick_size: 0.25,
            target_points: 10.0,
            stop_cap_points: None,
            break_even_fraction: 0.65,
        };
        let long = bracket_prices(Direction::Long, &range, &levels, &params);
        assert_eq!(long.entry, 4510.25);
        assert_eq!(long.stop, 4490.0);
        assert_eq!(long.target, 4520.25);
        assert_eq!(long.break_even_trigger, 4516.75);

        params.stop_cap_points = Some(8.0);
        let short = bracket_prices(Direction::Short, &range, &levels, &params);
        assert_eq!(short.entry, 4489.75);
        assert_eq!(short.stop, 4497.75);
        assert_eq!(short.target, 4479.75);
    }
}
