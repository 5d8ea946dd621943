//! Candle (OHLCV bar) type and sub-minute resampling.

use serde::{Deserialize, Serialize};

/// Supported venue-facing granularities; sub-minute ones are synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    S1,
    S5,
    S15,
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Interval {
    pub fn seconds(self) -> i64 {
        match self {
            Interval::S1 => 1,
            Interval::S5 => 5,
            Interval::S15 => 15,
            Interval::M1 => 60,
            Interval::M5 => 5 * 60,
            Interval::M15 => 15 * 60,
            Interval::M30 => 30 * 60,
            Interval::H1 => 60 * 60,
            Interval::H4 => 4 * 60 * 60,
            Interval::D1 => 24 * 60 * 60,
        }
    }

    /// Sub-minute intervals aren't natively offered by any supported venue;
    /// adapters must synthesize them from 1m bars.
    pub fn is_synthesized(self) -> bool {
        matches!(self, Interval::S1 | Interval::S5 | Interval::S15)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::S1 => "1s",
            Interval::S5 => "5s",
            Interval::S15 => "15s",
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "1s" => Interval::S1,
            "5s" => Interval::S5,
            "15s" => Interval::S15,
            "1m" => Interval::M1,
            "5m" => Interval::M5,
            "15m" => Interval::M15,
            "30m" => Interval::M30,
            "1h" => Interval::H1,
            "4h" => Interval::H4,
            "1d" => Interval::D1,
            _ => return None,
        })
    }
}

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: Option<f64>,
    pub closed: bool,
}

impl Candle {
    /// `low <= min(open,close) <= max(open,close) <= high`, volumes non-negative.
    pub fn is_consistent(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo
            && lo <= hi
            && hi <= self.high
            && self.volume >= 0.0
            && self.turnover.map(|t| t >= 0.0).unwrap_or(true)
    }
}

/// Split a closed 1-minute candle into `n` deterministic sub-candles whose
/// aggregate OHLCV reproduces the source bar exactly:
/// `s1.open == source.open`, `sn.close == source.close`,
/// `max(s.high) == source.high`, `min(s.low) == source.low`,
/// `sum(s.volume) == source.volume`.
///
/// Deterministic given `(source.time, n)`: the high/low extremes are placed
/// at fixed fractional offsets derived from the source's open time, so the
/// same input always resamples to the same output.
pub fn resample(source: &Candle, n: usize, sub_interval_secs: i64) -> Vec<Candle> {
    assert!(n >= 1, "resample requires at least one sub-candle");
    if n == 1 {
        return vec![*source];
    }

    // Deterministic slot (in [0, n)) for where the high and low extremes
    // land, derived from the bar's own timestamp so repeated calls on the
    // same bar always agree.
    let high_slot = (source.time.rem_euclid(n as i64)) as usize;
    let low_slot = (source.time.rem_euclid((n as i64).max(2)) as usize + n / 2) % n;

    let open = source.open;
    let close = source.close;
    let high = source.high;
    let low = source.low;
    let volume_per_slot = source.volume / n as f64;
    let turnover_per_slot = source.turnover.map(|t| t / n as f64);

    // Build n+1 anchor prices walking open -> ... -> close, inserting the
    // high/low extremes at their slots, then pairwise-interpolate the open
    // of each sub-candle from the previous anchor.
    let mut anchors = Vec::with_capacity(n + 1);
    anchors.push(open);
    for i in 0..n {
        let frac = (i + 1) as f64 / n as f64;
        let mut price = open + (close - open) * frac;
        if i == high_slot {
            price = high;
        }
        if i == low_slot && low_slot != high_slot {
            price = low;
        }
        anchors.push(price);
    }
    *anchors.last_mut().unwrap() = close;

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let seg_open = anchors[i];
        let seg_close = anchors[i + 1];
        let mut seg_high = seg_open.max(seg_close);
        let mut seg_low = seg_open.min(seg_close);
        if i == high_slot {
            seg_high = seg_high.max(high);
        }
        if i == low_slot {
            seg_low = seg_low.min(low);
        }
        out.push(Candle {
            time: source.time + i as i64 * sub_interval_secs,
            open: seg_open,
            high: seg_high,
            low: seg_low,
            close: seg_close,
            volume: volume_per_slot,
            turnover: turnover_per_slot,
            closed: source.closed || i < n - 1,
        });
    }

    // open/close are exact by construction (anchors[0] and anchors[n] are
    // pinned above); high/low are exact because the high_slot/low_slot
    // segment's boundary anchor was pinned to the source extreme, which by
    // the candle invariant is >= every interpolated value in between.
    out[0].open = open;
    out[n - 1].close = close;

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(time: i64) -> Candle {
        Candle {
            time,
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 102.0,
            volume: 12.0,
            turnover: Some(1200.0),
            closed: true,
        }
    }

    #[test]
    fn resample_preserves_aggregate_ohlc() {
        let source = sample_candle(60_000);
        for n in [2usize, 3, 4, 12] {
            let subs = resample(&source, n, 5);
            assert_eq!(subs.len(), n);
            assert_eq!(subs[0].open, source.open);
            assert_eq!(subs[n - 1].close, source.close);
            let max_high = subs.iter().map(|c| c.high).fold(f64::MIN, f64::max);
            let min_low = subs.iter().map(|c| c.low).fold(f64::MAX, f64::min);
            assert_eq!(max_high, source.high);
            assert_eq!(min_low, source.low);
            let total_volume: f64 = subs.iter().map(|c| c.volume).sum();
            assert!((total_volume - source.volume).abs() < 1e-9);
        }
    }

    #[test]
    fn resample_is_deterministic() {
        let source = sample_candle(123_000);
        let a = resample(&source, 4, 15);
        let b = resample(&source, 4, 15);
        assert_eq!(a, b);
    }

    #[test]
    fn resample_timestamps_are_ordered_within_the_group() {
        let source = sample_candle(60_000);
        let subs = resample(&source, 4, 15);
        for w in subs.windows(2) {
            assert!(w[0].time < w[1].time);
        }
    }

    #[test]
    fn single_sub_candle_is_the_source_unchanged() {
        let source = sample_candle(0);
        let subs = resample(&source, 1, 60);
        assert_eq!(subs, vec![source]);
    }

    #[test]
    fn consistency_check_catches_bad_ohlc() {
        let mut c = sample_candle(0);
        assert!(c.is_consistent());
        c.high = 50.0;
        assert!(!c.is_consistent());
    }
}
