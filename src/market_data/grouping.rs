// =============================================================================
// Interval Grouping — derive coarser candles from a unit candle sequence
// =============================================================================
//
// Pure and side-effect free.  A bucket collects consecutive unit candles of
// one session type; for intraday kinds it additionally stops at the
// wall-clock boundary of `unit_ms * multiple`.  A bucket flushes when it holds
// `multiple` members, when the next candle crosses the boundary, when the
// session type changes, and once more at the end of input.
// =============================================================================

use crate::market_data::candle::Candle;
use crate::types::IntervalKind;

/// Group an ascending, non-overlapping unit candle sequence of `kind` into
/// candles of `multiple` units. Returns an empty vector for `multiple < 1`.
pub fn get_candle(candles: &[Candle], kind: IntervalKind, multiple: u32) -> Vec<Candle> {
    if candles.is_empty() || multiple < 1 {
        return Vec::new();
    }

    // Only intraday buckets stop at a wall-clock boundary.
    let span = if kind.is_intraday() {
        match kind.unit_ms().checked_mul(i64::from(multiple)) {
            Some(span) => Some(span),
            None => return Vec::new(),
        }
    } else {
        None
    };
    let target = multiple as usize;

    let mut result = Vec::new();
    let mut bucket: Option<(Candle, usize, i64)> = None;

    for candle in candles {
        if let Some((merged, count, boundary)) = bucket.as_mut() {
            if can_join(kind, merged, *boundary, candle) {
                *merged = merged.merge(candle);
                *count += 1;
            } else {
                result.push(merged.clone());
                bucket = Some(open_bucket(span, candle));
            }
        } else {
            bucket = Some(open_bucket(span, candle));
        }

        if let Some((merged, count, _)) = bucket.as_ref() {
            if *count == target {
                result.push(merged.clone());
                bucket = None;
            }
        }
    }

    if let Some((merged, _, _)) = bucket {
        result.push(merged);
    }
    result
}

/// Inclusive end of the aligned `span` containing `start`.
pub fn bucket_boundary(start: i64, span: i64) -> i64 {
    start.div_euclid(span) * span + span - 1
}

fn open_bucket(span: Option<i64>, first: &Candle) -> (Candle, usize, i64) {
    let boundary = span.map_or(i64::MAX, |span| bucket_boundary(first.start_time, span));
    (first.clone(), 1, boundary)
}

fn can_join(kind: IntervalKind, bucket: &Candle, boundary: i64, candle: &Candle) -> bool {
    if bucket.session != candle.session {
        return false;
    }
    if kind.is_intraday() {
        return candle.end_time <= boundary;
    }
    true
}
