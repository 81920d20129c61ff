use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Rounds half away from zero to `decimals` places.
pub fn round_to_scale(value: f64, decimals: u32) -> f64 {
    snap(value, decimals, f64::round)
}

/// Rounds to `decimals` places but never leaves `[min, max]`, stepping one
/// unit inward when plain rounding lands outside the band.
pub fn round_within(value: f64, decimals: u32, min: f64, max: f64) -> f64 {
    let rounded = round_to_scale(value, decimals);
    if rounded < min {
        let up = snap(min, decimals, f64::ceil);
        if up <= max {
            return up;
        }
        return min;
    }
    if rounded > max {
        let down = snap(max, decimals, f64::floor);
        if down >= min {
            return down;
        }
        return max;
    }
    rounded
}

// Magnitudes whose scaled form overflows carry no fractional digits; keep them as is.
fn snap(value: f64, decimals: u32, op: fn(f64) -> f64) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    op(scaled) / factor
}

/// Number of decimals needed to express an exchange step such as `0.00001000`.
pub fn infer_decimal_scale(step: f64) -> u32 {
    let formatted = format!("{step:.16}");
    match formatted.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

/// Delay before retry number `attempt` (1-based), doubling from `initial` and capped at `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << shift).min(max)
}

/// Formats a price or quantity for a request without trailing zeros.
pub fn decimal_string(value: f64, decimals: u32) -> String {
    let mut out = format!("{value:.prec$}", prec = decimals as usize);
    while out.contains('.') && out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{backoff_delay, decimal_string, infer_decimal_scale, round_to_scale, round_within};

    fn approx_eq(left: f64, right: f64) {
        let diff = (left - right).abs();
        assert!(diff < 1e-9, "left={} right={} diff={}", left, right, diff);
    }

    #[test]
    fn rounds_to_tick_scale() {
        approx_eq(round_to_scale(25_213.456, 2), 25_213.46);
        approx_eq(round_to_scale(0.0987654321, 6), 0.098765);
    }

    #[test]
    fn round_within_stays_in_band() {
        approx_eq(round_within(1.0049, 2, 1.005, 1.02), 1.01);
        approx_eq(round_within(1.0196, 2, 1.0, 1.019), 1.01);
        approx_eq(round_within(25_250.123, 2, 25_200.0, 25_300.0), 25_250.12);
    }

    #[test]
    fn infers_scale_from_step() {
        assert_eq!(infer_decimal_scale(0.01), 2);
        assert_eq!(infer_decimal_scale(0.000001), 6);
        assert_eq!(infer_decimal_scale(1.0), 0);
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        assert_eq!(backoff_delay(1, initial, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, initial, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, initial, max), Duration::from_millis(400));
        assert_eq!(backoff_delay(4, initial, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(40, initial, max), Duration::from_millis(500));
    }

    #[test]
    fn rounding_huge_values_stays_finite() {
        let huge = f64::MAX / 2.0;
        assert_eq!(round_to_scale(huge, 8), huge);
        assert_eq!(round_within(f64::MAX, 2, 1.0, f64::MAX), f64::MAX);
        assert_eq!(round_within(huge, 2, 25_200.0, 25_300.0), 25_300.0);
    }

    #[test]
    fn decimal_string_trims_zeros() {
        assert_eq!(decimal_string(25_200.5, 2), "25200.5");
        assert_eq!(decimal_string(0.1, 6), "0.1");
        assert_eq!(decimal_string(3.0, 6), "3");
    }
}
