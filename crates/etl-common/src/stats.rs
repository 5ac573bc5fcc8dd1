//! Statistical primitives shared across clinical processors. Kept to
//! sample extraction helpers and summary statistics — no per-record-type
//! abstraction lives here.

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, matching Python's `statistics.stdev`
/// (sample stdev) when `values.len() >= 2`; returns 0.0 otherwise.
pub fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

pub fn coefficient_of_variation_percent(values: &[f64]) -> f64 {
    let m = mean(values);
    if m == 0.0 {
        return 0.0;
    }
    (stdev(values) / m) * 100.0
}

pub fn percent_in_range(values: &[f64], lo: f64, hi: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let count = values.iter().filter(|v| **v >= lo && **v <= hi).count();
    (count as f64 / values.len() as f64) * 100.0
}

pub fn percent_below(values: &[f64], threshold: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let count = values.iter().filter(|v| **v < threshold).count();
    (count as f64 / values.len() as f64) * 100.0
}

pub fn percent_above(values: &[f64], threshold: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let count = values.iter().filter(|v| **v > threshold).count();
    (count as f64 / values.len() as f64) * 100.0
}

pub fn min_f64(values: &[f64]) -> f64 {
    values.iter().cloned().fold(f64::INFINITY, f64::min)
}

pub fn max_f64(values: &[f64]) -> f64 {
    values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
}

/// Splits `values` (assumed already in chronological order) into two
/// halves and compares their means, used by several processors' trend
/// analysis (`improving` / `worsening` / `stable`).
pub fn trend_from_halves(values: &[f64], threshold_fraction: f64) -> &'static str {
    let mid = values.len() / 2;
    let first_half = &values[..mid];
    let second_half = &values[mid..];
    let first_mean = mean(first_half);
    let second_mean = mean(second_half);
    if first_mean == 0.0 {
        return "stable";
    }
    let change = (second_mean - first_mean) / first_mean;
    if change < -threshold_fraction {
        "improving"
    } else if change > threshold_fraction {
        "worsening"
    } else {
        "stable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn stdev_matches_known_sample() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((stdev(&values) - 2.138_089_935_299_395).abs() < 1e-9);
    }

    #[test]
    fn percent_in_range_counts_inclusive_bounds() {
        assert_eq!(percent_in_range(&[70.0, 100.0, 180.0, 200.0], 70.0, 180.0), 75.0);
    }

    #[test]
    fn trend_detects_improving() {
        let values = vec![100.0, 100.0, 80.0, 80.0];
        assert_eq!(trend_from_halves(&values, 0.05), "improving");
    }
}
