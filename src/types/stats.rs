//! Small numeric helpers shared by calibration and analysis

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (ddof = 0)
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

pub fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().fold(None, |acc, v| match acc {
        Some(m) if m >= v => Some(m),
        _ => Some(v),
    })
}

/// Trapezoidal integral of `y` over the (possibly non-uniform) abscissa `x`
pub fn trapezoid(y: &[f64], x: &[f64]) -> f64 {
    y.windows(2)
        .zip(x.windows(2))
        .map(|(yw, xw)| 0.5 * (yw[0] + yw[1]) * (xw[1] - xw[0]))
        .sum()
}

/// Whole samples spanning `seconds` at `rate`, tolerant of float error in the rate
pub fn whole_samples(seconds: f64, rate: f64) -> usize {
    let n = seconds * rate;
    if n.is_finite() && n > 0.0 {
        (n + 1e-6) as usize
    } else {
        0
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Index of the element closest to `target`
pub fn nearest_index(values: &[f64], target: f64) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - target)
                .abs()
                .partial_cmp(&(*b - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_population_std() {
        let values = [698.0, 702.0, 698.0, 702.0];
        assert_abs_diff_eq!(mean(&values).unwrap(), 700.0, epsilon = 1e-12);
        assert_abs_diff_eq!(std_dev(&values).unwrap(), 2.0, epsilon = 1e-12);
        assert!(mean(&[]).is_none());
    }

    #[test]
    fn test_trapezoid_non_uniform() {
        let x = [0.0, 0.1, 0.3];
        let y = [1.0, 1.0, 1.0];
        assert_abs_diff_eq!(trapezoid(&y, &x), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_nearest_index_prefers_first_tie() {
        let t = [0.0, 1.0, 2.0];
        assert_eq!(nearest_index(&t, 0.5), Some(0));
        assert_eq!(nearest_index(&t, 1.9), Some(2));
        assert_eq!(nearest_index(&[], 1.0), None);
    }
}
