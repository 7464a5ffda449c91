//! One-dimensional curve helpers for the elbow search.

/// Gaussian smoothing truncated at four standard deviations, with
/// `d c b a | a b c d | d c b a` reflection at both ends.
pub fn gaussian_filter1d(input: &[f64], sigma: f64) -> Vec<f64> {
    if input.is_empty() || sigma <= 0.0 {
        return input.to_vec();
    }
    let radius = (4.0 * sigma + 0.5) as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();

    let n = input.len() as isize;
    (0..n)
        .map(|i| {
            kernel
                .iter()
                .zip(-radius..=radius)
                .map(|(w, offset)| w * input[reflect(i + offset, n)])
                .sum::<f64>()
                / norm
        })
        .collect()
}

fn reflect(mut idx: isize, n: isize) -> usize {
    // The kernel can be wider than the signal, so fold until in range.
    loop {
        if idx < 0 {
            idx = -idx - 1;
        } else if idx >= n {
            idx = 2 * n - idx - 1;
        } else {
            return idx as usize;
        }
    }
}

/// Discrete first derivative: central differences inside, one-sided at the
/// ends. Fewer than two points yield zeros.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mut out = Vec::with_capacity(n);
    out.push(values[1] - values[0]);
    for i in 1..n - 1 {
        out.push((values[i + 1] - values[i - 1]) / 2.0);
    }
    out.push(values[n - 1] - values[n - 2]);
    out
}

/// Indices strictly lower than both neighbours. Endpoints never qualify.
pub fn local_minima(values: &[f64]) -> Vec<usize> {
    if values.len() < 3 {
        return Vec::new();
    }
    (1..values.len() - 1)
        .filter(|&i| values[i] < values[i - 1] && values[i] < values[i + 1])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_preserves_constants() {
        let flat = vec![2.5; 40];
        let smoothed = gaussian_filter1d(&flat, 5.0);
        assert!(smoothed.iter().all(|v| (v - 2.5).abs() < 1e-12));
    }

    #[test]
    fn smoothing_preserves_mass_and_spreads_spike() {
        let mut spike = vec![0.0; 101];
        spike[50] = 1.0;
        let smoothed = gaussian_filter1d(&spike, 5.0);
        let total: f64 = smoothed.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(smoothed[50] < 1.0);
        assert!((smoothed[45] - smoothed[55]).abs() < 1e-12);
    }

    #[test]
    fn short_signals_reflect_repeatedly() {
        let smoothed = gaussian_filter1d(&[1.0, 3.0], 5.0);
        assert_eq!(smoothed.len(), 2);
        assert!(smoothed.iter().all(|v| *v > 1.0 && *v < 3.0));
    }

    #[test]
    fn gradient_of_quadratic() {
        let values: Vec<f64> = (0..6).map(|i| (i * i) as f64).collect();
        assert_eq!(gradient(&values), vec![1.0, 2.0, 4.0, 6.0, 8.0, 9.0]);
    }

    #[test]
    fn minima_skip_endpoints_and_plateaus() {
        assert_eq!(local_minima(&[0.0, 1.0, 0.5, 2.0, 1.0, 1.0, 3.0]), vec![2]);
        assert!(local_minima(&[1.0, 0.0]).is_empty());
    }
}
