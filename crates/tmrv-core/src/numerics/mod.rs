//! Numerically stable statistics shared by the fitting and coaddition code.
//!
//! All routines accept plain slices, ignore nothing silently and return
//! `Option`/`Result` instead of producing NaN surprises; callers decide
//! what an empty or degenerate input means for them.

pub mod bspline;
pub mod gaussfit;
pub mod savgol;
pub mod spline;

fn kahan_add(sum: &mut f64, correction: &mut f64, value: f64) {
    let y = value - *correction;
    let t = *sum + y;
    *correction = (t - *sum) - y;
    *sum = t;
}

/// Compensated sum of a slice.
pub fn stable_sum(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut correction = 0.0;
    for &value in values {
        kahan_add(&mut sum, &mut correction, value);
    }
    sum
}

/// Weighted mean with compensated accumulation. `None` when the inputs are
/// mismatched, empty, or the weights sum to zero.
pub fn stable_weighted_mean(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.is_empty() || values.len() != weights.len() {
        return None;
    }
    let mut num = 0.0;
    let mut num_c = 0.0;
    let mut den = 0.0;
    let mut den_c = 0.0;
    for (&value, &weight) in values.iter().zip(weights) {
        kahan_add(&mut num, &mut num_c, value * weight);
        kahan_add(&mut den, &mut den_c, weight);
    }
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

/// Inverse-variance weighted mean and its formal uncertainty sqrt(1/sum w).
///
/// With n equal errors sigma this reduces exactly to the plain mean and
/// sigma/sqrt(n). Entries with non-finite or non-positive errors are
/// skipped; `None` when nothing usable remains.
pub fn inverse_variance_mean(values: &[f64], errors: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() || values.len() != errors.len() {
        return None;
    }
    let mut num = 0.0;
    let mut num_c = 0.0;
    let mut den = 0.0;
    let mut den_c = 0.0;
    for (&value, &error) in values.iter().zip(errors) {
        if !value.is_finite() || !error.is_finite() || error <= 0.0 {
            continue;
        }
        let weight = 1.0 / (error * error);
        kahan_add(&mut num, &mut num_c, value * weight);
        kahan_add(&mut den, &mut den_c, weight);
    }
    if den <= 0.0 {
        return None;
    }
    Some((num / den, (1.0 / den).sqrt()))
}

/// Root mean square.
pub fn rms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    let mut correction = 0.0;
    for &value in values {
        kahan_add(&mut sum, &mut correction, value * value);
    }
    Some((sum / values.len() as f64).sqrt())
}

/// Error-weighted rms, sqrt(sum(x^2/e^2) / sum(1/e^2)).
pub fn weighted_rms(values: &[f64], errors: &[f64]) -> Option<f64> {
    if values.is_empty() || values.len() != errors.len() {
        return None;
    }
    let mut num = 0.0;
    let mut den = 0.0;
    for (&value, &error) in values.iter().zip(errors) {
        if !error.is_finite() || error <= 0.0 {
            continue;
        }
        let weight = 1.0 / (error * error);
        num += value * value * weight;
        den += weight;
    }
    if den <= 0.0 {
        return None;
    }
    Some((num / den).sqrt())
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(stable_sum(values) / values.len() as f64)
}

/// Standard deviation around the mean (population form, to match the
/// clipping thresholds which compare single residuals against it).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mu = mean(values)?;
    let mut sum = 0.0;
    let mut correction = 0.0;
    for &value in values {
        let d = value - mu;
        kahan_add(&mut sum, &mut correction, d * d);
    }
    Some((sum / values.len() as f64).sqrt())
}

/// Median by partial selection; reorders the slice. `None` when empty.
pub fn median_inplace(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = values[mid];
    if n % 2 == 1 {
        Some(upper)
    } else {
        let lower = values[..mid]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        Some(0.5 * (lower + upper))
    }
}

/// Quantile with linear interpolation between order statistics, the
/// convention the clipping prefilters are calibrated against. `q` in [0, 1].
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let frac = pos - lo as f64;
    if lo + 1 < sorted.len() {
        Some(sorted[lo] * (1.0 - frac) + sorted[lo + 1] * frac)
    } else {
        Some(sorted[lo])
    }
}

/// Indices that sort `values` ascending, ties broken by index so the
/// ordering is reproducible across runs.
pub fn deterministic_argsort(values: &[f64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));
    indices
}

/// Linear interpolation on a strictly increasing grid, clamped at both
/// ends. `None` for empty or mismatched grids.
pub fn interpolate_linear(x: f64, x_grid: &[f64], y_grid: &[f64]) -> Option<f64> {
    if x_grid.is_empty() || x_grid.len() != y_grid.len() {
        return None;
    }
    if x <= x_grid[0] {
        return Some(y_grid[0]);
    }
    let last = x_grid.len() - 1;
    if x >= x_grid[last] {
        return Some(y_grid[last]);
    }
    let hi = x_grid.partition_point(|&g| g < x).clamp(1, last);
    let x0 = x_grid[hi - 1];
    let x1 = x_grid[hi];
    if x1 == x0 {
        return Some(y_grid[hi]);
    }
    let t = (x - x0) / (x1 - x0);
    Some(y_grid[hi - 1] * (1.0 - t) + y_grid[hi] * t)
}

/// Symmetric first derivative on an irregular grid; one-sided at the ends.
pub fn finite_gradient(x: &[f64], y: &[f64]) -> Option<Vec<f64>> {
    let n = x.len();
    if n < 2 || y.len() != n {
        return None;
    }
    let mut dy = vec![0.0; n];
    dy[0] = (y[1] - y[0]) / (x[1] - x[0]);
    dy[n - 1] = (y[n - 1] - y[n - 2]) / (x[n - 1] - x[n - 2]);
    for i in 1..n - 1 {
        dy[i] = (y[i + 1] - y[i - 1]) / (x[i + 1] - x[i - 1]);
    }
    Some(dy)
}

/// Weighted straight-line fit y = intercept + slope * x.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub intercept: f64,
    pub slope: f64,
    /// Standard errors scaled by sqrt(reduced chi^2); an exact fit
    /// therefore reports zero uncertainty, and fewer than 3 points report
    /// NaN (no residual information).
    pub e_intercept: f64,
    pub e_slope: f64,
    pub ssr: f64,
    pub n: usize,
}

/// Fits a weighted straight line, weights 1/error^2. Entries with unusable
/// errors are skipped; `None` when fewer than 2 usable points remain or
/// the abscissae are degenerate.
pub fn weighted_line_fit(x: &[f64], y: &[f64], errors: &[f64]) -> Option<LineFit> {
    if x.len() != y.len() || x.len() != errors.len() {
        return None;
    }
    let mut s = 0.0;
    let mut sx = 0.0;
    let mut sxx = 0.0;
    let mut sy = 0.0;
    let mut sxy = 0.0;
    let mut n = 0usize;
    for i in 0..x.len() {
        if !x[i].is_finite() || !y[i].is_finite() || !errors[i].is_finite() || errors[i] <= 0.0 {
            continue;
        }
        let w = 1.0 / (errors[i] * errors[i]);
        s += w;
        sx += w * x[i];
        sxx += w * x[i] * x[i];
        sy += w * y[i];
        sxy += w * x[i] * y[i];
        n += 1;
    }
    if n < 2 {
        return None;
    }
    let delta = s * sxx - sx * sx;
    if !(delta > 0.0) {
        return None;
    }
    let intercept = (sxx * sy - sx * sxy) / delta;
    let slope = (s * sxy - sx * sy) / delta;

    let mut ssr = 0.0;
    for i in 0..x.len() {
        if !x[i].is_finite() || !y[i].is_finite() || !errors[i].is_finite() || errors[i] <= 0.0 {
            continue;
        }
        let r = (y[i] - intercept - slope * x[i]) / errors[i];
        ssr += r * r;
    }
    let scale = if n > 2 {
        (ssr / (n - 2) as f64).sqrt()
    } else {
        f64::NAN
    };
    Some(LineFit {
        intercept,
        slope,
        e_intercept: (sxx / delta).sqrt() * scale,
        e_slope: (s / delta).sqrt() * scale,
        ssr,
        n,
    })
}
