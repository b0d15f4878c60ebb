//! Savitzky-Golay smoothing.
//!
//! Local polynomial least squares over a sliding odd window; interior pixels
//! share one convolution kernel, the edge pixels re-evaluate the first and
//! last window fits at their own abscissa so no samples are dropped.

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum SavGolError {
    #[error("window must be odd and larger than the order, got window {window} order {order}")]
    BadWindow { window: usize, order: usize },
    #[error("input of {len} samples is shorter than the window {window}")]
    InputTooShort { len: usize, window: usize },
    #[error("window design matrix is singular")]
    SingularDesign,
}

/// Solves the symmetric system via Gaussian elimination with partial pivoting.
fn solve_dense(a: &mut [Vec<f64>], b: &mut [f64]) -> Option<()> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&p, &q| a[p][col].abs().total_cmp(&a[q][col].abs()))?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    for col in (0..n).rev() {
        let mut s = b[col];
        for k in col + 1..n {
            s -= a[col][k] * b[k];
        }
        b[col] = s / a[col][col];
    }
    Some(())
}

/// Least-squares polynomial coefficients for samples at abscissae `t`.
fn polyfit(t: &[f64], y: &[f64], order: usize) -> Option<Vec<f64>> {
    let n = order + 1;
    let mut normal = vec![vec![0.0; n]; n];
    let mut rhs = vec![0.0; n];
    for (&ti, &yi) in t.iter().zip(y) {
        let mut powers = vec![1.0; n];
        for j in 1..n {
            powers[j] = powers[j - 1] * ti;
        }
        for j in 0..n {
            rhs[j] += powers[j] * yi;
            for k in 0..n {
                normal[j][k] += powers[j] * powers[k];
            }
        }
    }
    solve_dense(&mut normal, &mut rhs)?;
    Some(rhs)
}

fn polyval(coeffs: &[f64], t: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * t + c)
}

/// Smooths `y` with a window of `window` samples and polynomial `order`.
pub fn savgol_smooth(y: &[f64], window: usize, order: usize) -> Result<Vec<f64>, SavGolError> {
    if window % 2 == 0 || window <= order {
        return Err(SavGolError::BadWindow { window, order });
    }
    if y.len() < window {
        return Err(SavGolError::InputTooShort {
            len: y.len(),
            window,
        });
    }
    let half = window / 2;
    let t: Vec<f64> = (0..window).map(|i| i as f64 - half as f64).collect();

    // One kernel serves every interior pixel: the center value of the window
    // fit is a fixed linear combination of the window samples.
    let kernel = center_kernel(&t, order).ok_or(SavGolError::SingularDesign)?;
    let mut out = vec![0.0; y.len()];
    for center in half..y.len() - half {
        let win = &y[center - half..center + half + 1];
        out[center] = kernel.iter().zip(win).map(|(&k, &v)| k * v).sum();
    }

    let head = polyfit(&t, &y[..window], order).ok_or(SavGolError::SingularDesign)?;
    for p in 0..half {
        out[p] = polyval(&head, p as f64 - half as f64);
    }
    let tail_start = y.len() - window;
    let tail = polyfit(&t, &y[tail_start..], order).ok_or(SavGolError::SingularDesign)?;
    for p in y.len() - half..y.len() {
        out[p] = polyval(&tail, (p - tail_start) as f64 - half as f64);
    }
    Ok(out)
}

fn center_kernel(t: &[f64], order: usize) -> Option<Vec<f64>> {
    let n = order + 1;
    let mut normal = vec![vec![0.0; n]; n];
    for &ti in t {
        let mut powers = vec![1.0; n];
        for j in 1..n {
            powers[j] = powers[j - 1] * ti;
        }
        for j in 0..n {
            for k in 0..n {
                normal[j][k] += powers[j] * powers[k];
            }
        }
    }
    let mut z = vec![0.0; n];
    z[0] = 1.0;
    solve_dense(&mut normal, &mut z)?;
    Some(
        t.iter()
            .map(|&ti| {
                let mut power = 1.0;
                let mut acc = 0.0;
                for &zj in &z {
                    acc += zj * power;
                    power *= ti;
                }
                acc
            })
            .collect(),
    )
}
