//! Gaussian-process surrogate and Expected Improvement.
//!
//! Inputs live in the unit hypercube. Targets are standardized before
//! fitting and always minimized; callers negate maximization objectives.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};

const SQRT_5: f64 = 2.236_067_977_499_79;

/// Floor on ARD lengthscales in unit-cube coordinates.
const MIN_LENGTHSCALE: f64 = 0.05;

/// Matérn 5/2 with ARD lengthscales and unit signal variance:
/// `k(r) = (1 + √5 r + 5/3 r²) exp(-√5 r)`.
fn matern52(a: &[f64], b: &[f64], lengthscales: &[f64]) -> f64 {
    let r_sq: f64 = a
        .iter()
        .zip(b)
        .zip(lengthscales)
        .map(|((x, y), l)| ((x - y) / l).powi(2))
        .sum();
    let r = r_sq.sqrt();
    (1.0 + SQRT_5 * r + 5.0 / 3.0 * r_sq) * (-SQRT_5 * r).exp()
}

pub(crate) struct GpModel {
    cholesky: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    x_train: Vec<Vec<f64>>,
    lengthscales: Vec<f64>,
    y_mean: f64,
    y_std: f64,
    /// Lowest standardized training target.
    f_best: f64,
}

impl GpModel {
    /// Fit to `(x, y)` pairs. `noise` holds per-point observation variance
    /// in target units; `base_noise` is added to every point after
    /// standardization. Returns `None` when the kernel matrix is not positive
    /// definite.
    pub(crate) fn fit(x: &[Vec<f64>], y: &[f64], noise: &[f64], base_noise: f64) -> Option<Self> {
        let n = y.len();
        if n == 0 || x.len() != n {
            return None;
        }
        let dims = x[0].len();

        let y_mean = y.iter().sum::<f64>() / n as f64;
        let y_var = if n > 1 {
            y.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            1.0
        };
        let y_std = y_var.sqrt().max(1e-10);
        let standardized: Vec<f64> = y.iter().map(|v| (v - y_mean) / y_std).collect();
        let f_best = standardized.iter().copied().fold(f64::INFINITY, f64::min);

        let lengthscales: Vec<f64> = (0..dims)
            .map(|d| {
                let mean = x.iter().map(|p| p[d]).sum::<f64>() / n as f64;
                let var = x.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n as f64;
                var.sqrt().max(MIN_LENGTHSCALE)
            })
            .collect();

        let kernel = DMatrix::from_fn(n, n, |i, j| {
            let k = matern52(&x[i], &x[j], &lengthscales);
            if i == j {
                let point_noise = noise.get(i).copied().unwrap_or(0.0) / (y_std * y_std);
                k + base_noise + point_noise
            } else {
                k
            }
        });
        let cholesky = Cholesky::new(kernel)?;
        let alpha = cholesky.solve(&DVector::from_column_slice(&standardized));

        Some(Self {
            cholesky,
            alpha,
            x_train: x.to_vec(),
            lengthscales,
            y_mean,
            y_std,
            f_best,
        })
    }

    pub(crate) fn f_best(&self) -> f64 {
        self.f_best
    }

    /// Posterior mean and standard deviation at `x`, standardized units.
    pub(crate) fn predict_standardized(&self, x: &[f64]) -> (f64, f64) {
        let k_star = DVector::from_fn(self.x_train.len(), |i, _| {
            matern52(x, &self.x_train[i], &self.lengthscales)
        });
        let mean = k_star.dot(&self.alpha);
        let v = self.cholesky.solve(&k_star);
        let var = (1.0 - k_star.dot(&v)).max(0.0);
        (mean, var.sqrt())
    }

    /// Posterior mean and variance at `x` in target units.
    pub(crate) fn predict(&self, x: &[f64]) -> (f64, f64) {
        let (mean, std) = self.predict_standardized(x);
        (
            mean * self.y_std + self.y_mean,
            (std * self.y_std).powi(2),
        )
    }
}

fn norm_pdf(z: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * z * z).exp()
}

/// Standard normal CDF via the Zelen & Severo polynomial.
fn norm_cdf(z: f64) -> f64 {
    if z < -8.0 {
        return 0.0;
    }
    if z > 8.0 {
        return 1.0;
    }
    let t = 1.0 / (1.0 + 0.231_641_9 * z.abs());
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let upper = norm_pdf(z.abs()) * poly;
    if z >= 0.0 {
        1.0 - upper
    } else {
        upper
    }
}

/// Expected Improvement below `f_best` for a minimization target.
pub(crate) fn expected_improvement(mean: f64, std: f64, f_best: f64) -> f64 {
    let gap = f_best - mean;
    if std < 1e-12 {
        return gap.max(0.0);
    }
    let z = gap / std;
    (gap * norm_cdf(z) + std * norm_pdf(z)).max(0.0)
}
