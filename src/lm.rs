//! Levenberg-Marquardt non-linear least squares
//!
//! Minimizes `sum((y - f(x; p))^2)` for models with a small, fixed number of
//! parameters. The normal equations are solved with a Cholesky factorization
//! of the damped `JᵀJ` matrix, scaled by the largest diagonal of `JᵀJ` seen
//! along the iterations.

use nalgebra::{SMatrix, SVector};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LmError {
    #[error("{points} data points cannot constrain {params} parameters")]
    TooFewPoints { points: usize, params: usize },
    #[error("abscissa and ordinate lengths differ ({0} vs {1})")]
    Length(usize, usize),
    #[error("non-finite data or model values")]
    NonFinite,
    #[error("the parameters are not constrained by the data (singular normal matrix)")]
    Singular,
    #[error("no convergence after {0} iterations")]
    NonConvergence(usize),
}
type Result<T> = std::result::Result<T, LmError>;

/// A model with `N` parameters
pub trait Model<const N: usize> {
    /// The model value at `x`
    fn evaluate(&self, x: f64, params: &[f64; N]) -> f64;
    /// The partial derivatives of the model at `x`
    fn jacobian_row(&self, x: f64, params: &[f64; N]) -> [f64; N];
}

/// Optimizer settings
#[derive(Debug, Clone)]
pub struct LmConfig {
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Relative reduction of the sum of squares below which the fit has converged
    pub ftol: f64,
    /// Relative parameter change below which the fit has converged
    pub xtol: f64,
    /// Initial damping
    pub initial_lambda: f64,
    /// Damping multiplier after a rejected step
    pub lambda_up: f64,
    /// Damping multiplier after an accepted step
    pub lambda_down: f64,
    /// Damping above which the optimizer gives up
    pub max_lambda: f64,
}
impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1.49012e-8,
            xtol: 1.49012e-8,
            initial_lambda: 1e-3,
            lambda_up: 10.,
            lambda_down: 0.1,
            max_lambda: 1e16,
        }
    }
}

/// Outcome of a successful fit
#[derive(Debug, Clone, PartialEq)]
pub struct LmReport<const N: usize> {
    /// Best-fit parameters
    pub params: [f64; N],
    /// Parameter covariance, `inv(JᵀJ)·chi2/(n-N)`, infinite if `n == N`
    pub covariance: SMatrix<f64, N, N>,
    /// Sum of squared residuals
    pub chi2: f64,
    /// Number of iterations
    pub iterations: usize,
}
impl<const N: usize> LmReport<N> {
    /// The diagonal of the covariance matrix
    pub fn variances(&self) -> [f64; N] {
        let mut variances = [0f64; N];
        variances
            .iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = self.covariance[(i, i)]);
        variances
    }
}

fn chi2<const N: usize, M: Model<N>>(model: &M, x: &[f64], y: &[f64], params: &[f64; N]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&x, &y)| {
            let r = y - model.evaluate(x, params);
            r * r
        })
        .sum()
}

/// `JᵀJ` and `Jᵀr`
fn normal_equations<const N: usize, M: Model<N>>(
    model: &M,
    x: &[f64],
    y: &[f64],
    params: &[f64; N],
) -> (SMatrix<f64, N, N>, SVector<f64, N>) {
    let mut hessian = SMatrix::<f64, N, N>::zeros();
    let mut gradient = SVector::<f64, N>::zeros();
    for (&x, &y) in x.iter().zip(y) {
        let row = SVector::<f64, N>::from(model.jacobian_row(x, params));
        let r = y - model.evaluate(x, params);
        gradient += row * r;
        hessian += row * row.transpose();
    }
    (hessian, gradient)
}

fn is_finite<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> bool {
    m.iter().all(|x| x.is_finite())
}

/// `D·M·D` with `D = diag(scale)`
fn scaled<const N: usize>(m: &SMatrix<f64, N, N>, scale: &SVector<f64, N>) -> SMatrix<f64, N, N> {
    SMatrix::<f64, N, N>::from_fn(|i, j| m[(i, j)] * scale[i] * scale[j])
}

/// Inverse of `JᵀJ`, scaled by its diagonal to keep the factorization well conditioned
///
/// `None` if a parameter is not constrained by the data.
fn inverse_normal_matrix<const N: usize>(hessian: &SMatrix<f64, N, N>) -> Option<SMatrix<f64, N, N>> {
    let diagonal = hessian.diagonal();
    let max_diagonal = diagonal.amax();
    if !(max_diagonal > 0.) || diagonal.iter().any(|&d| d <= f64::EPSILON * max_diagonal) {
        return None;
    }
    let scale = diagonal.map(|d| 1. / d.sqrt());
    let inverse = scaled(&scaled(hessian, &scale).cholesky()?.inverse(), &scale);
    is_finite(&inverse).then_some(inverse)
}

/// Fits the `model` parameters to the data `(x,y)` starting from `initial`
pub fn fit<const N: usize, M: Model<N>>(
    model: &M,
    x: &[f64],
    y: &[f64],
    initial: [f64; N],
    config: &LmConfig,
) -> Result<LmReport<N>> {
    if x.len() != y.len() {
        return Err(LmError::Length(x.len(), y.len()));
    }
    let n = x.len();
    if n < N {
        return Err(LmError::TooFewPoints {
            points: n,
            params: N,
        });
    }
    if x.iter().chain(y).chain(&initial).any(|v| !v.is_finite()) {
        return Err(LmError::NonFinite);
    }

    let mut params = initial;
    let mut current_chi2 = chi2(model, x, y, &params);
    if !current_chi2.is_finite() {
        return Err(LmError::NonFinite);
    }
    let mut lambda = config.initial_lambda;
    let mut converged = current_chi2 == 0.;
    let mut iterations = 0;
    // damping weights: the largest diagonal of `JᵀJ` met so far
    let mut damping = SVector::<f64, N>::zeros();

    while !converged && iterations < config.max_iterations {
        iterations += 1;
        let (hessian, gradient) = normal_equations(model, x, y, &params);
        if !(is_finite(&hessian) && is_finite(&gradient)) {
            return Err(LmError::NonFinite);
        }
        if gradient.amax() == 0. {
            converged = true;
            break;
        }
        damping = damping.zip_map(&hessian.diagonal(), f64::max);
        let max_damping = damping.amax();
        if !(max_damping > 0.) {
            return Err(LmError::Singular);
        }
        let scale = damping.map(|d| 1. / d.max(f64::EPSILON * max_damping).sqrt());
        let scaled_hessian = scaled(&hessian, &scale);
        let scaled_gradient = gradient.component_mul(&scale);
        loop {
            let damped = scaled_hessian + SMatrix::<f64, N, N>::identity() * lambda;
            let Some(delta) = damped
                .cholesky()
                .map(|c| c.solve(&scaled_gradient).component_mul(&scale))
            else {
                lambda *= config.lambda_up;
                if lambda > config.max_lambda {
                    return Err(LmError::Singular);
                }
                continue;
            };
            let mut trial = params;
            trial.iter_mut().zip(delta.iter()).for_each(|(p, d)| *p += d);
            let small_step = params
                .iter()
                .zip(delta.iter())
                .all(|(p, d)| d.abs() <= config.xtol * (p.abs() + config.xtol));
            let trial_chi2 = chi2(model, x, y, &trial);
            if trial_chi2.is_finite() && trial_chi2 <= current_chi2 {
                let reduction = current_chi2 - trial_chi2;
                params = trial;
                current_chi2 = trial_chi2;
                lambda = (lambda * config.lambda_down).max(f64::EPSILON);
                converged =
                    small_step || current_chi2 == 0. || reduction <= config.ftol * current_chi2;
                break;
            }
            if small_step {
                // the damped step vanished without reducing the sum of squares
                converged = true;
                break;
            }
            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                return Err(LmError::NonConvergence(iterations));
            }
        }
    }
    if !converged {
        return Err(LmError::NonConvergence(iterations));
    }

    let (hessian, _) = normal_equations(model, x, y, &params);
    let inverse = inverse_normal_matrix(&hessian).ok_or(LmError::Singular)?;
    let covariance = if n > N {
        inverse * (current_chi2 / (n - N) as f64)
    } else {
        SMatrix::<f64, N, N>::repeat(f64::INFINITY)
    };
    Ok(LmReport {
        params,
        covariance,
        chi2: current_chi2,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a·exp(b·x)
    struct Exponential;
    impl Model<2> for Exponential {
        fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64 {
            params[0] * (params[1] * x).exp()
        }
        fn jacobian_row(&self, x: f64, params: &[f64; 2]) -> [f64; 2] {
            let e = (params[1] * x).exp();
            [e, params[0] * x * e]
        }
    }

    /// y = a·x + b
    struct Line;
    impl Model<2> for Line {
        fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64 {
            params[0] * x + params[1]
        }
        fn jacobian_row(&self, x: f64, _params: &[f64; 2]) -> [f64; 2] {
            [x, 1.]
        }
    }

    #[test]
    fn exponential_decay() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.25).collect();
        let y: Vec<f64> = x.iter().map(|x| 3. * (-0.7 * x).exp()).collect();
        let report = fit(&Exponential, &x, &y, [1., -0.1], &LmConfig::default()).unwrap();
        assert!((report.params[0] - 3.).abs() < 1e-6, "{:?}", report.params);
        assert!((report.params[1] + 0.7).abs() < 1e-6, "{:?}", report.params);
        assert!(report.chi2 < 1e-12);
    }

    #[test]
    fn line_covariance() {
        let x = [0., 1., 2., 3.];
        let y = [1., 3.1, 4.9, 7.];
        let report = fit(&Line, &x, &y, [0., 0.], &LmConfig::default()).unwrap();
        // ordinary least squares: slope 1.98, intercept 1.03
        assert!((report.params[0] - 1.98).abs() < 1e-9);
        assert!((report.params[1] - 1.03).abs() < 1e-9);
        // s² = chi2/(n-2), var(slope) = s²/Sxx with Sxx = 5
        let s2 = report.chi2 / 2.;
        assert!((report.variances()[0] - s2 / 5.).abs() < 1e-9);
    }

    #[test]
    fn input_validation() {
        let config = LmConfig::default();
        assert_eq!(
            fit(&Line, &[0.], &[1.], [0., 0.], &config),
            Err(LmError::TooFewPoints {
                points: 1,
                params: 2
            })
        );
        assert_eq!(
            fit(&Line, &[0., 1.], &[1.], [0., 0.], &config),
            Err(LmError::Length(2, 1))
        );
        assert_eq!(
            fit(&Line, &[0., 1., 2.], &[1., f64::NAN, 2.], [0., 0.], &config),
            Err(LmError::NonFinite)
        );
    }

    #[test]
    fn unconstrained_parameter_is_singular() {
        // every abscissa is the same: the slope and the intercept are degenerate
        let x = [1., 1., 1.];
        let y = [2., 2., 2.];
        assert_eq!(
            fit(&Line, &x, &y, [0., 0.], &LmConfig::default()),
            Err(LmError::Singular)
        );
    }

    #[test]
    fn exhausted_iterations() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.25).collect();
        let y: Vec<f64> = x.iter().map(|x| 3. * (-0.7 * x).exp()).collect();
        let config = LmConfig {
            max_iterations: 1,
            ..Default::default()
        };
        assert_eq!(
            fit(&Exponential, &x, &y, [1., -0.1], &config),
            Err(LmError::NonConvergence(1))
        );
    }
}
