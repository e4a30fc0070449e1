//! BFGS minimization with a strong-Wolfe line search, specialized for
//! functions constrained to a convex region through a reparameterization:
//! a cheap feasibility callback steers the line search away from the edge
//! of the region, and every evaluation is memoized by exact vector
//! equality because the line search revisits points.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2};

const C1: f64 = 1.0e-4;
const C2: f64 = 0.9;

/// Tuning knobs for [`minimize`].
#[derive(Clone, Debug)]
pub struct BfgsOptions {
    /// Gradient norm below which we declare convergence.
    pub gradient_tolerance: f64,
    /// Amortized per-iteration objective progress below which we declare
    /// convergence.
    pub progress_tolerance: f64,
    /// Number of iterations the progress test amortizes over.
    pub progress_num_iters: usize,
    /// Warm-start inverse Hessian; identity if absent.
    pub init_inv_hessian: Option<Array2<f64>>,
}

impl Default for BfgsOptions {
    fn default() -> Self {
        Self {
            gradient_tolerance: 5.0e-4,
            progress_tolerance: 1.0e-6,
            progress_num_iters: 3,
            init_inv_hessian: None,
        }
    }
}

/// The minimizer found by [`minimize`].
pub struct BfgsOutcome {
    /// Final point.
    pub x: Array1<f64>,
    /// Function value at the final point.
    pub value: f64,
    /// Gradient at the final point.
    pub deriv: Array1<f64>,
    /// Final inverse-Hessian approximation, reusable as a warm start.
    pub inv_hessian: Array2<f64>,
    /// Number of distinct function evaluations performed.
    pub evaluations: usize,
}

/// Minimizes `f`, starting from `x0`. `f` returns the value and gradient;
/// `f_finite` must be a fast check of whether `f` would be finite at a
/// point.
///
/// # Errors
///
/// Fails with [`Error::NumericalFailure`] if the function is not finite at
/// `x0` or the warm-start inverse Hessian has the wrong shape; errors from
/// `f` itself are passed through.
pub fn minimize<F, G>(
    x0: Array1<f64>,
    f: F,
    f_finite: G,
    options: &BfgsOptions,
) -> Result<BfgsOutcome>
where
    F: FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>)>,
    G: Fn(&Array1<f64>) -> bool,
{
    let dim = x0.len();
    if let Some(h) = &options.init_inv_hessian {
        if h.shape() != [dim, dim] {
            return Err(Error::NumericalFailure {
                component: "bfgs",
                message: format!(
                    "warm-start inverse Hessian is {:?}, expected [{dim}, {dim}]",
                    h.shape()
                ),
            });
        }
    }
    let mut state = Bfgs {
        f,
        f_finite,
        gradient_tolerance: options.gradient_tolerance,
        progress_tolerance: options.progress_tolerance,
        progress_num_iters: options.progress_num_iters.max(1),
        cache: Vec::new(),
        evaluations: 0,
        xs: Vec::new(),
        values: Vec::new(),
        derivs: Vec::new(),
        inv_hessian: options
            .init_inv_hessian
            .clone()
            .unwrap_or_else(|| Array2::eye(dim)),
        num_restarts: 0,
        p: Array1::zeros(dim),
    };
    if !(state.f_finite)(&x0) {
        return Err(Error::NumericalFailure {
            component: "bfgs",
            message: "function is not finite at the initial point".into(),
        });
    }
    let (value0, deriv0) = state.eval(&x0)?;
    log::info!(
        "bfgs iteration 0: value {value0:.6}, gradient magnitude {:.6}",
        norm(&deriv0)
    );
    state.xs.push(x0);
    state.values.push(value0);
    state.derivs.push(deriv0);
    while !state.converged() {
        state.iterate()?;
    }
    Ok(BfgsOutcome {
        x: state.xs.last().expect("nonempty").clone(),
        value: *state.values.last().expect("nonempty"),
        deriv: state.derivs.last().expect("nonempty").clone(),
        inv_hessian: state.inv_hessian,
        evaluations: state.evaluations,
    })
}

struct Bfgs<F, G> {
    f: F,
    f_finite: G,
    gradient_tolerance: f64,
    progress_tolerance: f64,
    progress_num_iters: usize,
    cache: Vec<(Array1<f64>, f64, Array1<f64>)>,
    evaluations: usize,
    xs: Vec<Array1<f64>>,
    values: Vec<f64>,
    derivs: Vec<Array1<f64>>,
    inv_hessian: Array2<f64>,
    num_restarts: usize,
    p: Array1<f64>,
}

impl<F, G> Bfgs<F, G>
where
    F: FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>)>,
    G: Fn(&Array1<f64>) -> bool,
{
    fn iterate(&mut self) -> Result<()> {
        self.p = -self.inv_hessian.dot(self.derivs.last().expect("nonempty"));
        let alpha = match self.line_search()? {
            Some(alpha) => alpha,
            None => {
                log::info!("restarting bfgs with unit Hessian, the line search failed");
                self.restart();
                return Ok(());
            }
        };
        let next_x = self.xs.last().expect("nonempty") + &(alpha * &self.p);
        let (next_value, next_deriv) = self.eval(&next_x)?;
        log::info!(
            "bfgs iteration {}: value {next_value:.6}, gradient magnitude {:.6}",
            self.xs.len(),
            norm(&next_deriv)
        );
        self.xs.push(next_x);
        self.values.push(next_value);
        self.derivs.push(next_deriv);
        // s_k = x_{k+1} - x_k and y_k = g_{k+1} - g_k of the BFGS update
        let s_k = alpha * &self.p;
        let y_k = self.derivs[self.derivs.len() - 1].clone() - &self.derivs[self.derivs.len() - 2];
        let ysdot = s_k.dot(&y_k);
        if ysdot <= 0.0 {
            log::warn!("restarting bfgs with unit Hessian, the curvature condition failed");
            self.restart();
            return Ok(());
        }
        let rho = 1.0 / ysdot;
        let z_k = self.inv_hessian.dot(&y_k);
        let yz = y_k.dot(&z_k);
        self.inv_hessian = &self.inv_hessian + &(outer(&s_k, &s_k) * ((ysdot + yz) * rho * rho))
            - &(outer(&z_k, &s_k) + outer(&s_k, &z_k)) * rho;
        Ok(())
    }

    fn restart(&mut self) {
        self.inv_hessian = Array2::eye(self.p.len());
        self.num_restarts += 1;
    }

    /// Algorithm 3.5 of Nocedal and Wright. Returns an alpha satisfying
    /// the strong Wolfe conditions, or `None` if the search failed.
    fn line_search(&mut self) -> Result<Option<f64>> {
        let alpha_max = 1.0e10;
        let mut alpha_i = match self.default_alpha() {
            Some(alpha) => alpha,
            None => {
                log::warn!("line search could not find a finite starting alpha");
                return Ok(None);
            }
        };
        // grow alpha gently at first, aggressively after the first increase
        let mut increase_factor = 2.0;
        let (phi_0, phi_dash_0) = self.eval_for_alpha(0.0)?;
        if phi_dash_0 >= 0.0 {
            log::warn!("line search failed, not a descent direction");
            return Ok(None);
        }
        let mut alpha_prev = 0.0;
        let mut phi_prev = phi_0;
        let mut i = 1;
        loop {
            let (phi_i, phi_dash_i) = self.eval_for_alpha(alpha_i)?;
            if phi_i > phi_0 + C1 * alpha_i * phi_dash_0 || (i > 1 && phi_i >= phi_prev) {
                return self.zoom(alpha_prev, alpha_i, phi_0, phi_dash_0);
            }
            if phi_dash_i.abs() <= -C2 * phi_dash_0 {
                log::debug!("line search accepting alpha {alpha_i}");
                return Ok(Some(alpha_i));
            }
            if phi_dash_i >= 0.0 {
                return self.zoom(alpha_i, alpha_prev, phi_0, phi_dash_0);
            }
            let mut next_alpha = alpha_i * increase_factor;
            increase_factor = 4.0;
            if next_alpha > alpha_max {
                log::warn!("line search went past the maximum alpha");
                return Ok(None);
            }
            // pull back toward alpha_i until the function is finite there
            while next_alpha > alpha_i * 1.2 && !self.finite_for_alpha(next_alpha) {
                next_alpha *= 0.9;
            }
            while next_alpha > alpha_i * 1.02 && !self.finite_for_alpha(next_alpha) {
                next_alpha *= 0.99;
            }
            log::debug!("line search increasing alpha from {alpha_i} to {next_alpha}");
            alpha_prev = alpha_i;
            phi_prev = phi_i;
            alpha_i = next_alpha;
            i += 1;
        }
    }

    /// Algorithm 3.6 of Nocedal and Wright, with the trial point a third of
    /// the way from the low end since the low end always has the better
    /// value.
    fn zoom(
        &mut self,
        mut alpha_lo: f64,
        mut alpha_hi: f64,
        phi_0: f64,
        phi_dash_0: f64,
    ) -> Result<Option<f64>> {
        let (mut phi_lo, _) = self.eval_for_alpha(alpha_lo)?;
        let min_diff = 1.0e-10 / norm(&self.p).max(1.0);
        loop {
            if (alpha_lo - alpha_hi).abs() < min_diff {
                log::warn!("line search interval [{alpha_lo}, {alpha_hi}] got too small");
                return Ok(None);
            }
            let alpha_j = alpha_lo + 0.3333 * (alpha_hi - alpha_lo);
            let (phi_j, phi_dash_j) = self.eval_for_alpha(alpha_j)?;
            if phi_j > phi_0 + C1 * alpha_j * phi_dash_0 || phi_j >= phi_lo {
                alpha_hi = alpha_j;
            } else {
                if phi_dash_j.abs() <= -C2 * phi_dash_0 {
                    log::debug!("line search accepting alpha {alpha_j}");
                    return Ok(Some(alpha_j));
                }
                if phi_dash_j * (alpha_hi - alpha_lo) >= 0.0 {
                    alpha_hi = alpha_lo;
                }
                alpha_lo = alpha_j;
                phi_lo = phi_j;
            }
        }
    }

    /// Starts at 1 and shrinks by factors of 0.9 until the function is
    /// finite at 1.5 times the result; approaching the edge of the barrier
    /// too fast leads to poor values.
    fn default_alpha(&self) -> Option<f64> {
        let min_alpha = 1.0e-10;
        let mut alpha = 1.0;
        while alpha > min_alpha && !self.finite_for_alpha(alpha * 1.5) {
            alpha *= 0.9;
        }
        (alpha > min_alpha).then_some(alpha)
    }

    fn finite_for_alpha(&self, alpha: f64) -> bool {
        let x = self.xs.last().expect("nonempty") + &(alpha * &self.p);
        (self.f_finite)(&x)
    }

    fn eval_for_alpha(&mut self, alpha: f64) -> Result<(f64, f64)> {
        let x = self.xs.last().expect("nonempty") + &(alpha * &self.p);
        let (value, deriv) = self.eval(&x)?;
        Ok((value, self.p.dot(&deriv)))
    }

    fn eval(&mut self, x: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        // exact equality on purpose; the line search recomputes cached
        // points and the caller relies on not paying for them twice
        for (cached_x, value, deriv) in &self.cache {
            if cached_x.iter().zip(x.iter()).all(|(a, b)| a == b) && cached_x.len() == x.len() {
                return Ok((*value, deriv.clone()));
            }
        }
        let (value, deriv) = (self.f)(x)?;
        self.evaluations += 1;
        self.cache.push((x.clone(), value, deriv.clone()));
        Ok((value, deriv))
    }

    fn converged(&self) -> bool {
        let gradient_magnitude = norm(self.derivs.last().expect("nonempty"));
        if gradient_magnitude < self.gradient_tolerance {
            log::info!(
                "bfgs converged on iteration {}: gradient magnitude {gradient_magnitude:.6} \
                 below tolerance {}",
                self.xs.len(),
                self.gradient_tolerance
            );
            return true;
        }
        if self.num_restarts > 1 {
            log::info!("bfgs restarted twice, declaring convergence to avoid a loop");
            return true;
        }
        let n = self.progress_num_iters;
        if self.xs.len() > n {
            let cur = self.values[self.values.len() - 1];
            let prev = self.values[self.values.len() - 1 - n];
            let change_per_iter = (prev - cur) / n as f64;
            if change_per_iter < self.progress_tolerance {
                log::info!(
                    "bfgs converged on iteration {}: objective change per iteration \
                     {change_per_iter:.3e} below tolerance {:.3e} amortized over {n} iterations",
                    self.xs.len(),
                    self.progress_tolerance
                );
                return true;
            }
        }
        false
    }
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// f(x) = a.x + x^T B x with B diagonal positive definite.
    fn quadratic(x: &Array1<f64>) -> (f64, Array1<f64>) {
        let dim = x.len();
        let a = Array1::from_iter((1..=dim).map(|i| i as f64));
        let b = Array1::from_iter((5..5 + dim).map(|i| i as f64));
        let value = a.dot(x) + x.iter().zip(&b).map(|(&xi, &bi)| bi * xi * xi).sum::<f64>();
        let deriv = &a + &(2.0 * &b * x);
        (value, deriv)
    }

    #[test]
    fn converges_on_a_quadratic_within_budget() {
        let dim = 15;
        let x0 = Array1::from_iter((10..10 + dim).map(|i| i as f64));
        let outcome = minimize(
            x0,
            |x| Ok(quadratic(x)),
            |_| true,
            &BfgsOptions::default(),
        )
        .unwrap();
        assert!(outcome.evaluations <= 40, "took {} evaluations", outcome.evaluations);
        assert!(norm(&outcome.deriv) < 5.0e-4);
        for (i, &xi) in outcome.x.iter().enumerate() {
            let expected = -((i + 1) as f64) / (2.0 * (5 + i) as f64);
            assert!((xi - expected).abs() < 1e-4, "component {i}: {xi} vs {expected}");
        }
    }

    #[test]
    fn evaluations_are_memoized() {
        let calls = Cell::new(0_usize);
        let x0 = Array1::from(vec![2.0, -3.0]);
        let outcome = minimize(
            x0,
            |x: &Array1<f64>| {
                calls.set(calls.get() + 1);
                Ok((x.dot(x), 2.0 * x))
            },
            |_| true,
            &BfgsOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.evaluations, calls.get());
        assert!(norm(&outcome.x) < 1e-3);
    }

    #[test]
    fn warm_start_shape_is_checked()  {
        let x0 = Array1::from(vec![1.0, 1.0, 1.0]);
        let options = BfgsOptions {
            init_inv_hessian: Some(Array2::eye(2)),
            ..BfgsOptions::default()
        };
        assert!(matches!(
            minimize(x0, |x| Ok((x.dot(x), 2.0 * x)), |_| true, &options),
            Err(Error::NumericalFailure { .. })
        ));
    }
}
