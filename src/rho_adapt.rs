use std::time::Instant;

use nalgebra::{DVector, RealField, Scalar, SimdRealField, convert};

use crate::qp::{QpCache, QpProblem, QpSettings};

#[derive(Debug, Clone)]
pub struct RhoAdapter<F> {
    pub rho_min: F,
    pub rho_max: F,
    pub clip: bool,
    /// Minimum change factor that justifies a refactorisation
    pub tolerance: F,
}

/// Outcome of one adaptation attempt
#[derive(Debug, Clone)]
pub struct RhoUpdate<F> {
    pub time_us: u128,
    pub initial_rho: F,
    pub final_rho: F,
    /// Whether the cache was refactored with `final_rho`
    pub applied: bool,
}

/// Residuals and their normalisers at the current iterate.
#[derive(Debug, Clone, Copy)]
pub struct Residuals<F> {
    pub pri_res: F,
    pub dual_res: F,
    pub pri_norm: F,
    pub dual_norm: F,
}

impl<F> Residuals<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// `‖Ax − z‖∞`, `‖Px + c + Aᵀy‖∞` and the magnitudes they are compared against.
    pub fn compute(problem: &QpProblem<F>, x: &DVector<F>, z: &DVector<F>, y: &DVector<F>) -> Self {
        let ax = &problem.a * x;
        let px = &problem.p * x;
        let aty = problem.a.tr_mul(y);

        let pri_res = inf_norm(&(&ax - z));
        let dual_res = inf_norm(&(&px + &problem.c + &aty));
        let pri_norm = inf_norm(&ax).max(inf_norm(z));
        let dual_norm = inf_norm(&px).max(inf_norm(&aty)).max(inf_norm(&problem.c));

        Self {
            pri_res,
            dual_res,
            pri_norm,
            dual_norm,
        }
    }
}

pub(crate) fn inf_norm<F>(v: &DVector<F>) -> F
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    if v.is_empty() { convert(0.0) } else { v.amax() }
}

impl<F> RhoAdapter<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn from_settings(settings: &QpSettings<F>) -> Self {
        Self {
            rho_min: settings.adaptive_rho_min,
            rho_max: settings.adaptive_rho_max,
            clip: settings.adaptive_rho_enable_clipping,
            tolerance: settings.adaptive_rho_tolerance,
        }
    }

    // Predict new rho value
    pub fn predict_rho(&self, res: &Residuals<F>, current_rho: F) -> F {
        const EPS: f64 = 1e-10;

        let normalized_pri = res.pri_res / (res.pri_norm + convert(EPS));
        let normalized_dual = res.dual_res / (res.dual_norm + convert(EPS));

        let ratio = normalized_pri / (normalized_dual + convert(EPS));

        let mut new_rho = current_rho * ratio.sqrt();

        if self.clip {
            new_rho = new_rho.max(self.rho_min).min(self.rho_max);
        }

        new_rho
    }

    pub fn should_update(&self, current_rho: F, new_rho: F) -> bool {
        new_rho > current_rho * self.tolerance || new_rho < current_rho / self.tolerance
    }

    /// Predict a new rho from the current residuals and refactor the cache
    /// when the change is large enough.
    pub fn adapt(
        &self,
        problem: &QpProblem<F>,
        sigma: F,
        cache: &mut QpCache<F>,
        res: &Residuals<F>,
    ) -> RhoUpdate<F> {
        let start = Instant::now();
        let initial_rho = cache.rho;
        let new_rho = self.predict_rho(res, initial_rho);

        let applied = self.should_update(initial_rho, new_rho) && cache.update_rho(problem, sigma, new_rho);

        RhoUpdate {
            time_us: start.elapsed().as_micros(),
            initial_rho,
            final_rho: new_rho,
            applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn adapter() -> RhoAdapter<f64> {
        RhoAdapter::from_settings(&QpSettings::default())
    }

    fn residuals(pri_res: f64, dual_res: f64) -> Residuals<f64> {
        Residuals {
            pri_res,
            dual_res,
            pri_norm: 1.0,
            dual_norm: 1.0,
        }
    }

    #[test]
    fn large_primal_residual_raises_rho() {
        let rho = adapter().predict_rho(&residuals(1.0, 0.01), 0.1);
        assert_relative_eq!(rho, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn prediction_is_clipped() {
        let a = adapter();
        assert_relative_eq!(a.predict_rho(&residuals(1e20, 1.0), 1.0), a.rho_max);
        assert_relative_eq!(a.predict_rho(&residuals(1.0, 1e20), 1.0), a.rho_min);
    }

    #[test]
    fn small_changes_do_not_refactor() {
        let a = adapter();
        assert!(!a.should_update(0.1, 0.3));
        assert!(a.should_update(0.1, 0.6));
        assert!(a.should_update(0.1, 0.01));
    }

    #[test]
    fn adapt_refactors_only_when_rho_moves() {
        let problem = QpProblem {
            p: DMatrix::identity(1, 1),
            c: DVector::zeros(1),
            a: DMatrix::identity(1, 1),
            l: DVector::from_element(1, -1.0),
            u: DVector::from_element(1, 1.0),
        };
        let a = adapter();
        let mut cache = QpCache::new(&problem, 1e-6, 0.1).unwrap();

        let update = a.adapt(&problem, 1e-6, &mut cache, &residuals(1.0, 0.01));
        assert!(update.applied);
        assert_relative_eq!(update.initial_rho, 0.1);
        assert_relative_eq!(update.final_rho, 1.0, epsilon = 1e-6);
        assert_relative_eq!(cache.rho, 1.0, epsilon = 1e-6);
        assert_relative_eq!(cache.rho_vec[0], 1.0, epsilon = 1e-6);

        let update = a.adapt(&problem, 1e-6, &mut cache, &residuals(1.0, 1.0));
        assert!(!update.applied);
        assert_relative_eq!(cache.rho, 1.0, epsilon = 1e-6);
    }
}
