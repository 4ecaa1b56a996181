use log::{debug, warn};
use nalgebra::{DVector, RealField, Scalar, SimdRealField, convert};

use crate::{
    qp::{ActiveBound, ActiveConstraint, QP_INFTY, QpProblem, QpSolver, QpWorkspace, RowKind, SolveStatus},
    rho_adapt::{Residuals, RhoAdapter, inf_norm},
    sensitivity::ReducedKkt,
};

/// Smallest certificate norm for which an infeasibility test is attempted.
const CERTIFICATE_MIN_NORM: f64 = 1e-12;

impl<F> QpSolver<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Solve the linear system for the primal update and apply over-relaxation
    pub(crate) fn update_primal(&mut self) -> bool {
        let Some(cache) = self.cache.as_ref() else {
            return false;
        };
        let sigma = self.settings.sigma;
        let alpha = self.settings.alpha;
        let one: F = convert(1.0);

        // σx − c + Aᵀ(ρ∘z − y)
        let rhs = self.work.x.scale(sigma) - &self.problem.c
            + self.problem.a.tr_mul(&(self.work.z.component_mul(&cache.rho_vec) - &self.work.y));
        self.work.x_tilde = cache.kkt.solve(&rhs);
        self.work.z_tilde = &self.problem.a * &self.work.x_tilde;

        self.work.x = self.work.x_tilde.scale(alpha) + self.work.x.scale(one - alpha);
        self.work.z_relaxed = self.work.z_tilde.scale(alpha) + self.work.z.scale(one - alpha);
        true
    }

    /// Project slack variables onto the constraint box `[l, u]`
    pub(crate) fn update_slack(&mut self) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        self.work.z = &self.work.z_relaxed + self.work.y.component_div(&cache.rho_vec);
        self.work
            .z
            .zip_zip_apply(&self.problem.l, &self.problem.u, |z, min, max| *z = (*z).clamp(min, max));
    }

    /// Update next iteration of dual variables by performing the augmented lagrangian multiplier update
    pub(crate) fn update_dual(&mut self) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        self.work.y += (&self.work.z_relaxed - &self.work.z).component_mul(&cache.rho_vec);
    }

    pub(crate) fn compute_residuals(&mut self) -> Residuals<F> {
        let res = Residuals::compute(&self.problem, &self.work.x, &self.work.z, &self.work.y);
        self.work.prim_res = res.pri_res;
        self.work.dual_res = res.dual_res;
        self.work.prim_norm = res.pri_norm;
        self.work.dual_norm = res.dual_norm;
        res
    }

    /// Check for termination by comparing primal and dual residuals against
    /// mixed absolute/relative tolerances, then look for infeasibility certificates.
    pub(crate) fn termination_condition(&mut self) -> bool {
        if !self.work.iter.is_multiple_of(self.settings.check_termination.max(1)) {
            return false;
        }

        let res = self.compute_residuals();
        if !res.pri_res.is_finite() || !res.dual_res.is_finite() {
            self.work.status = SolveStatus::NumericalError;
            return true;
        }

        let eps_pri = self.settings.eps_abs + self.settings.eps_rel * res.pri_norm;
        let eps_dual = self.settings.eps_abs + self.settings.eps_rel * res.dual_norm;

        if res.pri_res <= eps_pri && res.dual_res <= eps_dual {
            self.work.status = SolveStatus::Solved;
            true
        } else if self.is_primal_infeasible() {
            self.work.status = SolveStatus::PrimalInfeasible;
            true
        } else if self.is_dual_infeasible() {
            self.work.status = SolveStatus::DualInfeasible;
            true
        } else {
            false
        }
    }

    /// `δy` certifies infeasibility when `Aᵀδy ≈ 0` and `uᵀδy₊ + lᵀδy₋ < 0`.
    pub(crate) fn is_primal_infeasible(&self) -> bool {
        let dy = &self.work.y - &self.work.y_prev;
        let norm = inf_norm(&dy);
        if norm <= convert(CERTIFICATE_MIN_NORM) {
            return false;
        }
        let eps = self.settings.eps_prim_inf * norm;
        let inf: F = convert(QP_INFTY);

        let mut support: F = convert(0.0);
        for (i, d) in dy.iter().enumerate() {
            let bound = if *d > convert(0.0) { self.problem.u[i] } else { self.problem.l[i] };
            if bound.abs() >= inf {
                // a multiplier pushing against an infinite bound rules out a certificate
                if d.abs() > eps {
                    return false;
                }
                continue;
            }
            support += bound * *d;
        }

        inf_norm(&self.problem.a.tr_mul(&dy)) <= eps && support < -eps
    }

    /// `δx` certifies unboundedness when `Pδx ≈ 0`, `cᵀδx < 0` and `Aδx` is a
    /// recession direction of `[l, u]`.
    pub(crate) fn is_dual_infeasible(&self) -> bool {
        let dx = &self.work.x - &self.work.x_prev;
        let norm = inf_norm(&dx);
        if norm <= convert(CERTIFICATE_MIN_NORM) {
            return false;
        }
        let eps = self.settings.eps_dual_inf * norm;
        let inf: F = convert(QP_INFTY);

        if inf_norm(&(&self.problem.p * &dx)) > eps || self.problem.c.dot(&dx) >= -eps {
            return false;
        }

        let adx = &self.problem.a * &dx;
        adx.iter().enumerate().all(|(i, v)| {
            let upper_ok = self.problem.u[i] >= inf || *v <= eps;
            let lower_ok = self.problem.l[i] <= -inf || *v >= -eps;
            upper_ok && lower_ok
        })
    }

    /// Rescale rho from the normalised residual ratio and refactor when it moved enough.
    pub(crate) fn adapt_rho(&mut self, adapter: &RhoAdapter<F>) {
        let res = Residuals::compute(&self.problem, &self.work.x, &self.work.z, &self.work.y);
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let update = adapter.adapt(&self.problem, self.settings.sigma, cache, &res);
        if update.applied {
            debug!(
                "rho {} -> {} at iteration {} ({} us), residuals {}/{} against {}/{}",
                update.initial_rho,
                update.final_rho,
                self.work.iter,
                update.time_us,
                res.pri_res,
                res.dual_res,
                res.pri_norm,
                res.dual_norm
            );
        }
    }

    /// Active set read off the slack/dual pair: a row is active at a bound
    /// when its multiplier outweighs the distance to that bound.
    pub(crate) fn guess_active_set(problem: &QpProblem<F>, z: &DVector<F>, y: &DVector<F>) -> Vec<ActiveConstraint> {
        let inf: F = convert(QP_INFTY);
        (0..problem.num_constraints())
            .filter_map(|row| {
                let bound = match problem.row_kind(row) {
                    RowKind::Free => return None,
                    RowKind::Equality => ActiveBound::Equality,
                    RowKind::Inequality => {
                        if problem.l[row] > -inf && z[row] - problem.l[row] < -y[row] {
                            ActiveBound::Lower
                        } else if problem.u[row] < inf && problem.u[row] - z[row] < y[row] {
                            ActiveBound::Upper
                        } else {
                            return None;
                        }
                    }
                };
                Some(ActiveConstraint { row, bound })
            })
            .collect()
    }

    /// Refine the ADMM iterate by solving the equality-constrained QP on the guessed active set.
    ///
    /// The polished point replaces the iterate only if it is at least as
    /// accurate and its multipliers have the signs the active set implies.
    pub(crate) fn polish(&mut self) -> bool {
        let n = self.problem.num_vars();
        let m = self.problem.num_constraints();
        let active = Self::guess_active_set(&self.problem, &self.work.z, &self.work.y);

        let Some(kkt) = ReducedKkt::new(&self.problem.p, &self.problem.a, &active, self.settings.delta) else {
            debug!("Polishing skipped: reduced KKT factorisation failed");
            return false;
        };

        let mut rhs = DVector::zeros(n + active.len());
        rhs.rows_mut(0, n).copy_from(&(-&self.problem.c));
        for (j, ac) in active.iter().enumerate() {
            rhs[n + j] = ac.bound_value(&self.problem);
        }
        let Some(sol) = kkt.solve(&rhs, self.settings.refine_iter) else {
            debug!("Polishing skipped: reduced KKT solve diverged");
            return false;
        };

        let x = sol.rows(0, n).into_owned();
        let mut y = DVector::zeros(m);
        for (j, ac) in active.iter().enumerate() {
            y[ac.row] = sol[n + j];
        }
        let mut z = &self.problem.a * &x;
        z.zip_zip_apply(&self.problem.l, &self.problem.u, |v, min, max| *v = (*v).clamp(min, max));

        let res = Residuals::compute(&self.problem, &x, &z, &y);
        let eps = self.settings.eps_abs;
        let accurate = res.pri_res <= self.work.prim_res.max(eps) && res.dual_res <= self.work.dual_res.max(eps);
        let signs_ok = active.iter().all(|ac| match ac.bound {
            ActiveBound::Lower => y[ac.row] <= eps,
            ActiveBound::Upper => y[ac.row] >= -eps,
            ActiveBound::Equality => true,
        });

        if !(accurate && signs_ok) {
            debug!(
                "Polishing rejected: pri {} dual {} (admm pri {} dual {})",
                res.pri_res, res.dual_res, self.work.prim_res, self.work.dual_res
            );
            return false;
        }

        self.work.x = x;
        self.work.y = y;
        self.work.z = z;
        self.work.prim_res = res.pri_res;
        self.work.dual_res = res.dual_res;
        self.solution.active = active;
        true
    }

    pub(crate) fn admm_solve(&mut self) -> bool {
        // Cold start
        self.work = QpWorkspace::zeros(self.problem.num_vars(), self.problem.num_constraints());
        self.solution.polished = false;
        self.solution.active.clear();

        let factored = match self.cache.as_mut() {
            Some(cache) if cache.rho == self.settings.rho => true,
            Some(cache) => cache.update_rho(&self.problem, self.settings.sigma, self.settings.rho),
            None => false,
        };
        if !factored {
            warn!("ADMM linear system could not be factorised");
            self.work.status = SolveStatus::NumericalError;
            self.save_solution();
            return false;
        }

        let adapter = RhoAdapter::from_settings(&self.settings);

        for _ in 0..self.settings.max_iter {
            self.work.x_prev.copy_from(&self.work.x);
            self.work.y_prev.copy_from(&self.work.y);

            if !self.update_primal() {
                self.work.status = SolveStatus::NumericalError;
                break;
            }

            // Project slack variables into feasible domain
            self.update_slack();

            // Compute next iteration of dual variables
            self.update_dual();

            self.work.iter += 1;

            if self.termination_condition() {
                break;
            }

            if self.settings.adaptive_rho
                && self.settings.adaptive_rho_interval > 0
                && self.work.iter.is_multiple_of(self.settings.adaptive_rho_interval)
            {
                self.adapt_rho(&adapter);
            }
        }

        if self.work.status == SolveStatus::Unsolved {
            self.work.status = SolveStatus::MaxIterReached;
        }

        if self.work.status == SolveStatus::Solved {
            debug!("Solver converged in {} iterations", self.work.iter);
            if self.settings.polish {
                self.solution.polished = self.polish();
            }
            if !self.solution.polished {
                self.solution.active = Self::guess_active_set(&self.problem, &self.work.z, &self.work.y);
            }
        } else {
            debug!("Solver stopped after {} iterations: {}", self.work.iter, self.work.status);
        }

        self.save_solution();
        self.work.status == SolveStatus::Solved
    }

    fn save_solution(&mut self) {
        self.solution.iter = self.work.iter;
        self.solution.status = self.work.status;
        self.solution.x = self.work.x.clone();
        self.solution.y = self.work.y.clone();
        self.solution.z = self.work.z.clone();
        self.solution.obj_val = self.problem.objective(&self.work.x);
    }
}
