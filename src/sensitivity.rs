//! Derivatives of a QP optimum with respect to its data.
//!
//! At a solution with active set `𝒜`, the optimum satisfies
//!
//! ```text
//! P x + c + A𝒜ᵀ λ = 0
//!          A𝒜 x   = b𝒜
//! ```
//!
//! Differentiating gives one linear system in the reduced KKT matrix
//! `K = [P A𝒜ᵀ; A𝒜 0]`, solved here for both directions:
//!
//! * reverse mode: `K [a_x; a_λ] = [x̄; 0]`, then `∂L/∂c = −a_x`,
//!   `∂L/∂P = −½ (a_x xᵀ + x a_xᵀ)` and `∂L/∂b𝒜 = a_λ`;
//! * forward mode: `K [dx; dλ] = [−(dP x + dc); db𝒜]`.
//!
//! `K` is singular whenever the optimum is not unique or active rows are
//! redundant. It is factorised with a small quasi-definite shift `±δ` and the
//! solves are polished by iterative refinement against the exact matrix.

use nalgebra::{DMatrix, DVector, Dyn, LU, RealField, Scalar, SimdRealField, convert};

use crate::error::{DeepcError, DeepcResult};
use crate::qp::{ActiveBound, ActiveConstraint, QpProblem, QpSolution};
use crate::rho_adapt::inf_norm;

const REFINE_REL_TOL: f64 = 1e-14;

/// The reduced KKT matrix and a factor of its regularised version.
#[derive(Debug, Clone)]
pub(crate) struct ReducedKkt<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    k: DMatrix<F>,
    lu: LU<F, Dyn, Dyn>,
    n: usize,
}

impl<F> ReducedKkt<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub(crate) fn new(p: &DMatrix<F>, a: &DMatrix<F>, active: &[ActiveConstraint], delta: F) -> Option<Self> {
        let n = p.nrows();
        let dim = n + active.len();

        let mut k = DMatrix::zeros(dim, dim);
        k.view_mut((0, 0), (n, n)).copy_from(p);
        for (j, ac) in active.iter().enumerate() {
            let row = a.row(ac.row);
            k.view_mut((n + j, 0), (1, n)).copy_from(&row);
            k.view_mut((0, n + j), (n, 1)).copy_from(&row.transpose());
        }

        let mut reg = k.clone();
        for i in 0..dim {
            if i < n {
                reg[(i, i)] += delta;
            } else {
                reg[(i, i)] -= delta;
            }
        }

        let lu = reg.lu();
        if !lu.is_invertible() {
            return None;
        }
        Some(Self { k, lu, n })
    }

    pub(crate) fn num_vars(&self) -> usize {
        self.n
    }

    /// Solves `K s = rhs` through the regularised factor plus `refine_iter`
    /// refinement sweeps.
    pub(crate) fn solve(&self, rhs: &DVector<F>, refine_iter: usize) -> Option<DVector<F>> {
        let mut sol = self.lu.solve(rhs)?;
        let tol = inf_norm(rhs).max(convert(1.0)) * convert(REFINE_REL_TOL);

        for _ in 0..refine_iter {
            let res = rhs - &self.k * &sol;
            if inf_norm(&res) <= tol {
                break;
            }
            sol += self.lu.solve(&res)?;
        }

        sol.iter().all(|v| v.is_finite()).then_some(sol)
    }
}

/// Reverse-mode result for one QP.
#[derive(Debug, Clone)]
pub struct QpAdjoint<F> {
    /// Primal part `a_x` of the adjoint solve
    pub dx: DVector<F>,
    /// `∂L/∂l`, nonzero only on rows active at their lower bound (and equality rows)
    pub dl: DVector<F>,
    /// `∂L/∂u`, nonzero only on rows active at their upper bound
    pub du: DVector<F>,
}

impl<F> QpAdjoint<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn grad_c(&self) -> DVector<F> {
        -&self.dx
    }

    /// `∂L/∂P_ij` for one entry, i.e. `−½ (a_x[i] x[j] + x[i] a_x[j])`.
    pub fn grad_p_entry(&self, x: &DVector<F>, i: usize, j: usize) -> F {
        -(self.dx[i] * x[j] + x[i] * self.dx[j]) * convert(0.5)
    }

    pub fn grad_p(&self, x: &DVector<F>) -> DMatrix<F> {
        let outer = &self.dx * x.transpose();
        (&outer + outer.transpose()).scale(convert(-0.5))
    }
}

/// KKT linearisation of one solved QP.
#[derive(Debug, Clone)]
pub struct KktSensitivity<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    kkt: ReducedKkt<F>,
    active: Vec<ActiveConstraint>,
    x: DVector<F>,
    num_constraints: usize,
    refine_iter: usize,
}

impl<F> KktSensitivity<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(problem: &QpProblem<F>, solution: &QpSolution<F>, delta: F, refine_iter: usize) -> DeepcResult<Self> {
        let kkt = ReducedKkt::new(&problem.p, &problem.a, &solution.active, delta).ok_or_else(|| {
            DeepcError::Sensitivity(format!(
                "reduced KKT matrix with {} variables and {} active rows is singular",
                problem.num_vars(),
                solution.active.len()
            ))
        })?;

        Ok(Self {
            kkt,
            active: solution.active.clone(),
            x: solution.x.clone(),
            num_constraints: problem.num_constraints(),
            refine_iter,
        })
    }

    pub fn x(&self) -> &DVector<F> {
        &self.x
    }

    pub fn active(&self) -> &[ActiveConstraint] {
        &self.active
    }

    /// Pulls the cotangent `x̄ = ∂L/∂x` back onto the QP data.
    pub fn adjoint(&self, x_bar: &DVector<F>) -> DeepcResult<QpAdjoint<F>> {
        let n = self.kkt.num_vars();
        if x_bar.len() != n {
            return Err(DeepcError::shape("x_bar", (n, 1), (x_bar.len(), 1)));
        }

        let mut rhs = DVector::zeros(n + self.active.len());
        rhs.rows_mut(0, n).copy_from(x_bar);
        let sol = self.solve(&rhs)?;

        let mut dl = DVector::zeros(self.num_constraints);
        let mut du = DVector::zeros(self.num_constraints);
        for (j, ac) in self.active.iter().enumerate() {
            match ac.bound {
                ActiveBound::Upper => du[ac.row] = sol[n + j],
                ActiveBound::Lower | ActiveBound::Equality => dl[ac.row] = sol[n + j],
            }
        }

        Ok(QpAdjoint {
            dx: sol.rows(0, n).into_owned(),
            dl,
            du,
        })
    }

    /// Directional derivative of the optimum for a perturbation of the QP data.
    ///
    /// `dp_x` is the product `dP·x` at the optimum; `dl`/`du` are the bound
    /// perturbations, of which only the active side of each row matters.
    pub fn tangent(&self, dp_x: &DVector<F>, dc: &DVector<F>, dl: &DVector<F>, du: &DVector<F>) -> DeepcResult<DVector<F>> {
        let n = self.kkt.num_vars();
        let mut rhs = DVector::zeros(n + self.active.len());
        rhs.rows_mut(0, n).copy_from(&(-(dp_x + dc)));
        for (j, ac) in self.active.iter().enumerate() {
            rhs[n + j] = match ac.bound {
                ActiveBound::Upper => du[ac.row],
                ActiveBound::Lower | ActiveBound::Equality => dl[ac.row],
            };
        }

        let sol = self.solve(&rhs)?;
        Ok(sol.rows(0, n).into_owned())
    }

    fn solve(&self, rhs: &DVector<F>) -> DeepcResult<DVector<F>> {
        self.kkt
            .solve(rhs, self.refine_iter)
            .ok_or_else(|| DeepcError::Sensitivity("KKT solve produced non-finite values".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qp::{QpSettings, QpSolver};
    use approx::assert_relative_eq;

    fn solved(problem: QpProblem<f64>) -> (QpProblem<f64>, QpSolution<f64>) {
        let mut solver = QpSolver::new(problem, QpSettings::default());
        assert!(solver.solve());
        (solver.problem, solver.solution)
    }

    fn sensitivity(problem: &QpProblem<f64>, solution: &QpSolution<f64>) -> KktSensitivity<f64> {
        KktSensitivity::new(problem, solution, 1e-7, 25).unwrap()
    }

    fn scalar_qp(target: f64) -> QpProblem<f64> {
        // min (x - target)^2  s.t.  x <= 1
        QpProblem {
            p: DMatrix::from_element(1, 1, 2.0),
            c: DVector::from_element(1, -2.0 * target),
            a: DMatrix::identity(1, 1),
            l: DVector::from_element(1, -crate::qp::QP_INFTY),
            u: DVector::from_element(1, 1.0),
        }
    }

    #[test]
    fn interior_optimum_moves_with_linear_cost() {
        let (problem, solution) = solved(scalar_qp(0.25));
        let sens = sensitivity(&problem, &solution);
        let adj = sens.adjoint(&DVector::from_element(1, 1.0)).unwrap();

        // x = -c / P
        assert_relative_eq!(adj.grad_c()[0], -0.5, epsilon = 1e-9);
        assert_relative_eq!(adj.grad_p(sens.x())[(0, 0)], -0.125, epsilon = 1e-9);
        assert_relative_eq!(adj.grad_p_entry(sens.x(), 0, 0), -0.125, epsilon = 1e-9);
        assert_eq!(adj.du[0], 0.0);
    }

    #[test]
    fn active_bound_carries_the_whole_gradient() {
        let (problem, solution) = solved(scalar_qp(3.0));
        let sens = sensitivity(&problem, &solution);
        let adj = sens.adjoint(&DVector::from_element(1, 1.0)).unwrap();

        assert_relative_eq!(adj.grad_c()[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(adj.du[0], 1.0, epsilon = 1e-9);
        assert_eq!(adj.dl[0], 0.0);
    }

    #[test]
    fn equality_constraint_splits_evenly() {
        // min x1^2 + x2^2  s.t.  x1 + x2 = 1
        let problem = QpProblem {
            p: DMatrix::identity(2, 2).scale(2.0),
            c: DVector::zeros(2),
            a: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            l: DVector::from_element(1, 1.0),
            u: DVector::from_element(1, 1.0),
        };
        let (problem, solution) = solved(problem);
        let sens = sensitivity(&problem, &solution);

        let adj = sens.adjoint(&DVector::from_column_slice(&[1.0, 0.0])).unwrap();
        assert_relative_eq!(adj.dl[0], 0.5, epsilon = 1e-9);

        let dx = sens
            .tangent(
                &DVector::zeros(2),
                &DVector::zeros(2),
                &DVector::from_element(1, 1.0),
                &DVector::from_element(1, 1.0),
            )
            .unwrap();
        assert_relative_eq!(dx, DVector::from_column_slice(&[0.5, 0.5]), epsilon = 1e-9);
    }

    #[test]
    fn redundant_rows_do_not_break_the_solve() {
        // the same equality twice
        let problem = QpProblem {
            p: DMatrix::identity(2, 2).scale(2.0),
            c: DVector::zeros(2),
            a: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]),
            l: DVector::from_element(2, 1.0),
            u: DVector::from_element(2, 1.0),
        };
        let (problem, solution) = solved(problem);
        assert_relative_eq!(solution.x, DVector::from_column_slice(&[0.5, 0.5]), epsilon = 1e-6);
        let sens = sensitivity(&problem, &solution);
        let adj = sens.adjoint(&DVector::from_column_slice(&[1.0, 0.0])).unwrap();
        // only the sum of the two multipliers is determined
        assert_relative_eq!(adj.dl[0] + adj.dl[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn rejects_cotangent_of_wrong_length() {
        let (problem, solution) = solved(scalar_qp(0.25));
        let sens = sensitivity(&problem, &solution);
        assert!(matches!(
            sens.adjoint(&DVector::zeros(3)),
            Err(DeepcError::ShapeMismatch { name: "x_bar", .. })
        ));
    }
}
