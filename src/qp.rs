// Operator-splitting QP backend: settings, cache, workspace and solution live
// side by side in one solver struct.

use std::fmt;

use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn, RealField, Scalar, SimdRealField, convert};

// Default settings
const QP_DEFAULT_RHO: f64 = 0.1;
const QP_DEFAULT_SIGMA: f64 = 1e-6;
const QP_DEFAULT_ALPHA: f64 = 1.6;
const QP_DEFAULT_EPS_ABS: f64 = 1e-5;
const QP_DEFAULT_EPS_REL: f64 = 1e-5;
const QP_DEFAULT_EPS_PRIM_INF: f64 = 1e-5;
const QP_DEFAULT_EPS_DUAL_INF: f64 = 1e-5;
const QP_DEFAULT_MAX_ITER: usize = 10000;
const QP_DEFAULT_CHECK_TERMINATION: usize = 1;
const QP_DEFAULT_ADAPTIVE_RHO: bool = true;
const QP_DEFAULT_ADAPTIVE_RHO_INTERVAL: usize = 25;
const QP_DEFAULT_ADAPTIVE_RHO_TOLERANCE: f64 = 5.0;
const QP_DEFAULT_POLISH: bool = true;
const QP_DEFAULT_DELTA: f64 = 1e-7;
const QP_DEFAULT_REFINE_ITER: usize = 25;

/// Bounds at or beyond this magnitude are treated as infinite.
pub const QP_INFTY: f64 = 1e30;

/// Step size used for rows without any finite bound.
pub(crate) const RHO_MIN: f64 = 1e-6;
pub(crate) const RHO_MAX: f64 = 1e6;
/// Equality rows get a much stiffer step size than inequality rows.
pub(crate) const RHO_EQ_OVER_RHO_INEQ: f64 = 1e3;
const RHO_EQ_TOL: f64 = 1e-12;

/// `min ½ xᵀPx + cᵀx  s.t.  l ≤ Ax ≤ u`
#[derive(Debug, Clone)]
pub struct QpProblem<F> {
    pub p: DMatrix<F>, // n * n, symmetric PSD
    pub c: DVector<F>, // n
    pub a: DMatrix<F>, // m * n
    pub l: DVector<F>, // m
    pub u: DVector<F>, // m
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Equality,
    Inequality,
    /// Both bounds infinite.
    Free,
}

impl<F> QpProblem<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn num_vars(&self) -> usize {
        self.p.nrows()
    }

    pub fn num_constraints(&self) -> usize {
        self.a.nrows()
    }

    pub fn row_kind(&self, i: usize) -> RowKind {
        let inf: F = convert(QP_INFTY);
        if self.l[i] <= -inf && self.u[i] >= inf {
            RowKind::Free
        } else if (self.u[i] - self.l[i]).abs() <= convert(RHO_EQ_TOL) {
            RowKind::Equality
        } else {
            RowKind::Inequality
        }
    }

    pub fn objective(&self, x: &DVector<F>) -> F {
        (x.transpose() * &self.p * x)[(0, 0)] * convert(0.5) + self.c.dot(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Unsolved,
    Solved,
    PrimalInfeasible,
    DualInfeasible,
    MaxIterReached,
    NumericalError,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SolveStatus::Unsolved => "unsolved",
            SolveStatus::Solved => "solved",
            SolveStatus::PrimalInfeasible => "primal infeasible",
            SolveStatus::DualInfeasible => "dual infeasible",
            SolveStatus::MaxIterReached => "maximum iterations reached",
            SolveStatus::NumericalError => "numerical error",
        };
        f.write_str(s)
    }
}

/// Which side of a constraint row holds at the solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveBound {
    Lower,
    Upper,
    Equality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveConstraint {
    pub row: usize,
    pub bound: ActiveBound,
}

impl ActiveConstraint {
    pub(crate) fn bound_value<F>(&self, problem: &QpProblem<F>) -> F
    where
        F: Scalar + Copy + SimdRealField + RealField,
    {
        match self.bound {
            ActiveBound::Upper => problem.u[self.row],
            ActiveBound::Lower | ActiveBound::Equality => problem.l[self.row],
        }
    }
}

/// User settings
#[derive(Debug, Clone)]
pub struct QpSettings<F> {
    pub rho: F,
    pub sigma: F,
    pub alpha: F,
    pub eps_abs: F,
    pub eps_rel: F,
    pub eps_prim_inf: F,
    pub eps_dual_inf: F,
    pub max_iter: usize,
    pub check_termination: usize,

    pub adaptive_rho: bool,
    pub adaptive_rho_interval: usize,
    /// Refactor only when rho moves by more than this factor
    pub adaptive_rho_tolerance: F,
    pub adaptive_rho_min: F,
    pub adaptive_rho_max: F,
    pub adaptive_rho_enable_clipping: bool,

    pub polish: bool,
    /// Regularisation of the reduced KKT system used by polishing and differentiation
    pub delta: F,
    pub refine_iter: usize,
}

impl<F> Default for QpSettings<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn default() -> Self {
        Self {
            rho: convert(QP_DEFAULT_RHO),
            sigma: convert(QP_DEFAULT_SIGMA),
            alpha: convert(QP_DEFAULT_ALPHA),
            eps_abs: convert(QP_DEFAULT_EPS_ABS),
            eps_rel: convert(QP_DEFAULT_EPS_REL),
            eps_prim_inf: convert(QP_DEFAULT_EPS_PRIM_INF),
            eps_dual_inf: convert(QP_DEFAULT_EPS_DUAL_INF),
            max_iter: QP_DEFAULT_MAX_ITER,
            check_termination: QP_DEFAULT_CHECK_TERMINATION,

            adaptive_rho: QP_DEFAULT_ADAPTIVE_RHO,
            adaptive_rho_interval: QP_DEFAULT_ADAPTIVE_RHO_INTERVAL,
            adaptive_rho_tolerance: convert(QP_DEFAULT_ADAPTIVE_RHO_TOLERANCE),
            adaptive_rho_min: convert(RHO_MIN),
            adaptive_rho_max: convert(RHO_MAX),
            adaptive_rho_enable_clipping: true,

            polish: QP_DEFAULT_POLISH,
            delta: convert(QP_DEFAULT_DELTA),
            refine_iter: QP_DEFAULT_REFINE_ITER,
        }
    }
}

impl<F> QpSettings<F> {
    pub fn update(&mut self, eps_abs: F, eps_rel: F, max_iter: usize, check_termination: usize, polish: bool) {
        self.eps_abs = eps_abs;
        self.eps_rel = eps_rel;
        self.max_iter = max_iter;
        self.check_termination = check_termination;
        self.polish = polish;
    }
}

/// Solution
#[derive(Debug, Clone)]
pub struct QpSolution<F> {
    pub iter: usize,
    pub status: SolveStatus,
    pub polished: bool,
    pub obj_val: F,
    pub x: DVector<F>, // n
    pub y: DVector<F>, // m, constraint multipliers
    pub z: DVector<F>, // m, projected constraint values
    /// Active set at the returned point
    pub active: Vec<ActiveConstraint>,
}

/// Matrices that must be recomputed with changes in rho
#[derive(Debug, Clone)]
pub struct QpCache<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub rho: F,
    pub rho_vec: DVector<F>, // m

    /// Factor of `P + σI + Aᵀ diag(ρ) A`
    pub(crate) kkt: Cholesky<F, Dyn>,
}

impl<F> QpCache<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(problem: &QpProblem<F>, sigma: F, rho: F) -> Option<Self> {
        let rho_vec = Self::rho_vector(problem, rho);
        let kkt = Self::factor(problem, sigma, &rho_vec)?;
        debug!("rho = {}", rho);
        Some(Self { rho, rho_vec, kkt })
    }

    /// Refactor for a new rho; keeps the previous factor if the new one fails.
    pub fn update_rho(&mut self, problem: &QpProblem<F>, sigma: F, rho: F) -> bool {
        let rho_vec = Self::rho_vector(problem, rho);
        match Self::factor(problem, sigma, &rho_vec) {
            Some(kkt) => {
                self.rho = rho;
                self.rho_vec = rho_vec;
                self.kkt = kkt;
                true
            }
            None => false,
        }
    }

    fn rho_vector(problem: &QpProblem<F>, rho: F) -> DVector<F> {
        DVector::from_fn(problem.num_constraints(), |i, _| match problem.row_kind(i) {
            RowKind::Free => convert(RHO_MIN),
            RowKind::Equality => rho * convert(RHO_EQ_OVER_RHO_INEQ),
            RowKind::Inequality => rho,
        })
    }

    fn factor(problem: &QpProblem<F>, sigma: F, rho_vec: &DVector<F>) -> Option<Cholesky<F, Dyn>> {
        let n = problem.num_vars();
        let scaled_a = DMatrix::from_diagonal(rho_vec) * &problem.a;
        let kkt = &problem.p + DMatrix::<F>::identity(n, n).scale(sigma) + problem.a.tr_mul(&scaled_a);
        Cholesky::new(kkt)
    }
}

/// Problem variables
#[derive(Debug, Clone)]
pub struct QpWorkspace<F> {
    pub(crate) x: DVector<F>,         // n
    pub(crate) z: DVector<F>,         // m
    pub(crate) y: DVector<F>,         // m
    pub(crate) x_tilde: DVector<F>,   // n
    pub(crate) z_tilde: DVector<F>,   // m
    pub(crate) z_relaxed: DVector<F>, // m
    pub(crate) x_prev: DVector<F>,    // n
    pub(crate) y_prev: DVector<F>,    // m

    /// Variables for keeping track of solve status
    pub(crate) prim_res: F,
    pub(crate) dual_res: F,
    pub(crate) prim_norm: F,
    pub(crate) dual_norm: F,
    pub(crate) status: SolveStatus,
    pub(crate) iter: usize,
}

impl<F> QpWorkspace<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub(crate) fn zeros(n: usize, m: usize) -> Self {
        Self {
            x: DVector::zeros(n),
            z: DVector::zeros(m),
            y: DVector::zeros(m),
            x_tilde: DVector::zeros(n),
            z_tilde: DVector::zeros(m),
            z_relaxed: DVector::zeros(m),
            x_prev: DVector::zeros(n),
            y_prev: DVector::zeros(m),
            prim_res: convert(0.0),
            dual_res: convert(0.0),
            prim_norm: convert(0.0),
            dual_norm: convert(0.0),
            status: SolveStatus::Unsolved,
            iter: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QpSolver<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub problem: QpProblem<F>,
    pub settings: QpSettings<F>,
    pub cache: Option<QpCache<F>>,
    pub solution: QpSolution<F>,
    pub(crate) work: QpWorkspace<F>,
}

impl<F> QpSolver<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Sets up the solver and factors the ADMM linear system.
    ///
    /// A factorisation failure is not reported here; `solve` then returns
    /// `false` with [`SolveStatus::NumericalError`].
    #[must_use]
    pub fn new(problem: QpProblem<F>, settings: QpSettings<F>) -> Self {
        let n = problem.num_vars();
        let m = problem.num_constraints();
        let cache = QpCache::new(&problem, settings.sigma, settings.rho);

        let solution = QpSolution {
            iter: 0,
            status: SolveStatus::Unsolved,
            polished: false,
            obj_val: convert(0.0),
            x: DVector::zeros(n),
            y: DVector::zeros(m),
            z: DVector::zeros(m),
            active: Vec::new(),
        };

        Self {
            problem,
            settings,
            cache,
            solution,
            work: QpWorkspace::zeros(n, m),
        }
    }

    /// # Solve the quadratic program
    ///
    /// Every call starts from the zero iterate, so repeated solves of the
    /// same problem return identical results.
    ///
    /// Returns whether the solver converged; the reason for termination is in
    /// `solution.status`.
    pub fn solve(&mut self) -> bool {
        self.admm_solve()
    }

    pub fn status(&self) -> SolveStatus {
        self.solution.status
    }

    pub fn get_num_iters(&self) -> usize {
        self.work.iter
    }

    pub fn get_x(&self) -> &DVector<F> {
        &self.solution.x
    }

    pub fn get_y(&self) -> &DVector<F> {
        &self.solution.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn box_qp(target: f64, upper: f64) -> QpProblem<f64> {
        // min (x - target)^2  s.t.  -upper <= x <= upper
        QpProblem {
            p: DMatrix::from_element(1, 1, 2.0),
            c: DVector::from_element(1, -2.0 * target),
            a: DMatrix::identity(1, 1),
            l: DVector::from_element(1, -upper),
            u: DVector::from_element(1, upper),
        }
    }

    #[test]
    fn clamps_to_active_bound() {
        let mut solver = QpSolver::new(box_qp(3.0, 1.0), QpSettings::default());
        assert!(solver.solve());
        assert_eq!(solver.status(), SolveStatus::Solved);
        assert!(solver.solution.polished);
        assert_relative_eq!(solver.get_x()[0], 1.0, epsilon = 1e-9);
        // multiplier of the upper bound equals the pull of the cost
        assert_relative_eq!(solver.get_y()[0], 4.0, epsilon = 1e-6);
        assert_eq!(
            solver.solution.active,
            vec![ActiveConstraint { row: 0, bound: ActiveBound::Upper }]
        );
    }

    #[test]
    fn interior_solution_has_no_active_rows() {
        let mut solver = QpSolver::new(box_qp(0.25, 1.0), QpSettings::default());
        assert!(solver.solve());
        assert_relative_eq!(solver.get_x()[0], 0.25, epsilon = 1e-9);
        assert!(solver.solution.active.is_empty());
    }

    #[test]
    fn equality_constrained_least_squares() {
        // min x1^2 + x2^2  s.t.  x1 + x2 = 1
        let problem = QpProblem {
            p: DMatrix::identity(2, 2).scale(2.0),
            c: DVector::zeros(2),
            a: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            l: DVector::from_element(1, 1.0),
            u: DVector::from_element(1, 1.0),
        };
        assert_eq!(problem.row_kind(0), RowKind::Equality);
        let mut solver = QpSolver::new(problem, QpSettings::default());
        assert!(solver.solve());
        assert_relative_eq!(solver.get_x()[0], 0.5, epsilon = 1e-9);
        assert_relative_eq!(solver.get_x()[1], 0.5, epsilon = 1e-9);
        assert_relative_eq!(solver.solution.obj_val, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn detects_primal_infeasibility() {
        // x = 2 and -1 <= x <= 1
        let problem = QpProblem {
            p: DMatrix::from_element(1, 1, 1.0),
            c: DVector::zeros(1),
            a: DMatrix::from_column_slice(2, 1, &[1.0, 1.0]),
            l: DVector::from_column_slice(&[2.0, -1.0]),
            u: DVector::from_column_slice(&[2.0, 1.0]),
        };
        let mut solver = QpSolver::new(problem, QpSettings::default());
        assert!(!solver.solve());
        assert_eq!(solver.status(), SolveStatus::PrimalInfeasible);
    }

    #[test]
    fn detects_unbounded_objective() {
        // min -x  s.t.  x >= 0
        let problem = QpProblem {
            p: DMatrix::zeros(1, 1),
            c: DVector::from_element(1, -1.0),
            a: DMatrix::identity(1, 1),
            l: DVector::from_element(1, 0.0),
            u: DVector::from_element(1, QP_INFTY),
        };
        let mut solver = QpSolver::new(problem, QpSettings::default());
        assert!(!solver.solve());
        assert_eq!(solver.status(), SolveStatus::DualInfeasible);
    }

    #[test]
    fn iteration_budget_is_reported() {
        let mut settings = QpSettings::default();
        settings.update(1e-12, 1e-12, 2, 1, false);
        let mut solver = QpSolver::new(box_qp(3.0, 1.0), settings);
        assert!(!solver.solve());
        assert_eq!(solver.status(), SolveStatus::MaxIterReached);
        assert_eq!(solver.get_num_iters(), 2);
    }

    #[test]
    fn repeated_solves_are_identical() {
        let mut solver = QpSolver::new(box_qp(3.0, 1.0), QpSettings::default());
        assert!(solver.solve());
        let first = solver.solution.x.clone();
        assert!(solver.solve());
        assert_eq!(first, solver.solution.x);
    }
}
